//! The value decoder (spec §4.C): literal values embedded in type
//! attributes, function attributes and `Push`/`PushType` operands.

use crate::error::{Error, Result};
use crate::reader::ByteReader;

use super::types::TypeCode;
use super::DecodeContext;

/// A decoded literal. `type_index` is the raw index into the unit's type
/// table; the payload's shape depends on that type's code (spec §3).
#[derive(Debug, Clone)]
pub struct Value {
	pub type_index: u32,
	pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Payload {
	Int(i64),
	Float(f64),
	Text(String),
	Bytes(Vec<u8>),
	/// A `ProcPtr` literal: a raw, zero-based index into the unit's
	/// function table, resolved on demand by the caller (spec §4.C: "raw
	/// index discarded" only applies to `Call`; function-valued literals
	/// are resolved the same way, but lazily, to avoid threading a
	/// partially-built function table through value decoding).
	Function(usize),
}

#[derive(Debug, Clone)]
pub struct Attribute {
	pub name: String,
	pub fields: Vec<Value>,
}

impl DecodeContext {
	/// Reads a 4-byte LE type index, then dispatches on that type's code
	/// (spec §4.C).
	pub fn read_value(&mut self, reader: &mut ByteReader) -> Result<Value> {
		let type_index = reader.u32()?;
		let ty = self.type_at(type_index)?;
		let code = ty.code;
		let width = code.width();

		let payload = match code {
			TypeCode::U08 => Payload::Int(reader.u8()? as i64),
			TypeCode::S08 => Payload::Int(reader.i8()? as i64),
			TypeCode::U16 => Payload::Int(reader.u16()? as i64),
			TypeCode::S16 => Payload::Int(reader.i16()? as i64),
			TypeCode::U32 => Payload::Int(reader.u32()? as i64),
			TypeCode::S32 => Payload::Int(reader.i32()? as i64),
			TypeCode::S64 => Payload::Int(reader.i64()?),
			TypeCode::Single => Payload::Float(reader.f32()? as f64),
			TypeCode::Double => Payload::Float(reader.f64()?),
			TypeCode::Extended => {
				let bytes: [u8; 10] = reader.read_bytes(10)?.try_into().unwrap();
				Payload::Float(decode_extended(&bytes)?)
			},
			TypeCode::String | TypeCode::PChar => {
				Payload::Text(self.intern_string(reader.read_length_prefixed(self.codec)?))
			},
			TypeCode::WideString | TypeCode::UnicodeString => {
				Payload::Text(self.intern_string(reader.read_length_prefixed_utf16()?))
			},
			TypeCode::Char => {
				let c = reader.u8()? as char;
				Payload::Text(self.intern_string(c.to_string()))
			},
			TypeCode::WideChar => {
				let c = char::from_u32(reader.u16()? as u32).unwrap_or('\u{FFFD}');
				Payload::Text(self.intern_string(c.to_string()))
			},
			TypeCode::ProcPtr => {
				let k = reader.u32()?;
				let index = (k as usize).checked_sub(1).ok_or(Error::MalformedValue {
					reason: "ProcPtr literal index 0 has no predecessor function",
				})?;
				Payload::Function(index)
			},
			TypeCode::Set => {
				let (bits, _) = match &ty.kind {
					super::types::TypeKind::Set { bits } => (*bits, ()),
					_ => (0, ()),
				};
				let n = bits.div_ceil(8) as usize;
				let bytes = reader.read_bytes(n)?;
				let mut mask = 0u64;
				for (i, b) in bytes.iter().enumerate() {
					mask |= (*b as u64) << (i * 8);
				}
				Payload::Int(mask as i64)
			},
			TypeCode::Currency => Payload::Float(reader.u64()? as f64 / 10_000.0),
			_ if width > 0 => Payload::Bytes(reader.read_bytes(width)?.to_vec()),
			_ => return Err(Error::MalformedValue { reason: "type has zero width and no value decoder" }),
		};

		Ok(Value { type_index, payload })
	}

	/// A count-prefixed sequence of `(name, fields...)` attributes (spec
	/// §4.B/§4.F: shared between type-table entries and function records).
	pub fn read_attributes(&mut self, reader: &mut ByteReader) -> Result<Vec<Attribute>> {
		let count = reader.u32()?;
		let mut attributes = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let name = super::read_length_prefixed_ascii(reader, None)?;
			let field_count = reader.u32()?;
			let mut fields = Vec::with_capacity(field_count as usize);
			for _ in 0..field_count {
				fields.push(self.read_value(reader)?);
			}
			attributes.push(Attribute { name, fields });
		}
		Ok(attributes)
	}
}

/// Decodes an 80-bit (10-byte) extended-precision float (spec §4.A).
pub fn decode_extended(bytes: &[u8; 10]) -> Result<f64> {
	let mut buf = [0u8; 16];
	buf[..10].copy_from_slice(bytes);
	let raw = u128::from_le_bytes(buf);

	let sign = (raw >> 79) & 1;
	let exponent = ((raw >> 64) & 0x7FFF) as i32;
	let mantissa = raw & 0xFFFF_FFFF_FFFF_FFFF;
	let sign = if sign == 1 { -1.0 } else { 1.0 };

	let value = if exponent == 0 {
		if mantissa == 0 {
			return Ok(sign * 0.0);
		}
		let m = mantissa as f64 / (1u128 << 64) as f64;
		m * 2f64.powi(-16382)
	} else if exponent == 0x7FFF {
		if mantissa == 0 {
			f64::INFINITY
		} else {
			f64::NAN
		}
	} else {
		let m = mantissa as f64 / (1u128 << 64) as f64;
		m * 2f64.powi(exponent - 16383)
	};

	Ok(sign * value)
}
