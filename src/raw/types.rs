//! The type table (spec §3 / §4.B). Every other component resolves type
//! references through [`super::DecodeContext::type_at`]; types themselves may
//! only reference earlier entries (spec §3 invariant 1).

use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};
use crate::reader::ByteReader;

use super::DecodeContext;

/// The on-disk type code, low 7 bits of the type-table entry's tag byte.
/// Matches `TC` in the reference implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeCode {
	ReturnAddress = 0x00,
	U08 = 0x01,
	S08 = 0x02,
	U16 = 0x03,
	S16 = 0x04,
	U32 = 0x05,
	S32 = 0x06,
	Single = 0x07,
	Double = 0x08,
	Extended = 0x09,
	String = 0x0A,
	Record = 0x0B,
	Array = 0x0C,
	Pointer = 0x0D,
	PChar = 0x0E,
	ResourcePointer = 0x0F,
	Variant = 0x10,
	S64 = 0x11,
	Char = 0x12,
	WideString = 0x13,
	WideChar = 0x14,
	ProcPtr = 0x15,
	StaticArray = 0x16,
	Set = 0x17,
	Currency = 0x18,
	Class = 0x19,
	Interface = 0x1A,
	NotificationVariant = 0x1B,
	UnicodeString = 0x1C,
	Enum = 0x81,
	Type = 0x82,
	ExtClass = 0x83,
}

impl TypeCode {
	/// Fixed storage width in bytes for scalar kinds, per spec §3's Width
	/// table; `0` for container kinds that have no uniform width.
	pub fn width(self) -> usize {
		use TypeCode::*;
		match self {
			Variant => 16,
			Char | S08 | U08 => 1,
			WideChar | S16 | U16 => 2,
			String | WideString | UnicodeString | PChar | Class | Interface | Single | S32 | U32 => 4,
			Currency | Double | S64 => 8,
			Extended => 10,
			ProcPtr | Pointer => 12,
			ReturnAddress => 28,
			_ => 0,
		}
	}
}

/// The shape-specific payload of a type-table entry (spec §3's Type
/// descriptor table).
#[derive(Debug, Clone)]
pub enum TypeKind {
	/// A scalar kind with no further payload (integers, floats, chars,
	/// strings, pointers, variants, return addresses, currency).
	Primitive,
	Class {
		name: String,
	},
	ExtClass {
		name: String,
	},
	Interface {
		guid: uuid::Uuid,
	},
	Set {
		bits: u32,
	},
	Array {
		element: u32,
	},
	StaticArray {
		element: u32,
		count: u32,
		/// Present only for format version > 22 (spec §4.B).
		offset: Option<u32>,
	},
	Record {
		members: Vec<u32>,
	},
	ProcPtr {
		void: bool,
		/// `true` = output (`var`) parameter, `false` = input.
		parameters: Vec<bool>,
	},
}

#[derive(Debug, Clone)]
pub struct TypeDef {
	pub code: TypeCode,
	pub kind: TypeKind,
	pub exported: bool,
	/// Explicit export symbol, or (for records) the synthesized `RECORD{k}`
	/// name. `None` for anonymous, non-record types.
	pub symbol: Option<String>,
	pub attributes: Vec<super::value::Attribute>,
}

/// Decodes `count` consecutive type-table entries into `ctx.types` (spec
/// §4.B).
pub fn decode_types(ctx: &mut DecodeContext, reader: &mut ByteReader, count: u32) -> Result<()> {
	for index in 0..count {
		let tag = reader.u8()?;
		let exported = tag & 0x80 != 0;
		let code_byte = tag & 0x7F;
		let code = TypeCode::try_from_primitive(code_byte).map_err(|_| Error::UnknownTypeCode { code: code_byte })?;

		let kind = match code {
			TypeCode::Class => TypeKind::Class { name: super::read_length_prefixed_ascii(reader, None)? },
			TypeCode::ExtClass => TypeKind::ExtClass { name: super::read_length_prefixed_ascii(reader, None)? },
			TypeCode::Interface => {
				let bytes: [u8; 16] = reader.read_bytes(16)?.try_into().unwrap();
				TypeKind::Interface { guid: uuid::Uuid::from_bytes_le(bytes) }
			},
			TypeCode::Set => TypeKind::Set { bits: reader.u32()? },
			TypeCode::Array => {
				let element = reader.u32()?;
				ctx.type_at(element)?;
				TypeKind::Array { element }
			},
			TypeCode::StaticArray => {
				let element = reader.u32()?;
				ctx.type_at(element)?;
				let count = reader.u32()?;
				let offset = if ctx.version > 22 { Some(reader.u32()?) } else { None };
				TypeKind::StaticArray { element, count, offset }
			},
			TypeCode::Record => {
				let member_count = reader.u32()?;
				let mut members = Vec::with_capacity(member_count as usize);
				for _ in 0..member_count {
					let member = reader.u32()?;
					ctx.type_at(member)?;
					members.push(member);
				}
				TypeKind::Record { members }
			},
			TypeCode::ProcPtr => {
				let void = reader.u8()? != 0;
				let param_count = reader.u32()?;
				let mut parameters = Vec::with_capacity(param_count as usize);
				for _ in 0..param_count {
					parameters.push(reader.u8()? != 0);
				}
				TypeKind::ProcPtr { void, parameters }
			},
			_ => TypeKind::Primitive,
		};

		// Records always carry a synthesized symbol so disassembly can name
		// them; other kinds only get one when explicitly exported.
		let symbol = if matches!(kind, TypeKind::Record { .. }) {
			Some(format!("RECORD{index}"))
		} else if exported {
			Some(super::read_length_prefixed_ascii(reader, None)?)
		} else {
			None
		};

		// Pre-21 containers additionally wrote a second, redundant name for
		// exported entries; post-21 containers dropped it.
		if exported && ctx.version <= 21 && !matches!(kind, TypeKind::Record { .. }) {
			let _legacy_name = super::read_length_prefixed_ascii(reader, None)?;
		}

		let attributes = if ctx.version >= 21 { ctx.read_attributes(reader)? } else { Vec::new() };

		ctx.types.push(TypeDef { code, kind, exported, symbol, attributes });
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raw::DecodeContext;

	fn ctx(version: u32) -> DecodeContext {
		DecodeContext::new(version, encoding_rs::WINDOWS_1252)
	}

	#[test]
	fn primitive_u32_type() {
		let mut c = ctx(23);
		let mut data = vec![TypeCode::U32 as u8];
		data.extend_from_slice(&[0u8; 4]); // attribute count = 0 (version >= 21)
		let mut r = ByteReader::new(&data);
		decode_types(&mut c, &mut r, 1).unwrap();
		assert_eq!(c.types.len(), 1);
		assert!(matches!(c.types[0].kind, TypeKind::Primitive));
		assert_eq!(c.types[0].code.width(), 4);
		assert!(c.types[0].symbol.is_none());
	}

	#[test]
	fn record_always_gets_synthetic_symbol() {
		let mut c = ctx(23);
		c.types.push(TypeDef { code: TypeCode::U32, kind: TypeKind::Primitive, exported: false, symbol: None, attributes: vec![] });
		let mut data = vec![TypeCode::Record as u8, 1, 0, 0, 0, 0, 0, 0, 0];
		data.extend_from_slice(&[0u8; 4]); // attribute count = 0
		let mut r = ByteReader::new(&data);
		decode_types(&mut c, &mut r, 1).unwrap();
		assert_eq!(c.types[1].symbol.as_deref(), Some("RECORD1"));
	}

	#[test]
	fn static_array_offset_gated_by_version() {
		let mut c = ctx(22);
		c.types.push(TypeDef { code: TypeCode::U32, kind: TypeKind::Primitive, exported: false, symbol: None, attributes: vec![] });
		let mut data = vec![TypeCode::StaticArray as u8, 0, 0, 0, 0, 3, 0, 0, 0];
		data.extend_from_slice(&[0u8; 4]); // attribute count = 0 (version >= 21)
		let mut r = ByteReader::new(&data);
		decode_types(&mut c, &mut r, 1).unwrap();
		match &c.types[1].kind {
			TypeKind::StaticArray { offset, count, .. } => {
				assert_eq!(*offset, None);
				assert_eq!(*count, 3);
			},
			_ => panic!("expected StaticArray"),
		}
	}

	#[test]
	fn unknown_code_is_rejected() {
		let mut c = ctx(23);
		let data = [0x7Eu8];
		let mut r = ByteReader::new(&data);
		assert!(decode_types(&mut c, &mut r, 1).is_err());
	}
}
