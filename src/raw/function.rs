//! The function table (spec §4.F): per-record flags, external declarations,
//! internal bodies attached by offset/length detour, and `Call` index
//! validation.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::reader::ByteReader;

use super::declaration::{self, ExternalDecl, InternalDecl};
use super::instruction::{self, Instruction, OpCode};
use super::value::Attribute;
use super::DecodeContext;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct FunctionFlags: u8 {
		const EXTERNAL  = 0b0000_0001;
		const EXPORTED  = 0b0000_0010;
		const HAS_ATTRS = 0b0000_0100;
	}
}

#[derive(Debug, Clone)]
pub enum Declaration {
	External(ExternalDecl),
	Internal(InternalDecl),
}

#[derive(Debug, Clone)]
pub struct Function {
	/// Synthetic `F{index}` (hex, zero-padded to the table's index width)
	/// unless exported, in which case this is the exported name.
	pub name: String,
	pub exported: bool,
	pub external: bool,
	pub declaration: Option<Declaration>,
	/// `None` for external functions.
	pub body: Option<Vec<Instruction>>,
	pub attributes: Vec<Attribute>,
}

impl Function {
	pub fn void(&self) -> bool {
		match &self.declaration {
			Some(Declaration::External(d)) => d.void,
			Some(Declaration::Internal(d)) => d.void,
			None => true,
		}
	}
}

struct PendingRecord {
	flags: FunctionFlags,
	name: String,
	exported: bool,
	external: bool,
	declaration: Option<Declaration>,
	body: Option<Vec<Instruction>>,
}

/// Decodes `count` function records and resolves every `Call` instruction's
/// raw index against the resulting table (spec §4.F, last paragraph).
pub fn decode_functions(
	ctx: &mut DecodeContext,
	reader: &mut ByteReader,
	count: u32,
	body_source: &[u8],
) -> Result<Vec<Function>> {
	let width = hex_width(count);
	let mut pending = Vec::with_capacity(count as usize);

	for index in 0..count {
		let flags = FunctionFlags::from_bits_truncate(reader.u8()?);
		let external = flags.contains(FunctionFlags::EXTERNAL);
		let exported = flags.contains(FunctionFlags::EXPORTED);

		let (name, declaration, body) = if external {
			let raw_name = reader.read_length_prefixed_ascii(Some(8))?;
			let declaration = if exported {
				let blob = reader.read_length_prefixed_bytes()?;
				let mut blob_reader = ByteReader::new(blob);
				Some(Declaration::External(declaration::parse_external(&mut blob_reader, ctx.version)?))
			} else {
				None
			};
			(raw_name, declaration, None)
		} else {
			let offset = reader.u32()? as usize;
			let length = reader.u32()? as usize;

			let (name, declaration, void) = if exported {
				let name = reader.read_length_prefixed_ascii(None)?;
				let blob = reader.read_length_prefixed_bytes()?;
				let text = encoding_rs::WINDOWS_1252.decode(blob).0.into_owned();
				let decl = declaration::parse_internal(&text)?;
				let void = decl.void;
				(name, Some(Declaration::Internal(decl)), void)
			} else {
				(format!("F{:0width$X}", index, width = width), None, true)
			};

			let body_bytes = body_source
				.get(offset..offset + length)
				.ok_or(Error::IndexOutOfRange { index: offset as i64, max: body_source.len() })?;
			let mut body_reader = ByteReader::new(body_bytes);
			let mut program = instruction::decode_program(ctx, &mut body_reader, void)?;
			instruction::mark_jump_targets(&mut program, &name)?;

			(name, declaration, Some(program))
		};

		pending.push(PendingRecord { flags, name, exported, external, declaration, body });
	}

	let mut functions = Vec::with_capacity(pending.len());
	for record in pending {
		let attributes =
			if record.flags.contains(FunctionFlags::HAS_ATTRS) { ctx.read_attributes(reader)? } else { Vec::new() };
		functions.push(Function {
			name: record.name,
			exported: record.exported,
			external: record.external,
			declaration: record.declaration,
			body: record.body,
			attributes,
		});
	}

	validate_calls(&functions)?;
	Ok(functions)
}

fn validate_calls(functions: &[Function]) -> Result<()> {
	for function in functions {
		let Some(body) = &function.body else { continue };
		for instruction in body {
			if let OpCode::Call { function: target } = instruction.opcode {
				if target as usize >= functions.len() {
					return Err(Error::IndexOutOfRange { index: target as i64, max: functions.len() });
				}
			}
		}
	}
	Ok(())
}

fn hex_width(count: u32) -> usize {
	if count == 0 {
		1
	} else {
		format!("{count:X}").len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx() -> DecodeContext {
		DecodeContext::new(23, encoding_rs::WINDOWS_1252)
	}

	#[test]
	fn non_exported_internal_function_gets_hex_padded_name() {
		let mut c = ctx();
		let mut data = Vec::new();
		data.push(0u8); // flags: neither external nor exported
		data.extend_from_slice(&0u32.to_le_bytes()); // offset
		data.extend_from_slice(&1u32.to_le_bytes()); // length
		let body = [0x09u8]; // Ret
		let mut r = ByteReader::new(&data);
		let functions = decode_functions(&mut c, &mut r, 1, &body).unwrap();
		assert_eq!(functions[0].name, "F0");
		assert!(functions[0].body.is_some());
	}

	#[test]
	fn external_function_reads_eight_char_name() {
		let mut c = ctx();
		let mut data = vec![FunctionFlags::EXTERNAL.bits()];
		data.push(3);
		data.extend_from_slice(b"abc");
		let mut r = ByteReader::new(&data);
		let functions = decode_functions(&mut c, &mut r, 1, &[]).unwrap();
		assert_eq!(functions[0].name, "abc");
		assert!(functions[0].body.is_none());
	}

	#[test]
	fn call_to_out_of_range_function_is_rejected() {
		let mut c = ctx();
		let mut data = Vec::new();
		data.push(0u8);
		data.extend_from_slice(&0u32.to_le_bytes());
		data.extend_from_slice(&5u32.to_le_bytes());
		let mut body = vec![0x05u8];
		body.extend_from_slice(&99u32.to_le_bytes());
		let mut r = ByteReader::new(&data);
		assert!(decode_functions(&mut c, &mut r, 1, &body).is_err());
	}
}
