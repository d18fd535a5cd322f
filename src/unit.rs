//! The top-level object model (spec §6, "Primary output"): ties the type
//! table, global-variable table, function table and string pool together,
//! and exposes the lazily-computed, cached basic-block map per function.

use std::cell::OnceCell;

use crate::analysis::{self, BlockMap};
use crate::error::{Error, Result};
use crate::raw::function::{decode_functions, Function};
use crate::raw::types::{decode_types, TypeDef};
use crate::raw::DecodeContext;
use crate::reader::ByteReader;
use crate::DecodeOptions;

const HEADER_LEN: usize = 28;
const MIN_VERSION: u32 = 12;
const MAX_VERSION: u32 = 23;

#[derive(Debug, Clone)]
pub struct Header {
	pub version: u32,
	pub count_types: u32,
	pub count_functions: u32,
	pub count_variables: u32,
	pub entry: u32,
	pub import_size: u32,
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
fn read_header(reader: &mut ByteReader) -> Result<Header> {
	if reader.remaining_bytes() < HEADER_LEN {
		return Err(Error::TruncatedHeader);
	}
	let magic = reader.read_bytes(4)?;
	if magic != b"IFPS" {
		return Err(Error::BadMagic { found: magic.try_into().unwrap() });
	}
	let version = reader.u32()?;
	if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
		return Err(Error::UnsupportedVersion { version });
	}
	Ok(Header {
		version,
		count_types: reader.u32()?,
		count_functions: reader.u32()?,
		count_variables: reader.u32()?,
		entry: reader.u32()?,
		import_size: reader.u32()?,
	})
}

/// A global is, like an E-form return type, a raw type-table index; no
/// further metadata is carried by the format (spec §6 names only "globals
/// (ordered)" as an output, silent on the wire shape — treated here like the
/// format's other indexed-reference tables).
fn read_variables(ctx: &mut DecodeContext, reader: &mut ByteReader, count: u32) -> Result<Vec<u32>> {
	let mut globals = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let type_index = reader.u32()?;
		ctx.type_at(type_index)?;
		globals.push(type_index);
	}
	Ok(globals)
}

/// The decoded compilation unit (spec §6). Read-only once built; no mutation
/// is expected after parse+analyze completes (spec §5).
pub struct BytecodeUnit {
	pub version: u32,
	pub types: Vec<TypeDef>,
	pub globals: Vec<u32>,
	pub functions: Vec<Function>,
	pub strings: Vec<String>,
	pub entry: u32,
	block_maps: Vec<OnceCell<BlockMap>>,
}

impl BytecodeUnit {
	/// Parses a complete container from `data` (spec §6).
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn parse(data: &[u8], options: &DecodeOptions) -> Result<Self> {
		let mut reader = ByteReader::new(data);
		let header = read_header(&mut reader)?;

		let mut ctx = DecodeContext::new(header.version, options.codec);
		decode_types(&mut ctx, &mut reader, header.count_types)?;
		let globals = read_variables(&mut ctx, &mut reader, header.count_variables)?;
		let functions = decode_functions(&mut ctx, &mut reader, header.count_functions, data)?;

		let block_maps = functions.iter().map(|_| OnceCell::new()).collect();
		Ok(Self {
			version: header.version,
			types: ctx.types,
			globals,
			functions,
			strings: ctx.strings,
			entry: header.entry,
			block_maps,
		})
	}

	/// The basic-block map for `function_index`, computed on first access and
	/// cached (spec §5, §9 "lazy computation of basic blocks").
	pub fn block_map(&self, function_index: usize) -> Result<&BlockMap> {
		let function =
			self.functions.get(function_index).ok_or(Error::IndexOutOfRange { index: function_index as i64, max: self.functions.len() })?;
		let cell = &self.block_maps[function_index];
		if let Some(map) = cell.get() {
			return Ok(map);
		}
		let map = analysis::analyze(function)?;
		Ok(cell.get_or_init(|| map))
	}

	pub fn function_at(&self, index: u32) -> Result<&Function> {
		self.functions.get(index as usize).ok_or(Error::IndexOutOfRange { index: index as i64, max: self.functions.len() })
	}

	pub fn type_at(&self, index: u32) -> Result<&TypeDef> {
		self.types.get(index as usize).ok_or(Error::ForwardReference { index, table_len: self.types.len() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header_bytes(version: u32) -> Vec<u8> {
		let mut data = Vec::new();
		data.extend_from_slice(b"IFPS");
		data.extend_from_slice(&version.to_le_bytes());
		data.extend_from_slice(&0u32.to_le_bytes()); // count_types
		data.extend_from_slice(&0u32.to_le_bytes()); // count_functions
		data.extend_from_slice(&0u32.to_le_bytes()); // count_variables
		data.extend_from_slice(&0u32.to_le_bytes()); // entry
		data.extend_from_slice(&0u32.to_le_bytes()); // import_size
		data
	}

	#[test]
	fn empty_unit_parses() {
		let data = header_bytes(12);
		let unit = BytecodeUnit::parse(&data, &DecodeOptions::default()).unwrap();
		assert_eq!(unit.version, 12);
		assert!(unit.types.is_empty());
		assert!(unit.functions.is_empty());
	}

	#[test]
	fn version_below_range_is_rejected() {
		let data = header_bytes(11);
		assert!(BytecodeUnit::parse(&data, &DecodeOptions::default()).is_err());
	}

	#[test]
	fn truncated_header_is_rejected() {
		let data = vec![0u8; 10];
		assert!(BytecodeUnit::parse(&data, &DecodeOptions::default()).is_err());
	}

	#[test]
	fn bad_magic_is_rejected() {
		let mut data = header_bytes(12);
		data[0] = b'X';
		assert!(BytecodeUnit::parse(&data, &DecodeOptions::default()).is_err());
	}
}
