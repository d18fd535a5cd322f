//! Decoder, analyzer and disassembler for the IFPS bytecode container
//! format: a compiled unit consisting of a type table, a global-variable
//! table, a function table (external declarations or internal bytecode
//! bodies), string literals and attribute metadata.
//!
//! [`BytecodeUnit::parse`] builds the in-memory object model from raw
//! bytes; [`disasm::disassemble`] renders it back to deterministic text.
//! Control-flow and operand-stack analysis for a given function is
//! computed lazily through [`BytecodeUnit::block_map`].

pub mod analysis;
pub mod disasm;
pub mod error;
pub mod raw;
pub mod reader;
pub mod unit;
pub mod variable;

pub use error::{Error, Result};
pub use unit::BytecodeUnit;

/// Decoding knobs the caller controls; everything else in the format is
/// self-describing (spec §6, "Codec parameter").
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
	/// Codec for `String`/`PChar` payloads. UTF-16 payloads always decode as
	/// UTF-16LE regardless of this setting.
	pub codec: &'static encoding_rs::Encoding,
}

impl Default for DecodeOptions {
	fn default() -> Self {
		Self { codec: encoding_rs::UTF_8 }
	}
}

/// Parses a complete container from `data` using the default codec.
pub fn parse(data: &[u8]) -> Result<BytecodeUnit> {
	BytecodeUnit::parse(data, &DecodeOptions::default())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_codec_is_utf8() {
		assert_eq!(DecodeOptions::default().codec, encoding_rs::UTF_8);
	}

	#[test]
	fn parse_rejects_truncated_input() {
		assert!(parse(&[0u8; 4]).is_err());
	}
}
