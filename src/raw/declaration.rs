//! The declaration parser (spec §4.D): the textual/binary mini-grammar
//! carried by external ("F-form") and exported-internal ("E-form")
//! function records.

use crate::error::{Error, Result};
use crate::reader::ByteReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
	Register,
	Pascal,
	Cdecl,
	Stdcall,
	/// Any calling-convention byte other than 0..3 (spec §4.D: "anything
	/// else → unspecified").
	Unspecified,
}

impl CallingConvention {
	fn from_byte(b: u8) -> Self {
		match b {
			0 => Self::Register,
			1 => Self::Pascal,
			2 => Self::Cdecl,
			3 => Self::Stdcall,
			_ => Self::Unspecified,
		}
	}
}

/// What an F-form declaration binds to (spec §4.D).
#[derive(Debug, Clone)]
pub enum ExternalKind {
	Dll { module: String, name: String },
	Class { class: String, method: String },
	CastToType,
	SetNil,
	Interface { vtable_index: u32 },
	/// No recognised prefix: the blob is a bare parameter list.
	Unknown,
}

#[derive(Debug, Clone)]
pub struct ExternalDecl {
	pub kind: ExternalKind,
	pub calling_convention: Option<CallingConvention>,
	/// `true` when the function has no return value.
	pub void: bool,
	/// One entry per parameter, `true` meaning output (`var`).
	pub parameters: Vec<bool>,
	pub is_property: bool,
	pub delay_load: bool,
	pub load_with_altered_search_path: bool,
}

/// Reads the void-flag byte followed by one flag byte per remaining
/// parameter, to the end of `reader` (spec §4.D: "Parameter block").
fn read_parameters(reader: &mut ByteReader) -> Result<(bool, Vec<bool>)> {
	let void = reader.u8()? == 0;
	let mut parameters = Vec::new();
	while reader.remaining_bytes() > 0 {
		parameters.push(reader.u8()? != 0);
	}
	Ok((void, parameters))
}

fn read_pipe_terminated(reader: &mut ByteReader) -> Result<String> {
	let bytes = reader.read_terminated_array(b'|')?;
	Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Parses a complete F-form blob (spec §4.D). `reader` must be scoped to
/// exactly the declaration bytes.
pub fn parse_external(reader: &mut ByteReader, version: u32) -> Result<ExternalDecl> {
	if reader.read_if(b"dll:files:") {
		let module = reader.read_c_string(encoding_rs::WINDOWS_1252)?;
		let name = reader.read_c_string(encoding_rs::WINDOWS_1252)?;
		let calling_convention = Some(CallingConvention::from_byte(reader.u8()?));
		let (delay_load, load_with_altered_search_path) = if version >= 23 {
			(reader.u8()? != 0, reader.u8()? != 0)
		} else {
			(false, false)
		};
		let (void, parameters) = read_parameters(reader)?;
		let module = strip_dll_suffix(&module);
		return Ok(ExternalDecl {
			kind: ExternalKind::Dll { module, name },
			calling_convention,
			void,
			parameters,
			is_property: false,
			delay_load,
			load_with_altered_search_path,
		});
	}

	if reader.read_if(b"class:") {
		if reader.remaining_bytes() == 1 {
			let kind = match reader.u8()? {
				b'+' => ExternalKind::CastToType,
				b'-' => ExternalKind::SetNil,
				_ => return Err(Error::MalformedValue { reason: "unknown single-byte class: form" }),
			};
			return Ok(ExternalDecl {
				kind,
				calling_convention: Some(CallingConvention::Pascal),
				void: false,
				parameters: vec![true],
				is_property: false,
				delay_load: false,
				load_with_altered_search_path: false,
			});
		}

		let class = read_pipe_terminated(reader)?;
		let mut method = read_pipe_terminated(reader)?;
		let is_property = method.ends_with('@');
		if is_property {
			method.pop();
		}
		let calling_convention = Some(CallingConvention::from_byte(reader.u8()?));
		let (void, parameters) = read_parameters(reader)?;
		return Ok(ExternalDecl {
			kind: ExternalKind::Class { class, method },
			calling_convention,
			void,
			parameters,
			is_property,
			delay_load: false,
			load_with_altered_search_path: false,
		});
	}

	if reader.read_if(b"intf:.") {
		let vtable_index = reader.u32()?;
		let calling_convention = Some(CallingConvention::from_byte(reader.u8()?));
		let (void, parameters) = read_parameters(reader)?;
		return Ok(ExternalDecl {
			kind: ExternalKind::Interface { vtable_index },
			calling_convention,
			void,
			parameters,
			is_property: false,
			delay_load: false,
			load_with_altered_search_path: false,
		});
	}

	let (void, parameters) = read_parameters(reader)?;
	Ok(ExternalDecl {
		kind: ExternalKind::Unknown,
		calling_convention: None,
		void,
		parameters,
		is_property: false,
		delay_load: false,
		load_with_altered_search_path: false,
	})
}

fn strip_dll_suffix(module: &str) -> String {
	if module.len() >= 4 && module[module.len() - 4..].eq_ignore_ascii_case(".dll") {
		module[..module.len() - 4].to_string()
	} else {
		module.to_string()
	}
}

/// One parameter slot in an E-form declaration: an input/output flag and a
/// raw (unresolved) type-table index.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
	pub output: bool,
	pub type_index: u32,
}

#[derive(Debug, Clone)]
pub struct InternalDecl {
	pub void: bool,
	/// Raw type-table index of the return type; `None` iff `void`.
	pub result: Option<u32>,
	pub parameters: Vec<ParamSpec>,
}

/// Parses an E-form exported-internal declaration string (spec §4.D).
pub fn parse_internal(text: &str) -> Result<InternalDecl> {
	let mut tokens = text.split_whitespace();

	let first = tokens.next().ok_or(Error::MalformedValue { reason: "empty internal declaration" })?;
	let first_value: i64 =
		first.parse().map_err(|_| Error::MalformedValue { reason: "non-numeric result token" })?;
	let (void, result) = if first_value < 0 { (true, None) } else { (false, Some(first_value as u32)) };

	let mut parameters = Vec::new();
	for token in tokens {
		let (output, digits) = match token.strip_prefix('@') {
			Some(rest) => (true, rest),
			None => (false, token),
		};
		let type_index: u32 =
			digits.parse().map_err(|_| Error::MalformedValue { reason: "non-numeric parameter token" })?;
		parameters.push(ParamSpec { output, type_index });
	}

	Ok(InternalDecl { void, result, parameters })
}
