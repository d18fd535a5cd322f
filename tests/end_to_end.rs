//! End-to-end container scenarios, built from raw bytes (spec §8,
//! "End-to-end scenarios").

use ifps::raw::types::{TypeCode, TypeKind};
use ifps::{parse, DecodeOptions};

fn header(version: u32, count_types: u32, count_functions: u32, count_variables: u32) -> Vec<u8> {
	let mut data = Vec::new();
	data.extend_from_slice(b"IFPS");
	data.extend_from_slice(&version.to_le_bytes());
	data.extend_from_slice(&count_types.to_le_bytes());
	data.extend_from_slice(&count_functions.to_le_bytes());
	data.extend_from_slice(&count_variables.to_le_bytes());
	data.extend_from_slice(&0u32.to_le_bytes()); // entry
	data.extend_from_slice(&0u32.to_le_bytes()); // import_size
	data
}

#[test]
fn empty_unit_parses_and_disassembles_to_nothing() {
	let data = header(12, 0, 0, 0);
	let unit = parse(&data).unwrap();
	assert_eq!(unit.types.len(), 0);
	assert_eq!(unit.functions.len(), 0);
	assert_eq!(ifps::disasm::disassemble(&unit).unwrap(), "");
}

#[test]
fn version_below_supported_range_is_rejected() {
	let data = header(11, 0, 0, 0);
	assert!(parse(&data).is_err());
}

#[test]
fn version_above_supported_range_is_rejected() {
	let data = header(24, 0, 0, 0);
	assert!(parse(&data).is_err());
}

#[test]
fn type_table_with_one_non_exported_u32() {
	let mut data = header(12, 1, 0, 0);
	data.push(TypeCode::U32 as u8);
	let unit = parse(&data).unwrap();
	assert_eq!(unit.types.len(), 1);
	assert!(matches!(unit.types[0].kind, TypeKind::Primitive));
	assert_eq!(unit.types[0].code, TypeCode::U32);
	assert_eq!(unit.types[0].symbol.as_deref(), None);
}

#[test]
fn exported_record_of_u08_and_s16() {
	// types[0] = U08, types[1] = S16, types[2] = exported Record{types[0], types[1]}.
	// Version 23 (>= 21) means every type, including these two primitives,
	// carries a trailing (empty) attribute block.
	let mut data = header(23, 3, 0, 0);
	data.push(TypeCode::U08 as u8);
	data.extend_from_slice(&0u32.to_le_bytes()); // attribute count
	data.push(TypeCode::S16 as u8);
	data.extend_from_slice(&0u32.to_le_bytes()); // attribute count

	// Records never read a symbol from the wire (they always get the
	// synthesized `RECORD{k}` name), so the exported bit changes nothing
	// about how many bytes follow the member list.
	let mut record = vec![TypeCode::Record as u8 | 0x80];
	record.extend_from_slice(&2u32.to_le_bytes()); // member count
	record.extend_from_slice(&0u32.to_le_bytes()); // member -> types[0]
	record.extend_from_slice(&1u32.to_le_bytes()); // member -> types[1]
	record.extend_from_slice(&0u32.to_le_bytes()); // attribute count

	data.extend_from_slice(&record);

	let unit = parse(&data).unwrap();
	assert_eq!(unit.types.len(), 3);
	match &unit.types[2].kind {
		TypeKind::Record { members } => assert_eq!(members, &vec![0, 1]),
		other => panic!("expected Record, got {other:?}"),
	}
	// Records always get their synthetic symbol regardless of the exported
	// one (spec §3: "Records ... always receive a synthetic symbol").
	assert_eq!(unit.types[2].symbol.as_deref(), Some("RECORD2"));
}

#[test]
fn non_default_codec_is_honoured_for_string_literals() {
	let data = header(12, 0, 0, 0);
	let options = DecodeOptions { codec: encoding_rs::WINDOWS_1252 };
	let unit = ifps::BytecodeUnit::parse(&data, &options).unwrap();
	assert!(unit.strings.is_empty());
}

#[test]
fn function_with_only_ret_is_one_balanced_block() {
	// One internal, non-exported function: body is a single Ret.
	let mut data = header(12, 0, 1, 0);
	data.push(0); // flags: internal, not exported
	data.extend_from_slice(&0u32.to_le_bytes()); // offset
	data.extend_from_slice(&1u32.to_le_bytes()); // length
	data.push(0x09); // Ret, at file offset 10+28=... (offset is absolute into `data`)

	// The offset above must point at the Ret byte we just appended.
	let ret_offset = data.len() - 1;
	data[28 + 1..28 + 5].copy_from_slice(&(ret_offset as u32).to_le_bytes());

	let unit = parse(&data).unwrap();
	assert_eq!(unit.functions.len(), 1);
	let blocks = unit.block_map(0).unwrap();
	assert_eq!(blocks.blocks.len(), 1);
	let only = blocks.blocks.values().next().unwrap();
	assert_eq!(only.entry_stack, Some(0));
	assert!(only.successors.is_empty());

	let text = ifps::disasm::disassemble(&unit).unwrap();
	assert!(text.contains("Ret"));
	assert!(text.contains("End Sub"));
}
