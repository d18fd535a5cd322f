//! The disassembly formatter (spec §4.I): deterministic textual rendering of
//! types, globals, external declarations and per-function instruction
//! streams with synthesized jump labels.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::Result;
use crate::raw::declaration::{CallingConvention, ExternalKind};
use crate::raw::function::{Declaration, Function};
use crate::raw::instruction::{ArithOp, CmpOp, EhSlot, Instruction, OpCode, Operand, VariantRef};
use crate::raw::types::{TypeCode, TypeDef, TypeKind};
use crate::raw::value::{Payload, Value};
use crate::unit::BytecodeUnit;

/// Renders the whole unit to a single, deterministic string (spec §4.I /
/// §8 property 6).
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn disassemble(unit: &BytecodeUnit) -> Result<String> {
	let mut out = String::new();

	render_classes(unit, &mut out);
	render_typedefs(unit, &mut out);
	render_globals(unit, &mut out);
	render_externals(unit, &mut out);

	let widths = Widths::compute(unit);
	for (index, function) in unit.functions.iter().enumerate() {
		if function.external {
			continue;
		}
		render_internal_function(unit, index, function, &widths, &mut out)?;
	}

	Ok(out)
}

fn render_classes(unit: &BytecodeUnit, out: &mut String) {
	let mut any = false;
	for ty in &unit.types {
		let name = match &ty.kind {
			TypeKind::Class { name } | TypeKind::ExtClass { name } => name,
			_ => continue,
		};
		let _ = writeln!(out, "external Class {name}");
		any = true;
	}
	if any {
		out.push('\n');
	}
}

/// A `typedef` line is emitted iff the type is a Record (always synthetically
/// named) or its symbol differs from its type code's bare name (spec
/// supplement, `_load_types`/`disassembly`).
fn render_typedefs(unit: &BytecodeUnit, out: &mut String) {
	for (index, ty) in unit.types.iter().enumerate() {
		if matches!(ty.kind, TypeKind::Class { .. } | TypeKind::ExtClass { .. }) {
			continue;
		}
		let is_record = matches!(ty.kind, TypeKind::Record { .. });
		let custom_symbol = ty.symbol.as_deref().is_some_and(|s| s != ty.code.name());
		if !is_record && !custom_symbol {
			continue;
		}
		let symbol = ty.symbol.clone().unwrap_or_else(|| ty.code.name().to_string());
		let _ = writeln!(out, "typedef {symbol} = {}", render_type(&unit.types, index as u32, false));
	}
}

fn render_globals(unit: &BytecodeUnit, out: &mut String) {
	for (index, &type_index) in unit.globals.iter().enumerate() {
		let _ = writeln!(out, "global G{index}: {}", render_type(&unit.types, type_index, false));
	}
}

fn render_externals(unit: &BytecodeUnit, out: &mut String) {
	let mut any = false;
	for function in &unit.functions {
		if !function.external {
			continue;
		}
		let _ = writeln!(out, "external {}", declaration_repr(function));
		any = true;
	}
	if any {
		out.push('\n');
	}
}

struct Widths {
	offset: usize,
	stack: usize,
	opcode: usize,
}

impl Widths {
	fn compute(unit: &BytecodeUnit) -> Self {
		let mut max_offset = unit.types.len().max(unit.globals.len());
		let mut max_stack = 0u32;
		let mut max_opcode_name = 0usize;

		for function in &unit.functions {
			let Some(body) = &function.body else { continue };
			for instruction in body {
				max_offset = max_offset.max(instruction.offset + instruction.size);
				if let Some(depth) = instruction.stack {
					max_stack = max_stack.max(depth);
				}
				max_opcode_name = max_opcode_name.max(opcode_name(&instruction.opcode).len());
			}
		}

		let offset = format!("{max_offset:X}").len();
		let stack = max_stack.to_string().len();
		Self { offset, stack, opcode: max_opcode_name }
	}
}

fn render_internal_function(
	unit: &BytecodeUnit,
	index: usize,
	function: &Function,
	widths: &Widths,
	out: &mut String,
) -> Result<()> {
	let _ = writeln!(out, "Begin {}", declaration_repr(function));

	let Some(body) = &function.body else {
		let _ = writeln!(out, "End {}", if function.void() { "Sub" } else { "Function" });
		out.push('\n');
		return Ok(());
	};

	let labels = assign_labels(body);
	for instruction in body {
		render_instruction(unit, instruction, &labels, widths, out);
	}

	let _ = writeln!(out, "End {}", if function.void() { "Sub" } else { "Function" });
	out.push('\n');
	let _ = index;
	Ok(())
}

/// Assigns `JumpDestinationNN` labels to every `jumptarget` offset, in
/// encounter order, zero-padded to the label count's width (spec §4.I).
fn assign_labels(body: &[Instruction]) -> HashMap<usize, String> {
	let targets: Vec<usize> = body.iter().filter(|i| i.jumptarget).map(|i| i.offset).collect();
	let width = targets.len().max(1).to_string().len();
	targets.into_iter().enumerate().map(|(n, offset)| (offset, format!("JumpDestination{n:0width$}"))).collect()
}

fn render_instruction(unit: &BytecodeUnit, instruction: &Instruction, labels: &HashMap<usize, String>, widths: &Widths, out: &mut String) {
	let offset = format!("{:0w$X}", instruction.offset, w = widths.offset);
	let stack = match instruction.stack {
		Some(s) => format!("{:>w$}", s, w = widths.stack),
		None => format!("{:>w$}", "?", w = widths.stack),
	};
	let name = opcode_name(&instruction.opcode);
	let body = render_operands(unit, &instruction.opcode, labels);
	let _ = writeln!(out, "{offset} {stack} {:<w$} {body}", name, w = widths.opcode);
}

fn opcode_name(op: &OpCode) -> &'static str {
	use OpCode::*;
	match op {
		Assign { .. } => "Assign",
		Calculate { .. } => "Calculate",
		Push { .. } => "Push",
		PushVar { .. } => "PushVar",
		Pop => "Pop",
		Call { .. } => "Call",
		Jump { .. } => "Jump",
		JumpTrue { .. } => "JumpTrue",
		JumpFalse { .. } => "JumpFalse",
		Ret => "Ret",
		StackType { .. } => "StackType",
		PushType { .. } => "PushType",
		Compare { .. } => "Compare",
		CallVar { .. } => "CallVar",
		SetPtr { .. } => "SetPtr",
		BooleanNot { .. } => "BooleanNot",
		Neg { .. } => "Neg",
		SetFlag { .. } => "SetFlag",
		JumpFlag { .. } => "JumpFlag",
		PushEH { .. } => "PushEH",
		PopEH { .. } => "PopEH",
		IntegerNot { .. } => "IntegerNot",
		SetCopyPtr { .. } => "SetCopyPtr",
		Inc { .. } => "Inc",
		Dec { .. } => "Dec",
		JumpPop1 { .. } => "JumpPop1",
		JumpPop2 { .. } => "JumpPop2",
		Nop => "Nop",
	}
}

fn label_or_hex(target: i64, labels: &HashMap<usize, String>) -> String {
	if target >= 0 {
		if let Some(label) = labels.get(&(target as usize)) {
			return label.clone();
		}
	}
	format!("{target:#X}")
}

fn render_operands(unit: &BytecodeUnit, op: &OpCode, labels: &HashMap<usize, String>) -> String {
	use OpCode::*;
	let ro = |o: &Operand| render_operand(unit, o);
	match op {
		Assign { dst, src } | SetPtr { dst, src } | SetCopyPtr { dst, src } => format!("{} := {}", ro(dst), ro(src)),
		Calculate { op, dst, src } => format!("{} {}= {}", ro(dst), arith_symbol(*op), ro(src)),
		Push { value } | PushVar { value } => ro(value),
		Pop | Ret | Nop => String::new(),
		Call { function } => format!("F{function}"),
		Jump { target } => label_or_hex(*target, labels),
		JumpTrue { target, value } => format!("{}, {}", label_or_hex(*target, labels), ro(value)),
		JumpFalse { target, value } => format!("{}, {}", label_or_hex(*target, labels), ro(value)),
		StackType { variant, type_index } => format!("{} as {}", render_variant(*variant), unit.types[*type_index as usize].code.name()),
		PushType { type_index } => unit.types[*type_index as usize].code.name().to_string(),
		Compare { op, dst, a, b } => format!("{} := {} {} {}", ro(dst), ro(a), cmp_symbol(*op), ro(b)),
		CallVar { target } => ro(target),
		BooleanNot { value } | Neg { value } | IntegerNot { value } | Inc { value } | Dec { value } => ro(value),
		SetFlag { value, negated } => format!("{}{}", if *negated { "!" } else { "" }, ro(value)),
		JumpFlag { target } | JumpPop1 { target } | JumpPop2 { target } => label_or_hex(*target, labels),
		PushEH { finally, catch_at, second_finally, end } => {
			let slots = [("End", end), ("SecondFinally", second_finally), ("CatchAt", catch_at), ("Finally", finally)];
			slots
				.into_iter()
				.filter_map(|(name, target)| target.map(|t| format!("{name}:{t:#X}")))
				.collect::<Vec<_>>()
				.join(" ")
		},
		PopEH { slot } => format!("End{}", eh_slot_name(*slot)),
	}
}

fn eh_slot_name(slot: EhSlot) -> &'static str {
	match slot {
		EhSlot::Try => "Try",
		EhSlot::Finally => "Finally",
		EhSlot::Catch => "Catch",
		EhSlot::SecondFinally => "SecondFinally",
	}
}

fn arith_symbol(op: ArithOp) -> &'static str {
	use ArithOp::*;
	match op {
		Add => "+",
		Sub => "-",
		Mul => "*",
		Div => "/",
		Mod => "%",
		Shl => "<<",
		Shr => ">>",
		And => "&",
		Or => "|",
		Xor => "^",
	}
}

fn cmp_symbol(op: CmpOp) -> &'static str {
	use CmpOp::*;
	match op {
		Ge => ">=",
		Le => "<=",
		Gt => ">",
		Lt => "<",
		Ne => "<>",
		Eq => "=",
		In => "in",
		Is => "is",
	}
}

fn render_variant(v: VariantRef) -> String {
	match v {
		VariantRef::Global(i) => format!("G{i}"),
		VariantRef::Local(i) => format!("L{i}"),
		VariantRef::Argument(0) => "ReturnValue".to_string(),
		VariantRef::Argument(i) => format!("Arg{i}"),
	}
}

fn render_operand(unit: &BytecodeUnit, operand: &Operand) -> String {
	match operand {
		Operand::Variant(v) => render_variant(*v),
		Operand::Value(value) => render_value(unit, value),
		Operand::IndexedByInt(v, i) => format!("{}[{}]", render_variant(*v), i),
		Operand::IndexedByVar(v, w) => format!("{}[{}]", render_variant(*v), render_variant(*w)),
	}
}

fn render_value(unit: &BytecodeUnit, value: &Value) -> String {
	match &value.payload {
		Payload::Int(i) => i.to_string(),
		Payload::Float(f) => f.to_string(),
		Payload::Text(s) => format!("{s:?}"),
		Payload::Bytes(b) => format!("{b:02X?}"),
		Payload::Function(index) => match unit.function_at(*index as u32) {
			Ok(f) => format!("@{}", f.name),
			Err(_) => format!("@F{index}"),
		},
	}
}

fn declaration_repr(function: &Function) -> String {
	match &function.declaration {
		Some(Declaration::External(decl)) => {
			let target = match &decl.kind {
				ExternalKind::Dll { module, name } => format!("{module}.{name}"),
				ExternalKind::Class { class, method } => format!("{class}.{method}"),
				ExternalKind::Interface { vtable_index } => format!("Interface@{vtable_index}"),
				ExternalKind::CastToType => "CastToType".to_string(),
				ExternalKind::SetNil => "SetNil".to_string(),
				ExternalKind::Unknown => function.name.clone(),
			};
			let cc = decl.calling_convention.map(cc_name).unwrap_or("unspecified");
			let params = render_params(&decl.parameters);
			format!("{cc} {target}({params}){}", if decl.void { "" } else { ": Result" })
		},
		Some(Declaration::Internal(decl)) => {
			let params = render_params(&decl.parameters.iter().map(|p| p.output).collect::<Vec<_>>());
			format!("{}({params}){}", function.name, if decl.void { "" } else { ": Result" })
		},
		None => function.name.clone(),
	}
}

fn render_params(outputs: &[bool]) -> String {
	outputs
		.iter()
		.enumerate()
		.map(|(i, out)| format!("{}Arg{}", if *out { "*" } else { "" }, i + 1))
		.collect::<Vec<_>>()
		.join(", ")
}

fn cc_name(cc: CallingConvention) -> &'static str {
	match cc {
		CallingConvention::Register => "register",
		CallingConvention::Pascal => "pascal",
		CallingConvention::Cdecl => "cdecl",
		CallingConvention::Stdcall => "stdcall",
		CallingConvention::Unspecified => "unspecified",
	}
}

impl TypeCode {
	pub fn name(self) -> &'static str {
		use TypeCode::*;
		match self {
			ReturnAddress => "ReturnAddress",
			U08 => "U08",
			S08 => "S08",
			U16 => "U16",
			S16 => "S16",
			U32 => "U32",
			S32 => "S32",
			Single => "Single",
			Double => "Double",
			Extended => "Extended",
			S64 => "S64",
			Char => "Char",
			WideChar => "WideChar",
			String => "String",
			WideString => "WideString",
			Record => "Record",
			Array => "Array",
			Class => "Class",
			Set => "Set",
			StaticArray => "StaticArray",
			Pointer => "Pointer",
			Variant => "Variant",
			ProcPtr => "ProcPtr",
			Currency => "Currency",
			Interface => "Interface",
			Enum => "Enum",
			Type => "Type",
			ResourcePointer => "ResourcePointer",
			UnicodeString => "UnicodeString",
			PChar => "PChar",
			ExtClass => "ExtClass",
		}
	}
}

/// Renders a type reference for `typedef`/`global` lines (spec §4.I,
/// "Type rendering").
fn render_type(types: &[TypeDef], index: u32, nested: bool) -> String {
	let ty = &types[index as usize];
	match &ty.kind {
		TypeKind::Primitive => ty.code.name().to_string(),
		TypeKind::Class { name } | TypeKind::ExtClass { name } => name.clone(),
		TypeKind::Interface { guid } => format!("Interface<{guid}>"),
		TypeKind::Set { bits } => format!("set of {bits}"),
		TypeKind::Array { element } => format!("{}[]", render_type(types, *element, true)),
		TypeKind::StaticArray { element, count, .. } => format!("{}[{count}]", render_type(types, *element, true)),
		TypeKind::Record { members } => {
			let simple = !nested
				&& members.len() <= 10
				&& members.iter().all(|&m| matches!(types[m as usize].kind, TypeKind::Primitive));
			let rendered: Vec<String> = members.iter().map(|&m| render_type(types, m, true)).collect();
			if simple {
				format!("struct {{{}}}", rendered.join(", "))
			} else {
				let indented: Vec<String> = rendered.iter().map(|m| format!("    {m},")).collect();
				format!("struct {{\n{}\n}}", indented.join("\n"))
			}
		},
		TypeKind::ProcPtr { void, parameters } => {
			let kind = if *void { "procedure" } else { "function" };
			format!("{kind}({})", render_params(parameters))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::DecodeOptions;

	fn header_bytes(version: u32, count_types: u32, count_functions: u32) -> Vec<u8> {
		let mut data = Vec::new();
		data.extend_from_slice(b"IFPS");
		data.extend_from_slice(&version.to_le_bytes());
		data.extend_from_slice(&count_types.to_le_bytes());
		data.extend_from_slice(&count_functions.to_le_bytes());
		data.extend_from_slice(&0u32.to_le_bytes());
		data.extend_from_slice(&0u32.to_le_bytes());
		data.extend_from_slice(&0u32.to_le_bytes());
		data
	}

	#[test]
	fn empty_unit_disassembles_to_empty_string() {
		let data = header_bytes(12, 0, 0);
		let unit = BytecodeUnit::parse(&data, &DecodeOptions::default()).unwrap();
		assert_eq!(disassemble(&unit).unwrap(), "");
	}

	#[test]
	fn disassembly_is_deterministic() {
		let mut data = header_bytes(23, 1, 1);
		data.push(TypeCode::U32 as u8);
		data.extend_from_slice(&0u32.to_le_bytes()); // attribute count (version >= 21)
		let offset_field = data.len() + 1; // flags byte precedes the offset field
		data.push(0); // function flags: internal, not exported
		data.extend_from_slice(&0u32.to_le_bytes()); // offset (patched below)
		data.extend_from_slice(&1u32.to_le_bytes()); // length
		let ret_offset = data.len() as u32;
		data.push(0x09); // Ret
		data[offset_field..offset_field + 4].copy_from_slice(&ret_offset.to_le_bytes());
		let unit = BytecodeUnit::parse(&data, &DecodeOptions::default()).unwrap();
		let first = disassemble(&unit).unwrap();
		let second = disassemble(&unit).unwrap();
		assert_eq!(first, second);
		assert!(first.contains("Begin"));
		assert!(first.contains("Ret"));
		assert!(first.contains("End Sub"));
	}
}
