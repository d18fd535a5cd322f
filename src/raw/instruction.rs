//! The instruction decoder (spec §4.E): a 27-opcode set (plus `Nop`) with
//! four operand shapes and a stack-relative variant addressing scheme.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::reader::ByteReader;

use super::value::Value;
use super::DecodeContext;

/// A decoded operand reference to a global, local, or argument slot (spec
/// §3, "Variant reference"). Argument index 0 is the return-value slot for
/// non-void functions; that's a display convention, not decoded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantRef {
	Global(u32),
	Local(u32),
	Argument(u32),
}

/// Decodes the 32-bit stack-relative variant word (spec §3).
pub fn decode_variant_word(word: u32, void: bool) -> Result<VariantRef> {
	if word < 0x4000_0000 {
		return Ok(VariantRef::Global(word));
	}
	let rel = word as i64 - 0x6000_0000;
	Ok(if rel >= 0 {
		VariantRef::Local(rel as u32)
	} else if void {
		VariantRef::Argument((-rel) as u32)
	} else {
		VariantRef::Argument(!rel as u32)
	})
}

/// Tagged operand shape (spec §3 / §4.E "Operand decoding").
#[derive(Debug, Clone)]
pub enum Operand {
	Variant(VariantRef),
	Value(Value),
	IndexedByInt(VariantRef, i32),
	IndexedByVar(VariantRef, VariantRef),
}

fn read_variant(reader: &mut ByteReader) -> Result<u32> {
	reader.u32()
}

fn read_operand(ctx: &mut DecodeContext, reader: &mut ByteReader, void: bool) -> Result<Operand> {
	match reader.u8()? {
		0 => Ok(Operand::Variant(decode_variant_word(read_variant(reader)?, void)?)),
		1 => Ok(Operand::Value(ctx.read_value(reader)?)),
		2 => {
			let variant = decode_variant_word(read_variant(reader)?, void)?;
			let index = reader.i32()?;
			Ok(Operand::IndexedByInt(variant, index))
		},
		3 => {
			let variant = decode_variant_word(read_variant(reader)?, void)?;
			let index = decode_variant_word(read_variant(reader)?, void)?;
			Ok(Operand::IndexedByVar(variant, index))
		},
		_ => Err(Error::MalformedValue { reason: "operand-kind byte outside {0,1,2,3}" }),
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
	Add,
	Sub,
	Mul,
	Div,
	Mod,
	Shl,
	Shr,
	And,
	Or,
	Xor,
}

impl ArithOp {
	fn from_byte(b: u8) -> Result<Self> {
		use ArithOp::*;
		Ok(match b {
			0 => Add,
			1 => Sub,
			2 => Mul,
			3 => Div,
			4 => Mod,
			5 => Shl,
			6 => Shr,
			7 => And,
			8 => Or,
			9 => Xor,
			_ => return Err(Error::MalformedValue { reason: "arithmetic op byte outside 0..9" }),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
	Ge,
	Le,
	Gt,
	Lt,
	Ne,
	Eq,
	In,
	Is,
}

impl CmpOp {
	fn from_byte(b: u8) -> Result<Self> {
		use CmpOp::*;
		Ok(match b {
			0 => Ge,
			1 => Le,
			2 => Gt,
			3 => Lt,
			4 => Ne,
			5 => Eq,
			6 => In,
			7 => Is,
			_ => return Err(Error::MalformedValue { reason: "comparison op byte outside 0..7" }),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhSlot {
	Try,
	Finally,
	Catch,
	SecondFinally,
}

impl EhSlot {
	fn from_byte(b: u8) -> Result<Self> {
		use EhSlot::*;
		Ok(match b {
			0 => Try,
			1 => Finally,
			2 => Catch,
			3 => SecondFinally,
			_ => return Err(Error::MalformedValue { reason: "EH slot byte outside 0..3" }),
		})
	}
}

/// Per-opcode payload (spec §4.E's operand-layout table). Branch targets are
/// stored resolved to absolute body offsets (relative to the cursor after
/// the full instruction, including trailing operands, has been read).
#[derive(Debug, Clone)]
pub enum OpCode {
	Assign { dst: Operand, src: Operand },
	Calculate { op: ArithOp, dst: Operand, src: Operand },
	Push { value: Operand },
	PushVar { value: Operand },
	Pop,
	/// Raw, zero-based function-table index; resolved on demand by index
	/// rather than mutated in place (spec §9, "prefer stable indices").
	Call { function: u32 },
	Jump { target: i64 },
	JumpTrue { target: i64, value: Operand },
	JumpFalse { target: i64, value: Operand },
	Ret,
	StackType { variant: VariantRef, type_index: u32 },
	PushType { type_index: u32 },
	Compare { op: CmpOp, dst: Operand, a: Operand, b: Operand },
	CallVar { target: Operand },
	SetPtr { dst: Operand, src: Operand },
	BooleanNot { value: Operand },
	Neg { value: Operand },
	SetFlag { value: Operand, negated: bool },
	JumpFlag { target: i64 },
	PushEH { finally: Option<i64>, catch_at: Option<i64>, second_finally: Option<i64>, end: Option<i64> },
	PopEH { slot: EhSlot },
	IntegerNot { value: Operand },
	SetCopyPtr { dst: Operand, src: Operand },
	Inc { value: Operand },
	Dec { value: Operand },
	JumpPop1 { target: i64 },
	JumpPop2 { target: i64 },
	Nop,
}

impl OpCode {
	/// The operand-stack delta this opcode applies (spec §4.G).
	pub fn stack_delta(&self) -> i32 {
		use OpCode::*;
		match self {
			Push { .. } | PushVar { .. } | PushType { .. } => 1,
			Pop | JumpPop1 { .. } => -1,
			JumpPop2 { .. } => -2,
			_ => 0,
		}
	}

	/// `true` for instructions the CFG builder treats as hard branches: the
	/// fall-through edge is only added for conditional or non-terminal
	/// branches (spec §4.G step 2, "not the unconditional jump and not Ret").
	pub fn is_unconditional_terminator(&self) -> bool {
		matches!(self, OpCode::Jump { .. } | OpCode::Ret)
	}

	/// The single branch target, if any (`PushEH`'s four targets are
	/// handled separately since none of them is a fall-through successor).
	pub fn branch_target(&self) -> Option<i64> {
		use OpCode::*;
		match self {
			Jump { target } | JumpTrue { target, .. } | JumpFalse { target, .. } | JumpFlag { target }
			| JumpPop1 { target } | JumpPop2 { target } => Some(*target),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Instruction {
	pub offset: usize,
	pub opcode: OpCode,
	pub size: usize,
	pub jumptarget: bool,
	pub stack: Option<u32>,
}

/// Decodes a complete instruction stream from `reader` (already scoped to
/// exactly the function body, offsets relative to its start) until EOF.
pub fn decode_program(ctx: &mut DecodeContext, reader: &mut ByteReader, void: bool) -> Result<Vec<Instruction>> {
	let mut instructions = Vec::new();
	while !reader.eof() {
		let offset = reader.tell();
		let opcode = decode_one(ctx, reader, void)?;
		let size = reader.tell() - offset;
		instructions.push(Instruction { offset, opcode, size, jumptarget: false, stack: None });
	}
	Ok(instructions)
}

fn decode_one(ctx: &mut DecodeContext, reader: &mut ByteReader, void: bool) -> Result<OpCode> {
	let offset = reader.tell();
	let byte = reader.u8()?;

	Ok(match byte {
		0x00 => OpCode::Assign { dst: read_operand(ctx, reader, void)?, src: read_operand(ctx, reader, void)? },
		0x01 => {
			let op = ArithOp::from_byte(reader.u8()?)?;
			let dst = read_operand(ctx, reader, void)?;
			let src = read_operand(ctx, reader, void)?;
			OpCode::Calculate { op, dst, src }
		},
		0x02 => OpCode::Push { value: read_operand(ctx, reader, void)? },
		0x03 => OpCode::PushVar { value: read_operand(ctx, reader, void)? },
		0x04 => OpCode::Pop,
		0x05 => OpCode::Call { function: reader.u32()? },
		0x06 => {
			let rel = reader.i32()? as i64;
			OpCode::Jump { target: reader.tell() as i64 + rel }
		},
		0x07 => {
			let rel = reader.i32()? as i64;
			let value = read_operand(ctx, reader, void)?;
			OpCode::JumpTrue { target: reader.tell() as i64 + rel, value }
		},
		0x08 => {
			let rel = reader.i32()? as i64;
			let value = read_operand(ctx, reader, void)?;
			OpCode::JumpFalse { target: reader.tell() as i64 + rel, value }
		},
		0x09 => OpCode::Ret,
		0x0A => {
			let variant = decode_variant_word(read_variant(reader)?, void)?;
			let type_index = reader.u32()?;
			OpCode::StackType { variant, type_index }
		},
		0x0B => OpCode::PushType { type_index: reader.u32()? },
		0x0C => {
			let op = CmpOp::from_byte(reader.u8()?)?;
			let dst = read_operand(ctx, reader, void)?;
			let a = read_operand(ctx, reader, void)?;
			let b = read_operand(ctx, reader, void)?;
			OpCode::Compare { op, dst, a, b }
		},
		0x0D => OpCode::CallVar { target: read_operand(ctx, reader, void)? },
		0x0E => OpCode::SetPtr { dst: read_operand(ctx, reader, void)?, src: read_operand(ctx, reader, void)? },
		0x0F => OpCode::BooleanNot { value: read_operand(ctx, reader, void)? },
		0x10 => OpCode::Neg { value: read_operand(ctx, reader, void)? },
		0x11 => {
			let value = read_operand(ctx, reader, void)?;
			let negated = reader.u8()? != 0;
			OpCode::SetFlag { value, negated }
		},
		0x12 => {
			let rel = reader.i32()? as i64;
			OpCode::JumpFlag { target: reader.tell() as i64 + rel }
		},
		0x13 => {
			let raw = [reader.i32()?, reader.i32()?, reader.i32()?, reader.i32()?];
			let base = reader.tell() as i64;
			let resolve = |r: i32| if r < 0 { None } else { Some(base + r as i64) };
			OpCode::PushEH {
				finally: resolve(raw[0]),
				catch_at: resolve(raw[1]),
				second_finally: resolve(raw[2]),
				end: resolve(raw[3]),
			}
		},
		0x14 => OpCode::PopEH { slot: EhSlot::from_byte(reader.u8()?)? },
		0x15 => OpCode::IntegerNot { value: read_operand(ctx, reader, void)? },
		0x16 => OpCode::SetCopyPtr { dst: read_operand(ctx, reader, void)?, src: read_operand(ctx, reader, void)? },
		0x17 => OpCode::Inc { value: read_operand(ctx, reader, void)? },
		0x18 => OpCode::Dec { value: read_operand(ctx, reader, void)? },
		0x19 => {
			let rel = reader.i32()? as i64;
			OpCode::JumpPop1 { target: reader.tell() as i64 + rel }
		},
		0x1A => {
			let rel = reader.i32()? as i64;
			OpCode::JumpPop2 { target: reader.tell() as i64 + rel }
		},
		0xFF => OpCode::Nop,
		other => return Err(Error::UnknownOpcode { byte: other, offset }),
	})
}

/// Second pass (spec §4.E): marks every branch target's destination
/// instruction as `jumptarget`. `function` names the owning function, for
/// error context only.
pub fn mark_jump_targets(instructions: &mut [Instruction], function: &str) -> Result<()> {
	let starts: HashSet<usize> = instructions.iter().map(|i| i.offset).collect();

	let mut targets = Vec::new();
	for instruction in instructions.iter() {
		if let Some(target) = instruction.opcode.branch_target() {
			targets.push((instruction.offset, target));
		}
		if let OpCode::PushEH { finally, catch_at, second_finally, end } = &instruction.opcode {
			for target in [finally, catch_at, second_finally, end].into_iter().flatten() {
				targets.push((instruction.offset, *target));
			}
		}
	}

	for (offset, target) in targets {
		if target < 0 || !starts.contains(&(target as usize)) {
			return Err(Error::BadJumpTarget { function: function.to_string(), offset, target });
		}
	}

	let resolved: HashSet<usize> = instructions
		.iter()
		.flat_map(|i| {
			let mut v = Vec::new();
			if let Some(t) = i.opcode.branch_target() {
				v.push(t as usize);
			}
			if let OpCode::PushEH { finally, catch_at, second_finally, end } = &i.opcode {
				v.extend([finally, catch_at, second_finally, end].into_iter().flatten().map(|t| *t as usize));
			}
			v
		})
		.collect();

	for instruction in instructions.iter_mut() {
		if resolved.contains(&instruction.offset) {
			instruction.jumptarget = true;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx() -> DecodeContext {
		DecodeContext::new(23, encoding_rs::WINDOWS_1252)
	}

	#[test]
	fn decode_variant_global() {
		assert_eq!(decode_variant_word(5, false).unwrap(), VariantRef::Global(5));
	}

	#[test]
	fn decode_variant_local() {
		let word = 0x6000_0000 + 3;
		assert_eq!(decode_variant_word(word, false).unwrap(), VariantRef::Local(3));
	}

	#[test]
	fn decode_variant_argument_non_void_uses_bitwise_not() {
		// rel = -1 -> !(-1i32) as u32 = 0
		let word = 0x6000_0000u32.wrapping_sub(1);
		assert_eq!(decode_variant_word(word, false).unwrap(), VariantRef::Argument(0));
	}

	#[test]
	fn decode_variant_argument_void_uses_negation() {
		let word = 0x6000_0000u32.wrapping_sub(1);
		assert_eq!(decode_variant_word(word, true).unwrap(), VariantRef::Argument(1));
	}

	#[test]
	fn decode_variant_argument_range_below_local_does_not_error() {
		// [0x40000000, 0x60000000) is the argument range, not reserved.
		let word = 0x4000_0000u32;
		assert_eq!(decode_variant_word(word, false).unwrap(), VariantRef::Argument(0x1FFF_FFFF));
	}

	#[test]
	fn decode_variant_local_at_upper_bound() {
		let word = 0xFFFF_FFFFu32;
		assert_eq!(decode_variant_word(word, false).unwrap(), VariantRef::Local(0x9FFF_FFFF));
	}

	#[test]
	fn ret_only_body_is_one_instruction() {
		let mut c = ctx();
		let data = [0x09u8];
		let mut r = ByteReader::new(&data);
		let program = decode_program(&mut c, &mut r, true).unwrap();
		assert_eq!(program.len(), 1);
		assert!(matches!(program[0].opcode, OpCode::Ret));
	}

	#[test]
	fn jump_target_resolved_after_full_instruction() {
		// Jump with rel = 0 at offset 0: instruction is 5 bytes (opcode + i32),
		// so target = 5 + 0 = 5, which must be a real instruction start.
		let mut c = ctx();
		let data = [0x06u8, 0x00, 0x00, 0x00, 0x00, 0x09];
		let mut r = ByteReader::new(&data);
		let mut program = decode_program(&mut c, &mut r, true).unwrap();
		assert_eq!(program.len(), 2);
		mark_jump_targets(&mut program, "F0").unwrap();
		assert!(program[1].jumptarget);
	}

	#[test]
	fn unknown_opcode_errors() {
		let mut c = ctx();
		let data = [0x7Eu8];
		let mut r = ByteReader::new(&data);
		assert!(decode_program(&mut c, &mut r, true).is_err());
	}
}
