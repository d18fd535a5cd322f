//! CFG construction and stack-depth data flow (spec §4.G). Computed on
//! demand per function and cached by [`crate::unit::BytecodeUnit`] (spec §5,
//! "lazy computation of basic blocks").

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::raw::function::Function;
use crate::raw::instruction::{Instruction, OpCode, Operand, VariantRef};

/// A maximal straight-line run of instructions (spec §3, "Basic block").
#[derive(Debug, Clone)]
pub struct BasicBlock {
	pub start: usize,
	/// `None` when stack depths conflicted on entry (spec §4.G step 4).
	pub entry_stack: Option<u32>,
	pub instructions: Vec<Instruction>,
	pub predecessors: Vec<usize>,
	pub successors: Vec<usize>,
}

/// The lazily-computed, offset-keyed block map for one function.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
	pub blocks: BTreeMap<usize, BasicBlock>,
}

/// Builds the CFG and runs stack-depth propagation for one function body.
/// Returns an empty map for functions with no body (external functions).
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(function = %function.name)))]
pub fn analyze(function: &Function) -> Result<BlockMap> {
	let Some(body) = &function.body else {
		return Ok(BlockMap::default());
	};
	if body.is_empty() {
		return Ok(BlockMap::default());
	}

	let starts = block_starts(body);
	let mut blocks = build_blocks(body, &starts);
	prune_empty_blocks(&mut blocks);
	propagate_stack(&mut blocks);
	validate_stack(function, &blocks)?;

	Ok(BlockMap { blocks })
}

/// Every offset that must begin a block: 0, every jump target, and every
/// fall-through successor of a hard branch (spec §4.G step 2).
fn block_starts(body: &[Instruction]) -> Vec<usize> {
	let mut starts = vec![body[0].offset];
	for (i, instruction) in body.iter().enumerate() {
		if instruction.jumptarget {
			starts.push(instruction.offset);
		}
		if instruction.opcode.branch_target().is_some() {
			if let Some(next) = body.get(i + 1) {
				starts.push(next.offset);
			}
		}
	}
	starts.sort_unstable();
	starts.dedup();
	starts
}

fn build_blocks(body: &[Instruction], starts: &[usize]) -> BTreeMap<usize, BasicBlock> {
	let mut blocks: BTreeMap<usize, BasicBlock> = BTreeMap::new();
	for &start in starts {
		blocks.insert(
			start,
			BasicBlock { start, entry_stack: None, instructions: Vec::new(), predecessors: Vec::new(), successors: Vec::new() },
		);
	}

	let mut current = starts[0];
	let mut fell_through_from: Option<usize> = None;
	for instruction in body {
		if blocks.contains_key(&instruction.offset) && instruction.offset != current {
			if let Some(prev) = fell_through_from {
				link(&mut blocks, prev, instruction.offset);
			}
			current = instruction.offset;
		}
		blocks.get_mut(&current).unwrap().instructions.push(instruction.clone());

		if let Some(target) = instruction.opcode.branch_target() {
			link(&mut blocks, current, target as usize);
		}
		fell_through_from =
			if instruction.opcode.is_unconditional_terminator() { None } else { Some(current) };
	}

	blocks
}

fn link(blocks: &mut BTreeMap<usize, BasicBlock>, from: usize, to: usize) {
	if let Some(block) = blocks.get_mut(&from) {
		if !block.successors.contains(&to) {
			block.successors.push(to);
		}
	}
	if let Some(block) = blocks.get_mut(&to) {
		if !block.predecessors.contains(&from) {
			block.predecessors.push(from);
		}
	}
}

fn prune_empty_blocks(blocks: &mut BTreeMap<usize, BasicBlock>) {
	let empty: Vec<usize> = blocks.iter().filter(|(_, b)| b.instructions.is_empty()).map(|(&k, _)| k).collect();
	for offset in empty {
		blocks.remove(&offset);
		for block in blocks.values_mut() {
			block.predecessors.retain(|&p| p != offset);
			block.successors.retain(|&s| s != offset);
		}
	}
}

/// Forward DFS from block 0 at entry depth 0; re-arrival at a different
/// depth poisons the block (and everything only reachable through it) to
/// `None` (spec §4.G step 4, §9 "stack inference as data flow").
fn propagate_stack(blocks: &mut BTreeMap<usize, BasicBlock>) {
	let Some(&entry) = blocks.keys().next() else { return };
	let mut visited: BTreeMap<usize, Option<u32>> = BTreeMap::new();
	let mut stack = vec![(entry, Some(0u32))];

	while let Some((offset, depth)) = stack.pop() {
		match visited.get(&offset) {
			None => {
				visited.insert(offset, depth);
			},
			Some(existing) if *existing == depth => continue,
			Some(_) => {
				visited.insert(offset, None);
				let successors = blocks.get(&offset).map(|b| b.successors.clone()).unwrap_or_default();
				for succ in successors {
					stack.push((succ, None));
				}
				continue;
			},
		}

		let Some(block) = blocks.get(&offset) else { continue };
		let exit_depth = depth.map(|d| {
			let mut d = d as i64;
			for instruction in &block.instructions {
				d += instruction.opcode.stack_delta() as i64;
			}
			d.max(0) as u32
		});
		let successors = block.successors.clone();
		for succ in successors {
			stack.push((succ, exit_depth));
		}
	}

	for (offset, depth) in visited {
		if let Some(block) = blocks.get_mut(&offset) {
			block.entry_stack = depth;
			let mut running = depth.map(|d| d as i64);
			for instruction in &mut block.instructions {
				instruction.stack = running.map(|d| d as u32);
				running = running.map(|d| (d + instruction.opcode.stack_delta() as i64).max(0));
			}
		}
	}
}

/// Every Local-variant operand referenced by an instruction with a known
/// stack depth must have `index < depth` (spec §3 invariant, §4.G step 5).
fn validate_stack(function: &Function, blocks: &BTreeMap<usize, BasicBlock>) -> Result<()> {
	for block in blocks.values() {
		for instruction in &block.instructions {
			let Some(depth) = instruction.stack else { continue };
			for operand in operands_of(&instruction.opcode) {
				for variant in locals_in(operand) {
					if variant >= depth {
						return Err(Error::StackUnderflow {
							function: function.name.clone(),
							offset: instruction.offset,
							index: variant,
							depth,
						});
					}
				}
			}
		}
	}
	Ok(())
}

fn locals_in(operand: &Operand) -> Vec<u32> {
	let mut out = Vec::new();
	let push = |out: &mut Vec<u32>, v: &VariantRef| {
		if let VariantRef::Local(i) = v {
			out.push(*i);
		}
	};
	match operand {
		Operand::Variant(v) => push(&mut out, v),
		Operand::IndexedByInt(v, _) => push(&mut out, v),
		Operand::IndexedByVar(v, w) => {
			push(&mut out, v);
			push(&mut out, w);
		},
		Operand::Value(_) => {},
	}
	out
}

fn operands_of(opcode: &OpCode) -> Vec<&Operand> {
	use OpCode::*;
	match opcode {
		Assign { dst, src } | SetPtr { dst, src } | SetCopyPtr { dst, src } => vec![dst, src],
		Calculate { dst, src, .. } => vec![dst, src],
		Push { value } | PushVar { value } | BooleanNot { value } | Neg { value } | SetFlag { value, .. }
		| IntegerNot { value } | Inc { value } | Dec { value } => vec![value],
		Compare { dst, a, b, .. } => vec![dst, a, b],
		CallVar { target } => vec![target],
		JumpTrue { value, .. } | JumpFalse { value, .. } => vec![value],
		_ => vec![],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raw::instruction::{decode_program, mark_jump_targets};
	use crate::raw::DecodeContext;
	use crate::reader::ByteReader;

	fn analyze_body(bytes: &[u8]) -> (Function, BlockMap) {
		let mut ctx = DecodeContext::new(23, encoding_rs::WINDOWS_1252);
		let mut reader = ByteReader::new(bytes);
		let mut program = decode_program(&mut ctx, &mut reader, true).unwrap();
		mark_jump_targets(&mut program, "F0").unwrap();
		let function = Function {
			name: "F0".into(),
			exported: false,
			external: false,
			declaration: None,
			body: Some(program),
			attributes: vec![],
		};
		let map = analyze(&function).unwrap();
		(function, map)
	}

	#[test]
	fn ret_only_function_is_one_block_depth_zero() {
		let (_, map) = analyze_body(&[0x09]);
		assert_eq!(map.blocks.len(), 1);
		let block = map.blocks.values().next().unwrap();
		assert_eq!(block.entry_stack, Some(0));
		assert!(block.successors.is_empty());
	}

	#[test]
	fn push_push_jumppop2_ret_balances_to_zero() {
		// Push(kind=0 Variant, global 0), Push(kind=0 Variant, global 0), JumpPop2 +0, Ret
		let mut body = Vec::new();
		body.push(0x02);
		body.push(0);
		body.extend_from_slice(&0u32.to_le_bytes());
		body.push(0x02);
		body.push(0);
		body.extend_from_slice(&0u32.to_le_bytes());
		body.push(0x1A);
		body.extend_from_slice(&0i32.to_le_bytes());
		body.push(0x09);

		let (_, map) = analyze_body(&body);
		let ret_block = map.blocks.values().find(|b| matches!(b.instructions.last().unwrap().opcode, OpCode::Ret));
		assert_eq!(ret_block.unwrap().entry_stack, Some(0));
	}

	#[test]
	fn stack_underflow_on_out_of_range_local() {
		// Assign(Local(2), Local(0)) ; Ret -- depth at Assign is 0, so Local(2) is invalid.
		let mut body = Vec::new();
		body.push(0x00); // Assign
		body.push(0); // operand kind Variant
		body.extend_from_slice(&(0x6000_0000u32 + 2).to_le_bytes());
		body.push(0);
		body.extend_from_slice(&(0x6000_0000u32).to_le_bytes());
		body.push(0x09);

		let mut ctx = DecodeContext::new(23, encoding_rs::WINDOWS_1252);
		let mut reader = ByteReader::new(&body);
		let mut program = decode_program(&mut ctx, &mut reader, true).unwrap();
		mark_jump_targets(&mut program, "F0").unwrap();
		let function =
			Function { name: "F0".into(), exported: false, external: false, declaration: None, body: Some(program), attributes: vec![] };
		assert!(analyze(&function).is_err());
	}
}
