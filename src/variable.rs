//! The variable cell (spec §4.H): typed storage for scalars, sets, arrays,
//! static arrays and records, with strict type-checked read/write and
//! fixed-width integer wraparound.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::raw::types::{TypeCode, TypeDef, TypeKind};

/// One value held (or held in a slot of) a [`Cell`]. Distinct from
/// [`crate::raw::value::Value`], which is the on-disk literal form.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
	Int(i64),
	Float(f64),
	Text(String),
	Bool(bool),
	Null,
	/// The dense-sequence form returned by an unkeyed read of a container
	/// (spec §4.H).
	List(Vec<CellValue>),
}

impl CellValue {
	fn class(&self) -> &'static str {
		match self {
			CellValue::Int(_) => "integer",
			CellValue::Float(_) => "float",
			CellValue::Text(_) => "text",
			CellValue::Bool(_) => "bool",
			CellValue::Null => "null",
			CellValue::List(_) => "list",
		}
	}
}

/// The storage shape backing a cell, keyed identically to the type kind it
/// was constructed from (spec §4.H).
#[derive(Debug, Clone)]
enum Storage {
	Scalar(CellValue),
	/// Sparse, insertion-ordered; key range is `[0, 2^32)`.
	Array(BTreeMap<u32, CellValue>),
	/// Dense key range `[0, size)`.
	StaticArray { size: u32, data: BTreeMap<u32, CellValue> },
	/// Dense key range `[0, members.len())`; per-key expected type is
	/// `members[key]`.
	Record(BTreeMap<u32, CellValue>),
	/// A single integer bitmask, `bits` wide.
	Set { bits: u32, mask: u64 },
}

/// A polymorphic, type-checked storage slot (spec §4.H).
pub struct Cell<'t> {
	ty: &'t TypeDef,
	storage: Storage,
}

impl<'t> Cell<'t> {
	/// Initializes a cell from `ty`'s default (spec §4.H: "zero for
	/// numerics, empty string for text; null for pointer/class/interface/
	/// procptr").
	pub fn new(ty: &'t TypeDef) -> Self {
		let storage = match &ty.kind {
			TypeKind::Array { .. } => Storage::Array(BTreeMap::new()),
			TypeKind::StaticArray { count, .. } => Storage::StaticArray { size: *count, data: BTreeMap::new() },
			TypeKind::Record { members } => {
				let mut data = BTreeMap::new();
				for key in 0..members.len() as u32 {
					data.insert(key, CellValue::Null);
				}
				Storage::Record(data)
			},
			TypeKind::Set { bits } => Storage::Set { bits: *bits, mask: 0 },
			_ => Storage::Scalar(default_for(ty.code)),
		};
		Self { ty, storage }
	}

	/// Assignment to an unkeyed scalar or container (spec §4.H: "Assignment
	/// to an unkeyed container sets the whole container from an ordered
	/// sequence").
	pub fn set(&mut self, value: CellValue) -> Result<()> {
		match &mut self.storage {
			Storage::Scalar(slot) => {
				let checked = check_and_coerce(self.ty.code, value)?;
				*slot = wrap(self.ty.code, checked);
			},
			Storage::Set { .. } => {
				let CellValue::Int(mask) = value else {
					return Err(Error::TypeMismatch { expected: "integer bitmask", found: value.class() });
				};
				if let Storage::Set { mask: slot, .. } = &mut self.storage {
					*slot = mask as u64;
				}
			},
			Storage::Array(_) | Storage::StaticArray { .. } | Storage::Record(_) => {
				return Err(Error::TypeMismatch {
					expected: "ordered sequence via set_all",
					found: value.class(),
				});
			},
		}
		Ok(())
	}

	/// Assigns the whole container from an ordered sequence.
	pub fn set_all(&mut self, values: Vec<CellValue>) -> Result<()> {
		match &self.ty.kind {
			TypeKind::Array { .. } => {
				let mut data = BTreeMap::new();
				for (i, v) in values.into_iter().enumerate() {
					data.insert(i as u32, v);
				}
				self.storage = Storage::Array(data);
			},
			TypeKind::StaticArray { count, .. } => {
				if values.len() as u32 > *count {
					return Err(Error::IndexOutOfRange { index: values.len() as i64, max: *count as usize });
				}
				let mut data = BTreeMap::new();
				for (i, v) in values.into_iter().enumerate() {
					data.insert(i as u32, v);
				}
				self.storage = Storage::StaticArray { size: *count, data };
			},
			TypeKind::Record { members } => {
				if values.len() != members.len() {
					return Err(Error::IndexOutOfRange { index: values.len() as i64, max: members.len() });
				}
				let mut data = BTreeMap::new();
				for (i, v) in values.into_iter().enumerate() {
					data.insert(i as u32, v);
				}
				self.storage = Storage::Record(data);
			},
			_ => return Err(Error::TypeMismatch { expected: "container type", found: "scalar" }),
		}
		Ok(())
	}

	/// Keyed assignment (array element, record member, or set bit).
	pub fn set_at(&mut self, key: u32, value: CellValue) -> Result<()> {
		match &mut self.storage {
			Storage::Array(data) => {
				data.insert(key, value);
				Ok(())
			},
			Storage::StaticArray { size, data } => {
				if key >= *size {
					return Err(Error::IndexOutOfRange { index: key as i64, max: *size as usize });
				}
				data.insert(key, value);
				Ok(())
			},
			Storage::Record(data) => {
				let members = match &self.ty.kind {
					TypeKind::Record { members } => members,
					_ => unreachable!(),
				};
				if key as usize >= members.len() {
					return Err(Error::IndexOutOfRange { index: key as i64, max: members.len() });
				}
				data.insert(key, value);
				Ok(())
			},
			Storage::Set { bits, mask } => {
				if key >= *bits {
					return Err(Error::IndexOutOfRange { index: key as i64, max: *bits as usize });
				}
				let CellValue::Bool(on) = value else {
					return Err(Error::TypeMismatch { expected: "bool", found: value.class() });
				};
				// Clearing an already-clear bit is a no-op (spec §9, matches
				// the source's xor-based clear predicate).
				if on {
					*mask |= 1 << key;
				} else if *mask & (1 << key) != 0 {
					*mask &= !(1 << key);
				}
				Ok(())
			},
			Storage::Scalar(_) => Err(Error::TypeMismatch { expected: "unkeyed scalar", found: "keyed access" }),
		}
	}

	/// Read on an unkeyed cell: scalar value, the dense sequence for a
	/// container, or (for a set) the integer bitmask (spec §4.H).
	pub fn get(&self) -> CellValue {
		match &self.storage {
			Storage::Scalar(v) => v.clone(),
			Storage::Set { mask, .. } => CellValue::Int(*mask as i64),
			Storage::Array(_) | Storage::StaticArray { .. } | Storage::Record(_) => CellValue::List(self.values()),
		}
	}
}

fn max_key(data: &BTreeMap<u32, CellValue>) -> u32 {
	data.keys().next_back().map(|k| k + 1).unwrap_or(0)
}

impl<'t> Cell<'t> {
	/// Dense `[data[k] ∨ default(k) : k in 0..max_key]` read (spec §4.H).
	pub fn values(&self) -> Vec<CellValue> {
		match &self.storage {
			Storage::Array(data) => {
				let len = max_key(data);
				(0..len).map(|k| data.get(&k).cloned().unwrap_or(CellValue::Null)).collect()
			},
			Storage::StaticArray { size, data } => {
				(0..*size).map(|k| data.get(&k).cloned().unwrap_or(CellValue::Null)).collect()
			},
			Storage::Record(data) => (0..data.len() as u32).map(|k| data.get(&k).cloned().unwrap_or(CellValue::Null)).collect(),
			Storage::Scalar(v) => vec![v.clone()],
			Storage::Set { mask, bits } => (0..*bits).map(|i| CellValue::Bool(mask & (1 << i) != 0)).collect(),
		}
	}

	pub fn get_at(&self, key: u32) -> Result<CellValue> {
		match &self.storage {
			Storage::Array(data) => Ok(data.get(&key).cloned().unwrap_or(CellValue::Null)),
			Storage::StaticArray { size, data } => {
				if key >= *size {
					return Err(Error::IndexOutOfRange { index: key as i64, max: *size as usize });
				}
				Ok(data.get(&key).cloned().unwrap_or(CellValue::Null))
			},
			Storage::Record(data) => {
				let members = match &self.ty.kind {
					TypeKind::Record { members } => members,
					_ => unreachable!(),
				};
				if key as usize >= members.len() {
					return Err(Error::IndexOutOfRange { index: key as i64, max: members.len() });
				}
				Ok(data.get(&key).cloned().unwrap_or(CellValue::Null))
			},
			Storage::Set { bits, mask } => {
				if key >= *bits {
					return Err(Error::IndexOutOfRange { index: key as i64, max: *bits as usize });
				}
				Ok(CellValue::Bool(mask & (1 << key) != 0))
			},
			Storage::Scalar(_) => Err(Error::TypeMismatch { expected: "keyed container", found: "scalar" }),
		}
	}
}

fn default_for(code: TypeCode) -> CellValue {
	use TypeCode::*;
	match code {
		U08 | S08 | U16 | S16 | U32 | S32 | S64 | Currency => CellValue::Int(0),
		Single | Double | Extended => CellValue::Float(0.0),
		Char | WideChar | String | WideString | UnicodeString | PChar => CellValue::Text(String::new()),
		_ => CellValue::Null,
	}
}

/// The two permitted coercions (spec §4.H): single-character text into an
/// integer slot (code point), and integer into a single-character text slot.
fn check_and_coerce(code: TypeCode, value: CellValue) -> Result<CellValue> {
	let is_integer = matches!(code, TypeCode::U08 | TypeCode::S08 | TypeCode::U16 | TypeCode::S16 | TypeCode::U32 | TypeCode::S32 | TypeCode::S64);
	let is_float = matches!(code, TypeCode::Single | TypeCode::Double | TypeCode::Extended | TypeCode::Currency);
	let is_text = matches!(
		code,
		TypeCode::Char | TypeCode::WideChar | TypeCode::String | TypeCode::WideString | TypeCode::UnicodeString | TypeCode::PChar
	);

	match (&value, is_integer, is_float, is_text) {
		(CellValue::Int(_), true, _, _) => Ok(value),
		(CellValue::Float(_), _, true, _) => Ok(value),
		(CellValue::Text(_), _, _, true) => Ok(value),
		(CellValue::Text(s), true, _, _) if s.chars().count() == 1 => {
			Ok(CellValue::Int(s.chars().next().unwrap() as i64))
		},
		(CellValue::Int(i), _, _, true) => {
			let c = char::from_u32(*i as u32).ok_or(Error::TypeMismatch { expected: "valid code point", found: "integer" })?;
			Ok(CellValue::Text(c.to_string()))
		},
		_ => Err(Error::TypeMismatch {
			expected: if is_integer { "integer" } else if is_float { "float" } else if is_text { "text" } else { "null" },
			found: value.class(),
		}),
	}
}

/// Fixed-width integer wraparound (spec §4.H, §9: "the signed-reinterpretation
/// branch assumes two's complement"). Applied to every successful scalar
/// assignment; no-op for non-integer kinds.
fn wrap(code: TypeCode, value: CellValue) -> CellValue {
	let CellValue::Int(raw) = value else { return value };
	let (bits, signed) = match code {
		TypeCode::U08 => (8, false),
		TypeCode::S08 => (8, true),
		TypeCode::U16 => (16, false),
		TypeCode::S16 => (16, true),
		TypeCode::U32 => (32, false),
		TypeCode::S32 => (32, true),
		TypeCode::S64 => (64, true),
		_ => return CellValue::Int(raw),
	};
	CellValue::Int(wrap_int(raw, bits, signed))
}

fn wrap_int(value: i64, bits: u32, signed: bool) -> i64 {
	if bits >= 64 {
		return value;
	}
	let modulus = 1i128 << bits;
	let mut wrapped = (value as i128).rem_euclid(modulus);
	if signed && wrapped >= modulus / 2 {
		wrapped -= modulus;
	}
	wrapped as i64
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raw::types::TypeDef;

	fn prim(code: TypeCode) -> TypeDef {
		TypeDef { code, kind: TypeKind::Primitive, exported: false, symbol: None, attributes: vec![] }
	}

	#[test]
	fn u08_wraps_at_256() {
		let ty = prim(TypeCode::U08);
		let mut cell = Cell::new(&ty);
		cell.set(CellValue::Int(256)).unwrap();
		assert_eq!(cell.get(), CellValue::Int(0));
	}

	#[test]
	fn s08_wraps_both_directions() {
		let ty = prim(TypeCode::S08);
		let mut a = Cell::new(&ty);
		a.set(CellValue::Int(128)).unwrap();
		assert_eq!(a.get(), CellValue::Int(-128));

		let mut b = Cell::new(&ty);
		b.set(CellValue::Int(-129)).unwrap();
		assert_eq!(b.get(), CellValue::Int(127));
	}

	#[test]
	fn u16_round_trip_after_overflow() {
		let ty = prim(TypeCode::U16);
		let mut cell = Cell::new(&ty);
		cell.set(CellValue::Int(0x10001)).unwrap();
		assert_eq!(cell.get(), CellValue::Int(1));
	}

	#[test]
	fn single_char_text_coerces_to_integer_slot() {
		let ty = prim(TypeCode::U08);
		let mut cell = Cell::new(&ty);
		cell.set(CellValue::Text("A".to_string())).unwrap();
		assert_eq!(cell.get(), CellValue::Int(65));
	}

	#[test]
	fn set_clearing_already_clear_bit_is_noop() {
		let ty = TypeDef { code: TypeCode::Set, kind: TypeKind::Set { bits: 9 }, exported: false, symbol: None, attributes: vec![] };
		let mut cell = Cell::new(&ty);
		cell.set_at(8, CellValue::Bool(true)).unwrap();
		assert_eq!(cell.get(), CellValue::Int(0x100));
		cell.set_at(3, CellValue::Bool(false)).unwrap();
		assert_eq!(cell.get(), CellValue::Int(0x100));
	}

	#[test]
	fn set_out_of_range_bit_errors() {
		let ty = TypeDef { code: TypeCode::Set, kind: TypeKind::Set { bits: 9 }, exported: false, symbol: None, attributes: vec![] };
		let mut cell = Cell::new(&ty);
		assert!(cell.set_at(9, CellValue::Bool(true)).is_err());
	}

	#[test]
	fn static_array_out_of_range_errors() {
		let ty = TypeDef {
			code: TypeCode::StaticArray,
			kind: TypeKind::StaticArray { element: 0, count: 3, offset: None },
			exported: false,
			symbol: None,
			attributes: vec![],
		};
		let mut cell = Cell::new(&ty);
		assert!(cell.set_at(3, CellValue::Int(1)).is_err());
		assert!(cell.set_at(2, CellValue::Int(1)).is_ok());
	}
}
