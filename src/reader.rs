//! The byte-oriented reader primitive consumed by every decoder in this
//! crate (spec §4.A / §6). Deliberately dumb: typed little-endian reads,
//! length-prefixed strings, a scoped detour, nothing format-specific.

use std::io::{Error, ErrorKind, Result};

/// Cursor over an in-memory byte slice with the primitive operations the
/// rest of the crate builds on.
#[derive(Debug, Clone)]
pub struct ByteReader<'d> {
	data: &'d [u8],
	pos: usize,
}

macro_rules! read_le {
	($name:ident, $ty:ty) => {
		#[inline]
		pub fn $name(&mut self) -> Result<$ty> {
			const N: usize = std::mem::size_of::<$ty>();
			let bytes: [u8; N] = self.read_array()?;
			Ok(<$ty>::from_le_bytes(bytes))
		}
	};
}

impl<'d> ByteReader<'d> {
	pub fn new(data: &'d [u8]) -> Self {
		Self { data, pos: 0 }
	}

	#[inline]
	fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
		let slice = self.read_bytes(N)?;
		let mut array = [0u8; N];
		array.copy_from_slice(slice);
		Ok(array)
	}

	pub fn u8(&mut self) -> Result<u8> {
		let slice = self.read_bytes(1)?;
		Ok(slice[0])
	}

	pub fn i8(&mut self) -> Result<i8> {
		Ok(self.u8()? as i8)
	}

	read_le!(u16, u16);
	read_le!(u32, u32);
	read_le!(u64, u64);
	read_le!(i16, i16);
	read_le!(i32, i32);
	read_le!(i64, i64);
	read_le!(f32, f32);
	read_le!(f64, f64);

	/// Reads `count` raw bytes and advances the cursor.
	pub fn read_bytes(&mut self, count: usize) -> Result<&'d [u8]> {
		let slice = self.peek(count)?;
		self.pos += count;
		Ok(slice)
	}

	/// Reads `count` raw bytes without advancing the cursor.
	pub fn peek(&self, count: usize) -> Result<&'d [u8]> {
		let end = self.pos.checked_add(count).ok_or(ErrorKind::UnexpectedEof)?;
		self.data.get(self.pos..end).ok_or_else(|| Error::from(ErrorKind::UnexpectedEof))
	}

	pub fn tell(&self) -> usize {
		self.pos
	}

	pub fn seek(&mut self, pos: usize) -> Result<()> {
		if pos > self.data.len() {
			return Err(ErrorKind::UnexpectedEof.into());
		}
		self.pos = pos;
		Ok(())
	}

	/// Runs `f` with the cursor moved to `pos`, then restores the original
	/// position regardless of how `f` returns.
	pub fn detour<T>(&mut self, pos: usize, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
		let restore = self.pos;
		self.seek(pos)?;
		let result = f(self);
		self.pos = restore;
		result
	}

	pub fn remaining_bytes(&self) -> usize {
		self.data.len() - self.pos
	}

	pub fn eof(&self) -> bool {
		self.pos >= self.data.len()
	}

	/// Advances past `prefix` iff the upcoming bytes match it exactly.
	pub fn read_if(&mut self, prefix: &[u8]) -> bool {
		match self.peek(prefix.len()) {
			Ok(slice) if slice == prefix => {
				self.pos += prefix.len();
				true
			},
			_ => false,
		}
	}

	/// Reads bytes up to (but not including) the first occurrence of `sep`.
	/// The separator itself is consumed.
	pub fn read_terminated_array(&mut self, sep: u8) -> Result<&'d [u8]> {
		let start = self.pos;
		loop {
			let byte = self.u8()?;
			if byte == sep {
				return Ok(&self.data[start..self.pos - 1]);
			}
		}
	}

	/// NUL-terminated string, decoded with `codec`. The terminator is
	/// consumed; absence of a terminator before EOF is an error.
	pub fn read_c_string(&mut self, codec: &'static encoding_rs::Encoding) -> Result<String> {
		let start = self.pos;
		loop {
			if self.eof() {
				return Err(ErrorKind::UnexpectedEof.into());
			}
			if self.u8()? == 0 {
				break;
			}
		}
		let bytes = &self.data[start..self.pos - 1];
		Ok(decode(codec, bytes))
	}

	/// 4-byte LE length prefix followed by that many raw bytes.
	pub fn read_length_prefixed_bytes(&mut self) -> Result<&'d [u8]> {
		let len = self.u32()? as usize;
		self.read_bytes(len)
	}

	/// 4-byte LE length prefix followed by that many bytes, decoded with `codec`.
	pub fn read_length_prefixed(&mut self, codec: &'static encoding_rs::Encoding) -> Result<String> {
		let bytes = self.read_length_prefixed_bytes()?;
		Ok(decode(codec, bytes))
	}

	/// Length-in-code-units prefix (4-byte LE), UTF-16LE payload.
	pub fn read_length_prefixed_utf16(&mut self) -> Result<String> {
		let units = self.u32()? as usize;
		let bytes = self.read_bytes(units * 2)?;
		let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
		String::from_utf16(&units).map_err(|_| ErrorKind::InvalidData.into())
	}

	/// 1-byte length prefix, ASCII/Latin-1 payload. Used for the short
	/// symbol/name strings scattered through the type and function tables.
	/// `max` optionally bounds the accepted length (the external-function
	/// name field is capped at 8 characters).
	pub fn read_length_prefixed_ascii(&mut self, max: Option<u8>) -> Result<String> {
		let len = self.u8()?;
		if let Some(max) = max {
			if len > max {
				return Err(ErrorKind::InvalidData.into());
			}
		}
		let bytes = self.read_bytes(len as usize)?;
		Ok(decode(encoding_rs::WINDOWS_1252, bytes))
	}
}

fn decode(codec: &'static encoding_rs::Encoding, bytes: &[u8]) -> String {
	let (text, _, _) = codec.decode(bytes);
	text.into_owned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primitives_round_trip() {
		let data = [0x01, 0x02, 0x03, 0x04, 0xFF];
		let mut r = ByteReader::new(&data);
		assert_eq!(r.u8().unwrap(), 0x01);
		assert_eq!(r.u16().unwrap(), 0x0403);
		assert_eq!(r.u8().unwrap(), 0xFF);
		assert!(r.eof());
	}

	#[test]
	fn detour_restores_position() {
		let data = [1, 2, 3, 4, 5];
		let mut r = ByteReader::new(&data);
		r.u8().unwrap();
		let value = r.detour(4, |r| r.u8()).unwrap();
		assert_eq!(value, 5);
		assert_eq!(r.tell(), 1);
	}

	#[test]
	fn read_if_advances_only_on_match() {
		let data = *b"dll:files:foo";
		let mut r = ByteReader::new(&data);
		assert!(!r.read_if(b"intf:"));
		assert!(r.read_if(b"dll:"));
		assert!(r.read_if(b"files:"));
		assert_eq!(r.remaining_bytes(), 3);
	}

	#[test]
	fn terminated_array_excludes_separator() {
		let data = *b"foo|bar";
		let mut r = ByteReader::new(&data);
		let slice = r.read_terminated_array(b'|').unwrap();
		assert_eq!(slice, b"foo");
		assert_eq!(r.remaining_bytes(), 3);
	}

	#[test]
	fn length_prefixed_ascii_rejects_over_max() {
		let data = [9, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i'];
		let mut r = ByteReader::new(&data);
		assert!(r.read_length_prefixed_ascii(Some(8)).is_err());
	}
}
