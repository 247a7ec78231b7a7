//! Binaries pulled out of packages, ready to be handed to a loader.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::{Error, Result};

/// On-disk encoding of a [`LoadedBinary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryFormat {
	/// Directly loadable by the host.
	Native,
	/// Wrapped in a WebAssembly module envelope; the payload sits in the last
	/// data segment and must be unwrapped before loading.
	PortableIntermediate,
}

impl BinaryFormat {
	/// Infers the format from an entry file name.
	pub fn from_file_name(name: &str) -> Self {
		if name.to_ascii_lowercase().ends_with(".wasm") {
			Self::PortableIntermediate
		} else {
			Self::Native
		}
	}
}

/// A named binary with its raw bytes.
///
/// Clones share the memoized native conversion.
#[derive(Clone)]
pub struct LoadedBinary {
	name: Arc<str>,
	data: Bytes,
	format: BinaryFormat,
	native: Arc<OnceLock<Result<Bytes>>>,
}

impl LoadedBinary {
	pub fn new(name: impl Into<Arc<str>>, data: impl Into<Bytes>, format: BinaryFormat) -> Self {
		Self {
			name: name.into(),
			data: data.into(),
			format,
			native: Arc::new(OnceLock::new()),
		}
	}

	/// Builds a binary from an archive entry path, deriving the logical name
	/// by dropping directories and the extension.
	pub fn from_entry(path: &str, data: Bytes) -> Self {
		let file = path.rsplit('/').next().unwrap_or(path);
		let name = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
		Self::new(name, data, BinaryFormat::from_file_name(file))
	}

	/// Logical, extension-less name.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn shared_name(&self) -> Arc<str> {
		Arc::clone(&self.name)
	}

	/// Raw bytes in their original format.
	pub fn data(&self) -> &Bytes {
		&self.data
	}

	pub fn format(&self) -> BinaryFormat {
		self.format
	}

	/// Returns the natively loadable bytes, converting once on first use.
	pub fn native_bytes(&self) -> Result<Bytes> {
		match self.format {
			BinaryFormat::Native => Ok(self.data.clone()),
			BinaryFormat::PortableIntermediate => self.native.get_or_init(|| unwrap_envelope(&self.data)).clone(),
		}
	}
}

impl PartialEq for LoadedBinary {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.format == other.format && self.data == other.data
	}
}

impl Eq for LoadedBinary {}

impl fmt::Debug for LoadedBinary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LoadedBinary")
			.field("name", &self.name)
			.field("format", &self.format)
			.field("len", &self.data.len())
			.finish()
	}
}

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: u32 = 1;
const DATA_SECTION: u8 = 11;
const END_OPCODE: u8 = 0x0b;

/// Extracts the payload from the last data segment of a WebAssembly module.
fn unwrap_envelope(data: &Bytes) -> Result<Bytes> {
	let invalid = |what: &str| Error::InvalidOperation(format!("malformed portable binary: {what}"));

	if data.len() < 8 || &data[..4] != WASM_MAGIC {
		return Err(invalid("missing module header"));
	}
	if u32::from_le_bytes([data[4], data[5], data[6], data[7]]) != WASM_VERSION {
		return Err(invalid("unsupported module version"));
	}

	let mut cursor = Cursor { data, pos: 8 };
	while cursor.pos < data.len() {
		let id = cursor.byte().ok_or_else(|| invalid("truncated section id"))?;
		let size = cursor.leb_u32().ok_or_else(|| invalid("truncated section size"))? as usize;
		let end = cursor.pos.checked_add(size).filter(|end| *end <= data.len()).ok_or_else(|| invalid("section overruns module"))?;

		if id != DATA_SECTION {
			cursor.pos = end;
			continue;
		}

		let count = cursor.leb_u32().ok_or_else(|| invalid("truncated segment count"))?;
		let mut last = None;
		for _ in 0..count {
			let flags = cursor.leb_u32().ok_or_else(|| invalid("truncated segment flags"))?;
			match flags {
				0 => cursor.skip_const_expr().ok_or_else(|| invalid("bad offset expression"))?,
				1 => {}
				2 => {
					cursor.leb_u32().ok_or_else(|| invalid("truncated memory index"))?;
					cursor.skip_const_expr().ok_or_else(|| invalid("bad offset expression"))?;
				}
				_ => return Err(invalid("unknown segment kind")),
			}
			let len = cursor.leb_u32().ok_or_else(|| invalid("truncated segment length"))? as usize;
			let start = cursor.pos;
			let stop = start.checked_add(len).filter(|stop| *stop <= end).ok_or_else(|| invalid("segment overruns section"))?;
			last = Some(data.slice(start..stop));
			cursor.pos = stop;
		}
		return last.ok_or_else(|| invalid("no data segments"));
	}

	Err(invalid("no data section"))
}

struct Cursor<'a> {
	data: &'a [u8],
	pos: usize,
}

impl Cursor<'_> {
	fn byte(&mut self) -> Option<u8> {
		let byte = *self.data.get(self.pos)?;
		self.pos += 1;
		Some(byte)
	}

	fn leb_u32(&mut self) -> Option<u32> {
		let mut result = 0u32;
		for shift in (0..35).step_by(7) {
			let byte = self.byte()?;
			result |= u32::from(byte & 0x7f).checked_shl(shift)?;
			if byte & 0x80 == 0 {
				return Some(result);
			}
		}
		None
	}

	/// Offset expressions in data segments are a single `i32.const`,
	/// `i64.const` or `global.get` followed by `end`.
	fn skip_const_expr(&mut self) -> Option<()> {
		match self.byte()? {
			0x41 | 0x42 | 0x23 => self.skip_leb()?,
			_ => return None,
		}
		(self.byte()? == END_OPCODE).then_some(())
	}

	fn skip_leb(&mut self) -> Option<()> {
		for _ in 0..10 {
			if self.byte()? & 0x80 == 0 {
				return Some(());
			}
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn leb(mut value: u32) -> Vec<u8> {
		let mut out = Vec::new();
		loop {
			let byte = (value & 0x7f) as u8;
			value >>= 7;
			if value == 0 {
				out.push(byte);
				return out;
			}
			out.push(byte | 0x80);
		}
	}

	fn envelope(segments: &[&[u8]]) -> Vec<u8> {
		let mut section = leb(segments.len() as u32);
		for (i, segment) in segments.iter().enumerate() {
			if i == 0 {
				// Active segment with an `i32.const 0` offset.
				section.extend([0x00, 0x41, 0x00, END_OPCODE]);
			} else {
				section.push(0x01);
			}
			section.extend(leb(segment.len() as u32));
			section.extend_from_slice(segment);
		}

		let mut module = WASM_MAGIC.to_vec();
		module.extend(WASM_VERSION.to_le_bytes());
		// An unrelated custom section first.
		module.extend([0x00, 0x03, 0x01, b'x', 0xff]);
		module.push(DATA_SECTION);
		module.extend(leb(section.len() as u32));
		module.extend(section);
		module
	}

	#[test]
	fn derives_logical_name_and_format_from_entry() {
		let binary = LoadedBinary::from_entry("tasks/netcore/bincore/Microsoft.CodeAnalysis.dll", Bytes::from_static(b"MZ"));
		assert_eq!(binary.name(), "Microsoft.CodeAnalysis");
		assert_eq!(binary.format(), BinaryFormat::Native);

		let portable = LoadedBinary::from_entry("_framework/System.Runtime.wasm", Bytes::new());
		assert_eq!(portable.name(), "System.Runtime");
		assert_eq!(portable.format(), BinaryFormat::PortableIntermediate);
	}

	#[test]
	fn native_bytes_pass_through() {
		let binary = LoadedBinary::new("A", Bytes::from_static(b"MZ\x90\x00"), BinaryFormat::Native);
		assert_eq!(binary.native_bytes().unwrap(), Bytes::from_static(b"MZ\x90\x00"));
	}

	#[test]
	fn portable_payload_is_unwrapped_once_and_shared_by_clones() {
		let payload = vec![0x4d; 300];
		let module = envelope(&[&300u32.to_le_bytes(), &payload]);
		let binary = LoadedBinary::new("A", module, BinaryFormat::PortableIntermediate);
		let clone = binary.clone();

		let first = binary.native_bytes().unwrap();
		assert_eq!(first.as_ref(), payload.as_slice());
		assert!(clone.native.get().is_some());
		assert_eq!(clone.native_bytes().unwrap(), first);
	}

	#[test]
	fn malformed_envelopes_are_rejected() {
		let binary = LoadedBinary::new("A", Bytes::from_static(b"MZ"), BinaryFormat::PortableIntermediate);
		assert!(matches!(binary.native_bytes(), Err(Error::InvalidOperation(_))));

		let mut truncated = envelope(&[b"abc"]);
		truncated.truncate(truncated.len() - 2);
		let binary = LoadedBinary::new("A", truncated, BinaryFormat::PortableIntermediate);
		assert!(binary.native_bytes().is_err());
	}
}
