//! Zip central-directory index over a [`RangeSource`].
//!
//! Opening reads the end-of-central-directory record from the tail (following
//! the zip64 locator when present) and then the central directory itself.
//! Entry data is read lazily: local header, then the stored or deflated body,
//! which is checked against the recorded size and CRC-32.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Crc;
use flate2::read::DeflateDecoder;
use tracing::trace;

use super::{EntrySource, RangeSource};
use crate::{Error, Result};

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_LEN: u64 = 22;
const MAX_COMMENT_LEN: u64 = u16::MAX as u64;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const ZIP64_LOCATOR_LEN: usize = 20;
const ZIP64_EOCD_SIGNATURE: u32 = 0x0606_4b50;
const ZIP64_EOCD_LEN: u64 = 56;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const CENTRAL_HEADER_LEN: usize = 46;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;
const LOCAL_HEADER_LEN: u64 = 30;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const FLAG_ENCRYPTED: u16 = 0x0001;

#[derive(Debug, Clone)]
struct ZipEntry {
	name: String,
	method: u16,
	crc32: u32,
	compressed_size: u64,
	uncompressed_size: u64,
	local_header_offset: u64,
}

/// An indexed zip archive. Entry bodies are fetched on demand.
pub struct ZipArchive {
	source: Arc<dyn RangeSource>,
	entries: Vec<ZipEntry>,
	by_name: HashMap<String, usize>,
}

impl fmt::Debug for ZipArchive {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ZipArchive")
			.field("len", &self.source.len())
			.field("entries", &self.entries.len())
			.finish()
	}
}

impl ZipArchive {
	/// Reads the central directory of the archive behind `source`.
	pub async fn open(source: Arc<dyn RangeSource>) -> Result<Self> {
		let len = source.len();
		if len < EOCD_LEN {
			return Err(Error::Archive(format!("{len} bytes is too short for a zip archive")));
		}

		let tail_start = len.saturating_sub(EOCD_LEN + MAX_COMMENT_LEN);
		let tail = source.read_range(tail_start..len).await?;
		let eocd_pos = find_eocd(&tail).ok_or_else(|| Error::Archive("end of central directory not found".into()))?;
		let eocd = Reader::new(&tail[eocd_pos..]);

		let mut total_entries = u64::from(eocd.u16(10)?);
		let mut cd_size = u64::from(eocd.u32(12)?);
		let mut cd_offset = u64::from(eocd.u32(16)?);

		let needs_zip64 = total_entries == u64::from(u16::MAX) || cd_size == u64::from(u32::MAX) || cd_offset == u64::from(u32::MAX);
		let locator = eocd_pos
			.checked_sub(ZIP64_LOCATOR_LEN)
			.map(|pos| Reader::new(&tail[pos..eocd_pos]))
			.filter(|locator| locator.u32(0).is_ok_and(|sig| sig == ZIP64_LOCATOR_SIGNATURE));

		if let Some(locator) = locator {
			let record_offset = locator.u64(8)?;
			let record_end = record_offset
				.checked_add(ZIP64_EOCD_LEN)
				.filter(|end| *end <= len)
				.ok_or_else(|| Error::Archive("zip64 record out of bounds".into()))?;
			let record = source.read_range(record_offset..record_end).await?;
			let record = Reader::new(&record);
			if record.u32(0)? != ZIP64_EOCD_SIGNATURE {
				return Err(Error::Archive("bad zip64 end of central directory signature".into()));
			}
			total_entries = record.u64(32)?;
			cd_size = record.u64(40)?;
			cd_offset = record.u64(48)?;
		} else if needs_zip64 {
			return Err(Error::Archive("zip64 locator missing".into()));
		}

		let cd_end = cd_offset
			.checked_add(cd_size)
			.filter(|end| *end <= len)
			.ok_or_else(|| Error::Archive("central directory out of bounds".into()))?;
		let directory = if cd_offset >= tail_start {
			let start = usize::try_from(cd_offset - tail_start).map_err(|_| Error::Archive("central directory out of bounds".into()))?;
			let end = usize::try_from(cd_end - tail_start).map_err(|_| Error::Archive("central directory out of bounds".into()))?;
			tail.slice(start..end)
		} else {
			source.read_range(cd_offset..cd_end).await?
		};

		let entries = parse_central_directory(&directory, total_entries)?;
		let mut by_name = HashMap::with_capacity(entries.len());
		for (index, entry) in entries.iter().enumerate() {
			by_name.entry(entry.name.clone()).or_insert(index);
		}
		trace!(entries = entries.len(), cd_size, "Indexed zip central directory");

		Ok(Self { source, entries, by_name })
	}

	/// Number of file entries, excluding directories.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	async fn read_entry(&self, entry: &ZipEntry) -> Result<Bytes> {
		let header_end = entry
			.local_header_offset
			.checked_add(LOCAL_HEADER_LEN)
			.filter(|end| *end <= self.source.len())
			.ok_or_else(|| Error::Archive(format!("local header of {} out of bounds", entry.name)))?;
		let header = self.source.read_range(entry.local_header_offset..header_end).await?;
		let header = Reader::new(&header);
		if header.u32(0)? != LOCAL_SIGNATURE {
			return Err(Error::Archive(format!("bad local header signature for {}", entry.name)));
		}
		let data_start = header_end + u64::from(header.u16(26)?) + u64::from(header.u16(28)?);
		let data_end = data_start
			.checked_add(entry.compressed_size)
			.filter(|end| *end <= self.source.len())
			.ok_or_else(|| Error::Archive(format!("data of {} out of bounds", entry.name)))?;
		let raw = self.source.read_range(data_start..data_end).await?;

		let data = match entry.method {
			METHOD_STORED => raw,
			METHOD_DEFLATE => {
				let capacity = usize::try_from(entry.uncompressed_size.min(1 << 30)).unwrap_or_default();
				let mut out = Vec::with_capacity(capacity);
				DeflateDecoder::new(raw.as_ref())
					.take(entry.uncompressed_size.saturating_add(1))
					.read_to_end(&mut out)
					.map_err(|e| Error::Archive(format!("inflating {}: {e}", entry.name)))?;
				if u64::try_from(out.len()).unwrap_or(u64::MAX) > entry.uncompressed_size {
					return Err(Error::Archive(format!(
						"{} inflates past its recorded {} bytes",
						entry.name, entry.uncompressed_size
					)));
				}
				Bytes::from(out)
			}
			method => return Err(Error::Archive(format!("{} uses unsupported compression method {method}", entry.name))),
		};

		if data.len() as u64 != entry.uncompressed_size {
			return Err(Error::Archive(format!(
				"{} inflated to {} bytes, expected {}",
				entry.name,
				data.len(),
				entry.uncompressed_size
			)));
		}
		let mut crc = Crc::new();
		crc.update(&data);
		if crc.sum() != entry.crc32 {
			return Err(Error::Archive(format!("CRC mismatch in {}", entry.name)));
		}
		Ok(data)
	}
}

#[async_trait]
impl EntrySource for ZipArchive {
	fn entries(&self) -> Vec<String> {
		self.entries.iter().map(|entry| entry.name.clone()).collect()
	}

	async fn read(&self, path: &str) -> Result<Bytes> {
		let index = self
			.by_name
			.get(path)
			.ok_or_else(|| Error::NotFound(format!("entry {path} not found in archive")))?;
		self.read_entry(&self.entries[*index]).await
	}
}

fn find_eocd(tail: &[u8]) -> Option<usize> {
	let signature = EOCD_SIGNATURE.to_le_bytes();
	(0..=tail.len().checked_sub(usize::try_from(EOCD_LEN).ok()?)?)
		.rev()
		.find(|&pos| tail[pos..pos + 4] == signature)
}

fn parse_central_directory(directory: &[u8], expected: u64) -> Result<Vec<ZipEntry>> {
	let mut entries = Vec::new();
	let mut pos = 0usize;
	let mut seen = 0u64;

	while seen < expected {
		let header = Reader::new(directory.get(pos..).unwrap_or_default());
		if header.u32(0)? != CENTRAL_SIGNATURE {
			return Err(Error::Archive(format!("bad central directory signature at entry {seen}")));
		}
		let flags = header.u16(8)?;
		let method = header.u16(10)?;
		let crc32 = header.u32(16)?;
		let mut compressed_size = u64::from(header.u32(20)?);
		let mut uncompressed_size = u64::from(header.u32(24)?);
		let name_len = usize::from(header.u16(28)?);
		let extra_len = usize::from(header.u16(30)?);
		let comment_len = usize::from(header.u16(32)?);
		let mut local_header_offset = u64::from(header.u32(42)?);

		let name_start = CENTRAL_HEADER_LEN;
		let extra_start = name_start + name_len;
		let name = String::from_utf8_lossy(header.bytes(name_start, name_len)?).replace('\\', "/");
		let extra = header.bytes(extra_start, extra_len)?;

		if let Some(zip64) = find_extra(extra, ZIP64_EXTRA_ID) {
			let fields = Reader::new(zip64);
			let mut at = 0;
			for field in [&mut uncompressed_size, &mut compressed_size, &mut local_header_offset] {
				if *field == u64::from(u32::MAX) {
					*field = fields.u64(at)?;
					at += 8;
				}
			}
		}

		pos += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
		seen += 1;

		if name.ends_with('/') {
			continue;
		}
		if flags & FLAG_ENCRYPTED != 0 {
			return Err(Error::Archive(format!("{name} is encrypted")));
		}
		entries.push(ZipEntry {
			name,
			method,
			crc32,
			compressed_size,
			uncompressed_size,
			local_header_offset,
		});
	}

	Ok(entries)
}

fn find_extra(mut extra: &[u8], id: u16) -> Option<&[u8]> {
	while extra.len() >= 4 {
		let header_id = u16::from_le_bytes([extra[0], extra[1]]);
		let size = usize::from(u16::from_le_bytes([extra[2], extra[3]]));
		let body = extra.get(4..4 + size)?;
		if header_id == id {
			return Some(body);
		}
		extra = &extra[4 + size..];
	}
	None
}

/// Bounds-checked little-endian field access.
struct Reader<'a> {
	data: &'a [u8],
}

impl<'a> Reader<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data }
	}

	fn bytes(&self, at: usize, len: usize) -> Result<&'a [u8]> {
		self.data
			.get(at..at.saturating_add(len))
			.ok_or_else(|| Error::Archive("truncated zip structure".into()))
	}

	fn u16(&self, at: usize) -> Result<u16> {
		let bytes = self.bytes(at, 2)?;
		Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
	}

	fn u32(&self, at: usize) -> Result<u32> {
		let bytes = self.bytes(at, 4)?;
		Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
	}

	fn u64(&self, at: usize) -> Result<u64> {
		let bytes = self.bytes(at, 8)?;
		let mut buf = [0u8; 8];
		buf.copy_from_slice(bytes);
		Ok(u64::from_le_bytes(buf))
	}
}
