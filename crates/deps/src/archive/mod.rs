//! Package contents: zip indexes over byte sources and dedup artifacts.
//!
//! Both shapes implement [`EntrySource`], so filters and the cache never care
//! whether an entry lives in a zip central directory or in a blob store.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::http::HttpClient;
use crate::{Error, Result};

pub mod dedup;
mod zip;

pub use dedup::{BlobStore, DedupArtifact, DedupFile, DedupManifest};
pub use zip::ZipArchive;

/// Random access to a byte sequence of known length.
#[async_trait]
pub trait RangeSource: Send + Sync {
	fn len(&self) -> u64;

	fn is_empty(&self) -> bool {
		self.len() == 0
	}

	async fn read_range(&self, range: Range<u64>) -> Result<Bytes>;
}

/// A fully downloaded body.
#[derive(Debug, Clone)]
pub struct BytesSource(pub Bytes);

#[async_trait]
impl RangeSource for BytesSource {
	fn len(&self) -> u64 {
		self.0.len() as u64
	}

	async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
		slice(&self.0, range)
	}
}

/// `body[range]`, rejecting ranges that are inverted or past the end.
fn slice(body: &Bytes, range: Range<u64>) -> Result<Bytes> {
	let start = usize::try_from(range.start);
	let end = usize::try_from(range.end);
	match (start, end) {
		(Ok(start), Ok(end)) if start <= end && end <= body.len() => Ok(body.slice(start..end)),
		_ => Err(Error::Archive(format!("read {range:?} past end of {} byte body", body.len()))),
	}
}

/// A remote body read with HTTP range requests.
///
/// The first failed range read demotes the source to a single full download;
/// every later read is served from that body.
pub struct HttpRangeSource {
	client: Arc<dyn HttpClient>,
	url: Url,
	len: u64,
	full: OnceCell<Bytes>,
}

impl HttpRangeSource {
	/// Probes the body length. Fails when the server does not advertise one.
	pub async fn open(client: Arc<dyn HttpClient>, url: Url) -> Result<Self> {
		let len = client.content_length(&url).await?.ok_or_else(|| Error::Http {
			url: url.to_string(),
			message: "server did not report a content length".into(),
		})?;
		Ok(Self {
			client,
			url,
			len,
			full: OnceCell::new(),
		})
	}

	/// True once range reads have been abandoned for a full download.
	pub fn is_demoted(&self) -> bool {
		self.full.initialized()
	}

	async fn full_body(&self) -> Result<&Bytes> {
		self.full
			.get_or_try_init(|| async {
				let body = self.client.get(&self.url).await?;
				if body.len() as u64 != self.len {
					return Err(Error::Archive(format!(
						"{} changed size from {} to {} bytes",
						self.url,
						self.len,
						body.len()
					)));
				}
				Ok(body)
			})
			.await
	}
}

#[async_trait]
impl RangeSource for HttpRangeSource {
	fn len(&self) -> u64 {
		self.len
	}

	async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
		if range.start > range.end || range.end > self.len {
			return Err(Error::Archive(format!("read {range:?} past end of {} byte body", self.len)));
		}
		if let Some(body) = self.full.get() {
			return slice(body, range);
		}
		match self.client.get_range(&self.url, range.clone()).await {
			Ok(bytes) => Ok(bytes),
			Err(error) => {
				if !self.is_demoted() {
					warn!(url = %self.url, error = %error, "Range read failed; downloading the full archive");
				}
				let body = self.full_body().await?;
				slice(body, range)
			}
		}
	}
}

/// Listing and reading of package entries.
#[async_trait]
pub trait EntrySource: Send + Sync + fmt::Debug {
	/// Full entry paths, `/`-separated, in archive order.
	fn entries(&self) -> Vec<String>;

	/// Reads one entry's uncompressed bytes.
	async fn read(&self, path: &str) -> Result<Bytes>;
}

/// Contents of a package that ships nothing to download.
#[derive(Debug, Default)]
pub struct EmptyArchive;

#[async_trait]
impl EntrySource for EmptyArchive {
	fn entries(&self) -> Vec<String> {
		Vec::new()
	}

	async fn read(&self, path: &str) -> Result<Bytes> {
		Err(Error::NotFound(format!("entry {path} not found in empty archive")))
	}
}

/// Opens a remote zip archive.
///
/// Hosts listed in `range_hosts` are read with range requests so only the
/// central directory and the selected entries travel over the wire. Other
/// hosts, and range-capable hosts that fail the length probe, are downloaded
/// in full.
pub async fn open_remote(client: Arc<dyn HttpClient>, url: &Url, range_hosts: &[String]) -> Result<ZipArchive> {
	let supports_ranges = url
		.host_str()
		.is_some_and(|host| range_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(host)));

	if supports_ranges {
		match HttpRangeSource::open(Arc::clone(&client), url.clone()).await {
			Ok(source) => {
				debug!(url = %url, len = source.len(), "Indexing archive with range reads");
				return ZipArchive::open(Arc::new(source)).await;
			}
			Err(error) => warn!(url = %url, error = %error, "Range probe failed; downloading the full archive"),
		}
	}

	let body = client.get(url).await?;
	ZipArchive::open(Arc::new(BytesSource(body))).await
}
