//! In-memory package feed and HTTP transport for session tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Crc;
use kiln_deps::feed::{DependencyGroup, FeedClient, PackageReference};
use kiln_deps::http::HttpClient;
use kiln_deps::{Error, PackageVersion, Result, VersionRange};
use parking_lot::Mutex;
use url::Url;

pub const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// Writes an archive of stored (uncompressed) entries.
pub fn stored_zip(files: &[(&str, &[u8])]) -> Bytes {
	let mut body = Vec::new();
	let mut central = Vec::new();

	for (name, data) in files {
		let mut crc = Crc::new();
		crc.update(data);
		let offset = body.len() as u32;

		body.extend(0x0403_4b50u32.to_le_bytes());
		body.extend(20u16.to_le_bytes());
		body.extend(0u16.to_le_bytes());
		body.extend(0u16.to_le_bytes());
		body.extend([0u8; 4]);
		body.extend(crc.sum().to_le_bytes());
		body.extend((data.len() as u32).to_le_bytes());
		body.extend((data.len() as u32).to_le_bytes());
		body.extend((name.len() as u16).to_le_bytes());
		body.extend(0u16.to_le_bytes());
		body.extend(name.as_bytes());
		body.extend(*data);

		central.extend(0x0201_4b50u32.to_le_bytes());
		central.extend(20u16.to_le_bytes());
		central.extend(20u16.to_le_bytes());
		central.extend(0u16.to_le_bytes());
		central.extend(0u16.to_le_bytes());
		central.extend([0u8; 4]);
		central.extend(crc.sum().to_le_bytes());
		central.extend((data.len() as u32).to_le_bytes());
		central.extend((data.len() as u32).to_le_bytes());
		central.extend((name.len() as u16).to_le_bytes());
		central.extend([0u8; 12]);
		central.extend(offset.to_le_bytes());
		central.extend(name.as_bytes());
	}

	let directory_offset = body.len() as u32;
	body.extend(&central);
	body.extend(0x0605_4b50u32.to_le_bytes());
	body.extend([0u8; 4]);
	body.extend((files.len() as u16).to_le_bytes());
	body.extend((files.len() as u16).to_le_bytes());
	body.extend((central.len() as u32).to_le_bytes());
	body.extend(directory_offset.to_le_bytes());
	body.extend(0u16.to_le_bytes());
	Bytes::from(body)
}

struct Published {
	version: PackageVersion,
	groups: Vec<DependencyGroup>,
}

#[derive(Default)]
struct State {
	packages: Mutex<HashMap<String, Vec<Published>>>,
	bodies: Mutex<HashMap<String, Bytes>>,
}

/// Packages published to an in-memory feed, downloadable over [`Catalog::http`].
#[derive(Clone, Default)]
pub struct Catalog {
	state: Arc<State>,
}

impl Catalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn download_url(id: &str, version: &str) -> String {
		format!("https://packages.test/{}.{version}.nupkg", id.to_ascii_lowercase())
	}

	/// Publishes `id` at `version` with framework-agnostic `dependencies`
	/// and an archive holding `files`.
	pub fn publish(&self, id: &str, version: &str, dependencies: &[(&str, &str)], files: &[(&str, &[u8])]) -> &Self {
		let group = DependencyGroup {
			target_framework: None,
			dependencies: dependencies
				.iter()
				.map(|(id, range)| PackageReference::new(*id, VersionRange::parse(range).unwrap()))
				.collect(),
		};
		self.state
			.packages
			.lock()
			.entry(id.to_ascii_lowercase())
			.or_default()
			.push(Published {
				version: PackageVersion::parse(version).unwrap(),
				groups: vec![group],
			});
		self.state.bodies.lock().insert(Self::download_url(id, version), stored_zip(files));
		self
	}

	pub fn feed(&self, name: &str, primary: bool) -> Arc<dyn FeedClient> {
		Arc::new(StaticFeed {
			name: name.to_string(),
			primary,
			state: Arc::clone(&self.state),
		})
	}

	pub fn http(&self) -> Arc<dyn HttpClient> {
		Arc::new(Served {
			state: Arc::clone(&self.state),
		})
	}
}

struct StaticFeed {
	name: String,
	primary: bool,
	state: Arc<State>,
}

impl std::fmt::Debug for StaticFeed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StaticFeed").field("name", &self.name).finish()
	}
}

impl StaticFeed {
	fn groups(&self, id: &str, version: &PackageVersion) -> Result<Vec<DependencyGroup>> {
		self.state
			.packages
			.lock()
			.get(&id.to_ascii_lowercase())
			.and_then(|versions| versions.iter().find(|published| published.version == *version))
			.map(|published| published.groups.clone())
			.ok_or_else(|| Error::NotFound(format!("{id} {version} not on {}", self.name)))
	}
}

#[async_trait]
impl FeedClient for StaticFeed {
	fn name(&self) -> &str {
		&self.name
	}

	fn is_primary(&self) -> bool {
		self.primary
	}

	async fn list_versions(&self, id: &str) -> Result<Vec<PackageVersion>> {
		Ok(self
			.state
			.packages
			.lock()
			.get(&id.to_ascii_lowercase())
			.map(|versions| versions.iter().map(|published| published.version.clone()).collect())
			.unwrap_or_default())
	}

	async fn dependency_groups(&self, id: &str, version: &PackageVersion) -> Result<Vec<DependencyGroup>> {
		self.groups(id, version)
	}

	async fn download_url(&self, id: &str, version: &PackageVersion) -> Result<Url> {
		self.groups(id, version)?;
		Url::parse(&Catalog::download_url(id, &version.to_string())).map_err(|error| Error::InvalidOperation(error.to_string()))
	}

	async fn manifest(&self, id: &str, version: &PackageVersion) -> Result<String> {
		self.groups(id, version)?;
		Ok(format!(
			r#"<package><metadata><id>{id}</id><repository type="git" url="https://github.com/test/{id}.git" commit="{COMMIT}" /></metadata></package>"#
		))
	}
}

struct Served {
	state: Arc<State>,
}

impl Served {
	fn body(&self, url: &Url) -> Result<Bytes> {
		self.state.bodies.lock().get(url.as_str()).cloned().ok_or_else(|| Error::Status {
			url: url.to_string(),
			status: 404,
		})
	}
}

#[async_trait]
impl HttpClient for Served {
	async fn get(&self, url: &Url) -> Result<Bytes> {
		self.body(url)
	}

	async fn get_range(&self, url: &Url, range: Range<u64>) -> Result<Bytes> {
		Ok(self.body(url)?.slice(range.start as usize..range.end as usize))
	}

	async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
		Ok(Some(self.body(url)?.len() as u64))
	}
}
