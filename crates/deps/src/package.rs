//! Resolved packages: identity, lazy metadata and lazy archive access.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::Result;
use crate::archive::EntrySource;
use crate::version::PackageVersion;

/// Package id plus exact version. Ids compare case-insensitively.
#[derive(Debug, Clone)]
pub struct PackageIdentity {
	id: Arc<str>,
	version: PackageVersion,
}

impl PackageIdentity {
	pub fn new(id: impl Into<Arc<str>>, version: PackageVersion) -> Self {
		Self { id: id.into(), version }
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn version(&self) -> &PackageVersion {
		&self.version
	}

	fn key(&self) -> (String, &PackageVersion) {
		(self.id.to_ascii_lowercase(), &self.version)
	}
}

impl PartialEq for PackageIdentity {
	fn eq(&self, other: &Self) -> bool {
		self.id.eq_ignore_ascii_case(&other.id) && self.version == other.version
	}
}

impl Eq for PackageIdentity {}

impl std::hash::Hash for PackageIdentity {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.id.to_ascii_lowercase().hash(state);
		self.version.hash(state);
	}
}

impl PartialOrd for PackageIdentity {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for PackageIdentity {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.key().cmp(&other.key())
	}
}

impl fmt::Display for PackageIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.id, self.version)
	}
}

/// Source commit a package was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLink {
	pub hash: String,
	pub url: String,
}

impl CommitLink {
	pub fn short_hash(&self) -> &str {
		self.hash.get(..7).unwrap_or(&self.hash)
	}
}

/// Descriptive metadata for a resolved package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
	/// Human-facing version label.
	pub version: String,
	pub commit: Option<CommitLink>,
	/// True when the package came from the public primary registry.
	pub from_primary_registry: bool,
}

/// Where a resolved package's metadata and bytes come from.
#[async_trait]
pub trait PackageSource: Send + Sync + fmt::Debug {
	/// Computes descriptive metadata. Called at most once per package.
	async fn info(&self, identity: &PackageIdentity) -> Result<PackageInfo>;

	/// Opens the package contents. Called at most once per package.
	async fn open(&self, identity: &PackageIdentity) -> Result<Arc<dyn EntrySource>>;

	/// False for packages whose assemblies ship with the host.
	fn provides_assets(&self) -> bool {
		true
	}
}

/// A package pinned to an exact identity, with memoized metadata and archive.
///
/// Instances are interned by the [`PackageCache`](crate::PackageCache), so the
/// archive behind one identity is opened at most once per process.
#[derive(Debug)]
pub struct ResolvedPackage {
	identity: PackageIdentity,
	source: Box<dyn PackageSource>,
	info: OnceCell<PackageInfo>,
	archive: OnceCell<Arc<dyn EntrySource>>,
}

impl ResolvedPackage {
	pub fn new(identity: PackageIdentity, source: Box<dyn PackageSource>) -> Self {
		Self {
			identity,
			source,
			info: OnceCell::new(),
			archive: OnceCell::new(),
		}
	}

	pub fn identity(&self) -> &PackageIdentity {
		&self.identity
	}

	/// True when the binaries are part of the host rather than downloaded.
	pub fn is_builtin(&self) -> bool {
		!self.source.provides_assets()
	}

	/// Descriptive metadata, computed on first request. Failures are not
	/// memoized.
	pub async fn info(&self) -> Result<&PackageInfo> {
		self.info.get_or_try_init(|| self.source.info(&self.identity)).await
	}

	/// Archive contents, opened on first request. Failures are not memoized.
	pub async fn archive(&self) -> Result<Arc<dyn EntrySource>> {
		self.archive
			.get_or_try_init(|| self.source.open(&self.identity))
			.await
			.map(Arc::clone)
	}
}
