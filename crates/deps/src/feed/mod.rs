//! Package feeds.
//!
//! A [`FeedSet`] holds feeds in priority order. Lookups never merge results
//! across feeds: the first feed that knows a package id answers for it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::Result;
use crate::framework::TargetFramework;
use crate::version::{PackageVersion, VersionRange};

mod solver;
mod v3;

pub use solver::{ClosureResolution, ResolvedReference, resolve_closure};
pub use v3::V3FeedClient;

/// A dependency on a package id within a version range.
///
/// Ids compare case-insensitively.
#[derive(Debug, Clone)]
pub struct PackageReference {
	pub id: String,
	pub range: VersionRange,
}

impl PackageReference {
	pub fn new(id: impl Into<String>, range: VersionRange) -> Self {
		Self { id: id.into(), range }
	}

	fn sort_key(&self) -> (String, String) {
		(self.id.to_ascii_lowercase(), self.range.to_string())
	}
}

impl PartialEq for PackageReference {
	fn eq(&self, other: &Self) -> bool {
		self.id.eq_ignore_ascii_case(&other.id) && self.range == other.range
	}
}

impl Eq for PackageReference {}

impl std::hash::Hash for PackageReference {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.id.to_ascii_lowercase().hash(state);
		self.range.hash(state);
	}
}

impl fmt::Display for PackageReference {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.id, self.range)
	}
}

/// A set of package references resolved for one target framework.
///
/// References are kept sorted and deduplicated so that equal sets compare and
/// hash equal regardless of the order they were given in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySet {
	references: Vec<PackageReference>,
	target_framework: TargetFramework,
}

impl DependencySet {
	pub fn new(references: impl IntoIterator<Item = PackageReference>, target_framework: TargetFramework) -> Self {
		let mut references: Vec<PackageReference> = references.into_iter().collect();
		references.sort_by_key(PackageReference::sort_key);
		references.dedup_by(|a, b| a.sort_key() == b.sort_key());
		Self {
			references,
			target_framework,
		}
	}

	pub fn references(&self) -> &[PackageReference] {
		&self.references
	}

	pub fn target_framework(&self) -> TargetFramework {
		self.target_framework
	}

	pub fn is_empty(&self) -> bool {
		self.references.is_empty()
	}
}

impl fmt::Display for DependencySet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let references: Vec<String> = self.references.iter().map(ToString::to_string).collect();
		write!(f, "{} ({})", references.join(", "), self.target_framework)
	}
}

/// Dependencies declared for one target framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGroup {
	/// `None` for the framework-agnostic group.
	pub target_framework: Option<String>,
	pub dependencies: Vec<PackageReference>,
}

impl DependencyGroup {
	/// Picks the group nearest to `target`. Groups with unrecognized
	/// frameworks are ignored.
	pub fn select<'a>(groups: &'a [DependencyGroup], target: &TargetFramework) -> Option<&'a DependencyGroup> {
		let parsed: Vec<(TargetFramework, &DependencyGroup)> = groups
			.iter()
			.filter_map(|group| match &group.target_framework {
				None => Some((TargetFramework::ANY, group)),
				Some(name) => TargetFramework::parse(name).ok().map(|framework| (framework, group)),
			})
			.collect();
		let nearest = target.nearest(parsed.iter().map(|(framework, _)| framework))?;
		parsed.iter().find(|(framework, _)| framework == nearest).map(|(_, group)| *group)
	}
}

/// One package source speaking some feed protocol.
#[async_trait]
pub trait FeedClient: Send + Sync + fmt::Debug {
	fn name(&self) -> &str;

	/// True for the public primary registry.
	fn is_primary(&self) -> bool;

	/// Every published version of `id`; empty when the feed does not know it.
	async fn list_versions(&self, id: &str) -> Result<Vec<PackageVersion>>;

	async fn dependency_groups(&self, id: &str, version: &PackageVersion) -> Result<Vec<DependencyGroup>>;

	async fn download_url(&self, id: &str, version: &PackageVersion) -> Result<Url>;

	/// The package manifest (`.nuspec`) as text.
	async fn manifest(&self, id: &str, version: &PackageVersion) -> Result<String>;
}

/// Versions of a package as listed by the feed that answered.
#[derive(Debug, Clone)]
pub struct FeedVersions {
	pub feed: Arc<dyn FeedClient>,
	pub versions: Vec<PackageVersion>,
}

/// Feeds in priority order.
#[derive(Debug, Clone, Default)]
pub struct FeedSet {
	feeds: Vec<Arc<dyn FeedClient>>,
}

impl FeedSet {
	pub fn new(feeds: Vec<Arc<dyn FeedClient>>) -> Self {
		Self { feeds }
	}

	pub fn feeds(&self) -> &[Arc<dyn FeedClient>] {
		&self.feeds
	}

	/// Versions from the first feed that lists any.
	///
	/// A failing feed is skipped with a warning; its error is returned only if
	/// no later feed answers.
	pub async fn versions(&self, id: &str) -> Result<Option<FeedVersions>> {
		let mut first_error = None;
		for feed in &self.feeds {
			match feed.list_versions(id).await {
				Ok(versions) if !versions.is_empty() => {
					debug!(feed = feed.name(), package = id, count = versions.len(), "Listed package versions");
					return Ok(Some(FeedVersions {
						feed: Arc::clone(feed),
						versions,
					}));
				}
				Ok(_) => {}
				Err(error) => {
					warn!(feed = feed.name(), package = id, error = %error, "Feed lookup failed");
					first_error.get_or_insert(error);
				}
			}
		}
		first_error.map_or(Ok(None), Err)
	}

	/// Highest version from the first feed that lists any.
	pub async fn latest(&self, id: &str) -> Result<Option<(Arc<dyn FeedClient>, PackageVersion)>> {
		let Some(found) = self.versions(id).await? else {
			return Ok(None);
		};
		Ok(found.versions.into_iter().max().map(|version| (found.feed, version)))
	}

	/// The first feed that lists exactly `version`.
	pub async fn find(&self, id: &str, version: &PackageVersion) -> Result<Option<Arc<dyn FeedClient>>> {
		let mut first_error = None;
		for feed in &self.feeds {
			match feed.list_versions(id).await {
				Ok(versions) if versions.contains(version) => return Ok(Some(Arc::clone(feed))),
				Ok(_) => {}
				Err(error) => {
					warn!(feed = feed.name(), package = id, error = %error, "Feed lookup failed");
					first_error.get_or_insert(error);
				}
			}
		}
		first_error.map_or(Ok(None), Err)
	}
}

#[cfg(test)]
pub(crate) mod tests;
