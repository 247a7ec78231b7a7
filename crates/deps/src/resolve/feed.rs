use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use super::CompilerResolver;
use crate::archive::{self, EntrySource};
use crate::cache::PackageCache;
use crate::compiler::{BuildConfiguration, CompilerInfo};
use crate::feed::{FeedClient, FeedSet};
use crate::http::HttpClient;
use crate::package::{CommitLink, PackageIdentity, PackageInfo, PackageSource, ResolvedPackage};
use crate::specifier::VersionSpecifier;
use crate::{Error, Result};

static REPOSITORY_ELEMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
	Regex::new(r"<repository\b([^>]*)>")
		.map_err(|error| warn!(error = %error, "Failed to compile repository element pattern"))
		.ok()
});

static ATTRIBUTE: LazyLock<Option<Regex>> = LazyLock::new(|| {
	Regex::new(r#"([A-Za-z]+)\s*=\s*"([^"]*)""#)
		.map_err(|error| warn!(error = %error, "Failed to compile attribute pattern"))
		.ok()
});

/// Claims exact versions and `latest`, answered from the configured feeds.
pub struct FeedResolver {
	cache: Arc<PackageCache>,
	feeds: FeedSet,
	http: Arc<dyn HttpClient>,
	range_hosts: Arc<[String]>,
}

impl FeedResolver {
	pub fn new(cache: Arc<PackageCache>, feeds: FeedSet, http: Arc<dyn HttpClient>, range_hosts: Arc<[String]>) -> Self {
		Self {
			cache,
			feeds,
			http,
			range_hosts,
		}
	}

	fn intern(&self, compiler: &'static CompilerInfo, identity: PackageIdentity, feed: Arc<dyn FeedClient>) -> Arc<ResolvedPackage> {
		self.cache.package(identity, || {
			Box::new(FeedPackageSource::new(feed, Arc::clone(&self.http), Arc::clone(&self.range_hosts)).for_compiler(compiler))
		})
	}
}

#[async_trait]
impl CompilerResolver for FeedResolver {
	fn name(&self) -> &'static str {
		"package feed"
	}

	async fn resolve(
		&self,
		compiler: &'static CompilerInfo,
		specifier: &VersionSpecifier,
		_configuration: BuildConfiguration,
	) -> Result<Option<Arc<ResolvedPackage>>> {
		match specifier {
			VersionSpecifier::ExactVersion(version) => {
				let Some(feed) = self.feeds.find(compiler.package_id, version).await? else {
					return Err(Error::NotFound(format!(
						"{} {version} is not published on any configured feed",
						compiler.package_id
					)));
				};
				let identity = PackageIdentity::new(compiler.package_id, version.clone());
				Ok(Some(self.intern(compiler, identity, feed)))
			}
			VersionSpecifier::Latest => {
				let Some((feed, version)) = self.feeds.latest(compiler.package_id).await? else {
					return Err(Error::NotFound(format!(
						"{} is not published on any configured feed",
						compiler.package_id
					)));
				};
				debug!(package = compiler.package_id, version = %version, feed = feed.name(), "Latest version");
				let identity = PackageIdentity::new(compiler.package_id, version);
				Ok(Some(self.intern(compiler, identity, feed)))
			}
			_ => Ok(None),
		}
	}
}

/// A package downloaded from one feed.
pub struct FeedPackageSource {
	feed: Arc<dyn FeedClient>,
	http: Arc<dyn HttpClient>,
	range_hosts: Arc<[String]>,
	compiler: Option<&'static CompilerInfo>,
}

impl FeedPackageSource {
	pub fn new(feed: Arc<dyn FeedClient>, http: Arc<dyn HttpClient>, range_hosts: Arc<[String]>) -> Self {
		Self {
			feed,
			http,
			range_hosts,
			compiler: None,
		}
	}

	/// Falls back to `compiler`'s repository for commit links the manifest
	/// does not spell out.
	pub fn for_compiler(mut self, compiler: &'static CompilerInfo) -> Self {
		self.compiler = Some(compiler);
		self
	}

	fn commit_link(&self, manifest: &str) -> Option<CommitLink> {
		let (hash, repository) = repository_commit(manifest)?;
		let url = match repository {
			Some(repository) => format!("{}/commit/{hash}", repository.trim_end_matches('/').trim_end_matches(".git")),
			None => self.compiler?.commit_url(&hash),
		};
		Some(CommitLink { hash, url })
	}
}

impl std::fmt::Debug for FeedPackageSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FeedPackageSource")
			.field("feed", &self.feed.name())
			.field("compiler", &self.compiler.map(|compiler| compiler.package_id))
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl PackageSource for FeedPackageSource {
	async fn info(&self, identity: &PackageIdentity) -> Result<PackageInfo> {
		let commit = match self.feed.manifest(identity.id(), identity.version()).await {
			Ok(manifest) => self.commit_link(&manifest),
			Err(error) => {
				debug!(package = %identity, error = %error, "Package manifest unavailable");
				None
			}
		};
		Ok(PackageInfo {
			version: identity.version().to_string(),
			commit,
			from_primary_registry: self.feed.is_primary(),
		})
	}

	async fn open(&self, identity: &PackageIdentity) -> Result<Arc<dyn EntrySource>> {
		let url = self.feed.download_url(identity.id(), identity.version()).await?;
		debug!(package = %identity, url = %url, "Opening package");
		let archive = archive::open_remote(Arc::clone(&self.http), &url, &self.range_hosts).await?;
		Ok(Arc::new(archive))
	}
}

/// Commit hash and repository url from a package manifest's `<repository>`
/// element.
fn repository_commit(manifest: &str) -> Option<(String, Option<String>)> {
	let element = REPOSITORY_ELEMENT.as_ref()?.captures(manifest)?;
	let attributes = element.get(1)?.as_str();

	let mut commit = None;
	let mut url = None;
	for attribute in ATTRIBUTE.as_ref()?.captures_iter(attributes) {
		let value = attribute[2].trim();
		match &attribute[1] {
			"commit" if !value.is_empty() => commit = Some(value.to_string()),
			"url" if !value.is_empty() => url = Some(value.to_string()),
			_ => {}
		}
	}
	commit.map(|commit| (commit, url))
}
