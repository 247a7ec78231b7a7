use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::CompilerResolver;
use crate::archive::{self, BlobStore, DedupArtifact, DedupFile, EntrySource};
use crate::build_server::{ArtifactKind, Build, BuildServer, ContainerItem};
use crate::cache::PackageCache;
use crate::compiler::{BuildConfiguration, CompilerInfo};
use crate::http::HttpClient;
use crate::package::{CommitLink, PackageIdentity, PackageInfo, PackageSource, ResolvedPackage};
use crate::specifier::VersionSpecifier;
use crate::version::PackageVersion;
use crate::{Error, Result};

/// Claims build ids, pull requests and branches, answered from CI artifacts.
pub struct CiResolver {
	cache: Arc<PackageCache>,
	server: Arc<dyn BuildServer>,
	http: Arc<dyn HttpClient>,
	range_hosts: Arc<[String]>,
}

impl CiResolver {
	pub fn new(cache: Arc<PackageCache>, server: Arc<dyn BuildServer>, http: Arc<dyn HttpClient>, range_hosts: Arc<[String]>) -> Self {
		Self {
			cache,
			server,
			http,
			range_hosts,
		}
	}

	async fn find_build(&self, compiler: &CompilerInfo, specifier: &VersionSpecifier) -> Result<Option<Build>> {
		let definition = compiler.build_definition;
		match specifier {
			VersionSpecifier::CiBuild(id) => {
				let build = self.server.build(*id).await?;
				build.map(Some).ok_or_else(|| Error::NotFound(format!("build {id} not found")))
			}
			VersionSpecifier::PullRequest(number) => {
				let branch = format!("refs/pull/{number}/merge");
				let build = self
					.server
					.latest_build(definition, &branch)
					.await?
					.ok_or_else(|| Error::NotFound(format!("no successful build of pull request #{number}")))?;
				if let Some(actual) = build.pull_request()
					&& actual != *number
				{
					return Err(Error::InvalidOperation(format!(
						"build {} belongs to pull request #{actual}, not #{number}",
						build.id
					)));
				}
				Ok(Some(build))
			}
			VersionSpecifier::Branch(name) => {
				let branch = format!("refs/heads/{name}");
				let build = self
					.server
					.latest_build(definition, &branch)
					.await?
					.ok_or_else(|| Error::NotFound(format!("no successful build of branch '{name}'")))?;
				Ok(Some(build))
			}
			_ => Ok(None),
		}
	}

	async fn package_for(
		&self,
		compiler: &'static CompilerInfo,
		build: Build,
		configuration: BuildConfiguration,
	) -> Result<Arc<ResolvedPackage>> {
		let artifact = self
			.server
			.artifact(build.id, compiler.artifact_name)
			.await?
			.ok_or_else(|| Error::NotFound(format!("build {} has no artifact '{}'", build.id, compiler.artifact_name)))?;

		match artifact.kind {
			ArtifactKind::Container { container_id, item_path } => {
				let items = self.server.container_items(container_id, &item_path).await?;
				let item = pick_package(&items, compiler.package_id, configuration).ok_or_else(|| {
					Error::NotFound(format!(
						"artifact '{}' of build {} contains no {} package",
						artifact.name, build.id, compiler.package_id
					))
				})?;
				let url = item
					.content_location
					.clone()
					.ok_or_else(|| Error::InvalidOperation(format!("artifact item {} has no download location", item.path)))?;
				let version = package_version(item.file_name(), compiler.package_id).unwrap_or_else(|| ci_version(&build));
				let label = version.to_string();
				debug!(build = build.id, item = %item.path, version = %version, "Selected CI package");

				let identity = PackageIdentity::new(compiler.package_id, version);
				Ok(self.cache.package(identity, || {
					Box::new(CiPackageSource {
						info: ci_info(compiler, &build, label),
						contents: CiContents::Archive {
							http: Arc::clone(&self.http),
							url,
							range_hosts: Arc::clone(&self.range_hosts),
						},
					})
				}))
			}
			ArtifactKind::Pipeline { manifest_id } => {
				let manifest = self.server.dedup_manifest(&manifest_id).await?;
				let files = manifest.locate(compiler.loose_binaries)?;
				debug!(build = build.id, files = files.len(), "Located loose CI binaries");

				let identity = PackageIdentity::new(compiler.package_id, ci_version(&build));
				let store: Arc<dyn BlobStore> = Arc::clone(&self.server) as Arc<dyn BlobStore>;
				Ok(self.cache.package(identity, || {
					Box::new(CiPackageSource {
						info: ci_info(compiler, &build, format!("ci-{}", build.id)),
						contents: CiContents::Dedup {
							store,
							folder: compiler.package_folder,
							files,
						},
					})
				}))
			}
		}
	}
}

#[async_trait]
impl CompilerResolver for CiResolver {
	fn name(&self) -> &'static str {
		"build server"
	}

	async fn resolve(
		&self,
		compiler: &'static CompilerInfo,
		specifier: &VersionSpecifier,
		configuration: BuildConfiguration,
	) -> Result<Option<Arc<ResolvedPackage>>> {
		let Some(build) = self.find_build(compiler, specifier).await? else {
			return Ok(None);
		};
		debug!(build = build.id, commit = %build.source_version, branch = %build.source_branch, "Found CI build");
		self.package_for(compiler, build, configuration).await.map(Some)
	}
}

/// The `.nupkg` for `package_id`, preferring the one built in `configuration`.
fn pick_package<'a>(items: &'a [ContainerItem], package_id: &str, configuration: BuildConfiguration) -> Option<&'a ContainerItem> {
	let prefix = format!("{}.", package_id.to_ascii_lowercase());
	let segment = format!("/{}/", configuration.as_str().to_ascii_lowercase());

	let mut candidates = items.iter().filter(|item| {
		let name = item.file_name().to_ascii_lowercase();
		item.is_file()
			&& name.starts_with(&prefix)
			&& name.ends_with(".nupkg")
			&& !name.ends_with(".symbols.nupkg")
			&& package_version(item.file_name(), package_id).is_some()
	});
	let first = candidates.clone().next();
	candidates
		.find(|item| item.path.to_ascii_lowercase().contains(&segment))
		.or(first)
}

/// Version embedded in a `<id>.<version>.nupkg` file name.
fn package_version(file_name: &str, package_id: &str) -> Option<PackageVersion> {
	let rest = file_name.get(package_id.len() + 1..)?;
	let version = rest.strip_suffix(".nupkg")?;
	PackageVersion::parse(version).ok()
}

fn ci_version(build: &Build) -> PackageVersion {
	let label = format!("0.0.0-ci.{}", build.id);
	PackageVersion::parse(&label).unwrap_or_else(|_| PackageVersion::new(0, 0, 0))
}

fn ci_info(compiler: &CompilerInfo, build: &Build, version: String) -> PackageInfo {
	let commit = (!build.source_version.is_empty()).then(|| CommitLink {
		hash: build.source_version.clone(),
		url: compiler.commit_url(&build.source_version),
	});
	PackageInfo {
		version,
		commit,
		from_primary_registry: false,
	}
}

enum CiContents {
	Archive {
		http: Arc<dyn HttpClient>,
		url: Url,
		range_hosts: Arc<[String]>,
	},
	Dedup {
		store: Arc<dyn BlobStore>,
		folder: &'static str,
		files: Vec<DedupFile>,
	},
}

/// A compiler package produced by a CI build.
struct CiPackageSource {
	info: PackageInfo,
	contents: CiContents,
}

impl std::fmt::Debug for CiPackageSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut debug = f.debug_struct("CiPackageSource");
		debug.field("info", &self.info);
		match &self.contents {
			CiContents::Archive { url, .. } => debug.field("url", &url.as_str()),
			CiContents::Dedup { files, .. } => debug.field("files", files),
		};
		debug.finish()
	}
}

#[async_trait]
impl PackageSource for CiPackageSource {
	async fn info(&self, _identity: &PackageIdentity) -> Result<PackageInfo> {
		Ok(self.info.clone())
	}

	async fn open(&self, identity: &PackageIdentity) -> Result<Arc<dyn EntrySource>> {
		match &self.contents {
			CiContents::Archive { http, url, range_hosts } => {
				debug!(package = %identity, url = %url, "Opening CI package");
				Ok(Arc::new(archive::open_remote(Arc::clone(http), url, range_hosts).await?))
			}
			CiContents::Dedup { store, folder, files } => {
				Ok(Arc::new(DedupArtifact::new(Arc::clone(store), folder, files.clone())))
			}
		}
	}
}
