//! NuGet V3 protocol client.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use url::Url;

use super::{DependencyGroup, FeedClient, PackageReference};
use crate::http::{HttpClient, get_json, get_json_opt};
use crate::version::{PackageVersion, VersionRange};
use crate::{Error, Result};

const PACKAGE_BASE_ADDRESS: &str = "PackageBaseAddress/3.0.0";
/// Registration hives in preference order. The 3.6.0 hive includes SemVer 2
/// packages.
const REGISTRATIONS: &[&str] = &["RegistrationsBaseUrl/3.6.0", "RegistrationsBaseUrl/3.4.0", "RegistrationsBaseUrl"];

#[derive(Deserialize)]
struct ServiceIndex {
	resources: Vec<ServiceResource>,
}

#[derive(Deserialize)]
struct ServiceResource {
	#[serde(rename = "@id")]
	id: String,
	#[serde(rename = "@type")]
	kind: String,
}

#[derive(Debug)]
struct Endpoints {
	package_base: Url,
	registrations: Option<Url>,
}

#[derive(Deserialize)]
struct VersionIndex {
	versions: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationLeaf {
	catalog_entry: CatalogEntryRef,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogEntryRef {
	Url(Url),
	Inline(CatalogEntry),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
	#[serde(default)]
	dependency_groups: Vec<CatalogGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogGroup {
	#[serde(default)]
	target_framework: Option<String>,
	#[serde(default)]
	dependencies: Vec<CatalogDependency>,
}

#[derive(Deserialize)]
struct CatalogDependency {
	id: String,
	#[serde(default)]
	range: Option<String>,
}

/// A feed speaking the V3 protocol, discovered from its service index.
pub struct V3FeedClient {
	http: Arc<dyn HttpClient>,
	name: String,
	index: Url,
	primary: bool,
	endpoints: OnceCell<Endpoints>,
}

impl fmt::Debug for V3FeedClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("V3FeedClient")
			.field("name", &self.name)
			.field("index", &self.index.as_str())
			.field("primary", &self.primary)
			.finish()
	}
}

impl V3FeedClient {
	pub fn new(http: Arc<dyn HttpClient>, name: impl Into<String>, index: Url, primary: bool) -> Self {
		Self {
			http,
			name: name.into(),
			index,
			primary,
			endpoints: OnceCell::new(),
		}
	}

	async fn endpoints(&self) -> Result<&Endpoints> {
		self.endpoints
			.get_or_try_init(|| async {
				let index: ServiceIndex = get_json(self.http.as_ref(), &self.index).await?;
				let find = |kind: &str| {
					index
						.resources
						.iter()
						.find(|resource| resource.kind == kind)
						.and_then(|resource| Url::parse(&with_trailing_slash(&resource.id)).ok())
				};
				let package_base = find(PACKAGE_BASE_ADDRESS).ok_or_else(|| Error::Json {
					url: self.index.to_string(),
					message: format!("service index has no {PACKAGE_BASE_ADDRESS} resource"),
				})?;
				let registrations = REGISTRATIONS.iter().find_map(|kind| find(*kind));
				debug!(feed = %self.name, package_base = %package_base, "Discovered feed endpoints");
				Ok(Endpoints {
					package_base,
					registrations,
				})
			})
			.await
	}

	fn join(&self, base: &Url, path: &str) -> Result<Url> {
		base.join(path).map_err(|e| Error::InvalidOperation(format!("invalid feed url {base}{path}: {e}")))
	}

	async fn catalog_entry(&self, id: &str, version: &PackageVersion) -> Result<CatalogEntry> {
		let endpoints = self.endpoints().await?;
		let registrations = endpoints.registrations.as_ref().ok_or_else(|| Error::NotFound(format!("feed {} has no registration resource", self.name)))?;
		let url = self.join(registrations, &format!("{}/{}.json", lower(id), lower(&version.normalized())))?;
		let leaf: RegistrationLeaf = get_json_opt(self.http.as_ref(), &url)
			.await?
			.ok_or_else(|| Error::NotFound(format!("{id} {version} not found on {}", self.name)))?;
		match leaf.catalog_entry {
			CatalogEntryRef::Inline(entry) => Ok(entry),
			CatalogEntryRef::Url(url) => get_json(self.http.as_ref(), &url).await,
		}
	}
}

#[async_trait]
impl FeedClient for V3FeedClient {
	fn name(&self) -> &str {
		&self.name
	}

	fn is_primary(&self) -> bool {
		self.primary
	}

	async fn list_versions(&self, id: &str) -> Result<Vec<PackageVersion>> {
		let endpoints = self.endpoints().await?;
		let url = self.join(&endpoints.package_base, &format!("{}/index.json", lower(id)))?;
		let Some(index) = get_json_opt::<VersionIndex>(self.http.as_ref(), &url).await? else {
			return Ok(Vec::new());
		};
		Ok(index
			.versions
			.iter()
			.filter_map(|text| match PackageVersion::parse(text) {
				Ok(version) => Some(version),
				Err(_) => {
					trace!(feed = %self.name, package = id, version = %text, "Skipping unparseable version");
					None
				}
			})
			.collect())
	}

	async fn dependency_groups(&self, id: &str, version: &PackageVersion) -> Result<Vec<DependencyGroup>> {
		let entry = self.catalog_entry(id, version).await?;
		entry
			.dependency_groups
			.into_iter()
			.map(|group| {
				let dependencies = group
					.dependencies
					.into_iter()
					.map(|dependency| {
						let range = dependency.range.as_deref().map(VersionRange::parse).transpose()?.unwrap_or_else(VersionRange::any);
						Ok(PackageReference::new(dependency.id, range))
					})
					.collect::<Result<Vec<_>>>()?;
				Ok(DependencyGroup {
					target_framework: group.target_framework.filter(|name| !name.trim().is_empty()),
					dependencies,
				})
			})
			.collect()
	}

	async fn download_url(&self, id: &str, version: &PackageVersion) -> Result<Url> {
		let endpoints = self.endpoints().await?;
		let (id, version) = (lower(id), lower(&version.normalized()));
		self.join(&endpoints.package_base, &format!("{id}/{version}/{id}.{version}.nupkg"))
	}

	async fn manifest(&self, id: &str, version: &PackageVersion) -> Result<String> {
		let endpoints = self.endpoints().await?;
		let (id, version) = (lower(id), lower(&version.normalized()));
		let url = self.join(&endpoints.package_base, &format!("{id}/{version}/{id}.nuspec"))?;
		let body = self.http.get(&url).await?;
		String::from_utf8(body.to_vec()).map_err(|e| Error::Json {
			url: url.to_string(),
			message: e.to_string(),
		})
	}
}

fn lower(text: &str) -> String {
	text.to_ascii_lowercase()
}

fn with_trailing_slash(url: &str) -> String {
	if url.ends_with('/') { url.to_string() } else { format!("{url}/") }
}
