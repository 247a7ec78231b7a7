//! Continuous-integration build server access.
//!
//! [`BuildServer`] is the seam the CI resolver talks to; [`AzureDevOpsClient`]
//! implements it over the public build REST API and the blob store that backs
//! dedup artifacts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::archive::{BlobStore, DedupManifest};
use crate::http::{HttpClient, get_json, get_json_opt};
use crate::{Error, Result};

const API_VERSION: &str = "7.1";

/// A completed build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
	pub id: u64,
	#[serde(default)]
	pub build_number: String,
	/// Commit the build ran against.
	pub source_version: String,
	pub source_branch: String,
	#[serde(default)]
	pub trigger_info: HashMap<String, String>,
}

impl Build {
	/// Pull request number recorded by the trigger, if any.
	pub fn pull_request(&self) -> Option<u64> {
		self.trigger_info.get("pr.number")?.parse().ok()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactResponse {
	name: String,
	resource: ArtifactResource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactResource {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: String,
}

/// How an artifact's files are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
	/// Files kept as-is in a file container.
	Container { container_id: u64, item_path: String },
	/// Content-addressed files described by a dedup manifest.
	Pipeline { manifest_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
	pub name: String,
	pub kind: ArtifactKind,
}

impl TryFrom<ArtifactResponse> for Artifact {
	type Error = Error;

	fn try_from(response: ArtifactResponse) -> Result<Self> {
		let kind = match response.resource.kind.as_str() {
			"Container" => {
				// `#/<container id>/<item path>`
				let rest = response.resource.data.trim_start_matches("#/");
				let (id, path) = rest.split_once('/').unwrap_or((rest, ""));
				let container_id = id
					.parse()
					.map_err(|_| Error::InvalidOperation(format!("artifact {} has malformed container data", response.name)))?;
				ArtifactKind::Container {
					container_id,
					item_path: path.to_string(),
				}
			}
			"PipelineArtifact" => ArtifactKind::Pipeline {
				manifest_id: response.resource.data,
			},
			other => {
				return Err(Error::InvalidOperation(format!(
					"artifact {} has unsupported storage type {other}",
					response.name
				)));
			}
		};
		Ok(Self {
			name: response.name,
			kind,
		})
	}
}

/// One file or folder inside a container artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerItem {
	pub path: String,
	pub item_type: String,
	#[serde(default)]
	pub content_location: Option<Url>,
}

impl ContainerItem {
	pub fn is_file(&self) -> bool {
		self.item_type.eq_ignore_ascii_case("file")
	}

	pub fn file_name(&self) -> &str {
		self.path.rsplit('/').next().unwrap_or(&self.path)
	}
}

#[derive(Deserialize)]
struct ListResponse<T> {
	value: Vec<T>,
}

#[async_trait]
pub trait BuildServer: BlobStore {
	/// Most recent successful build of `definition` on `branch`.
	async fn latest_build(&self, definition: u32, branch: &str) -> Result<Option<Build>>;

	async fn build(&self, id: u64) -> Result<Option<Build>>;

	async fn artifact(&self, build_id: u64, name: &str) -> Result<Option<Artifact>>;

	/// Files below `item_path` in a container artifact.
	async fn container_items(&self, container_id: u64, item_path: &str) -> Result<Vec<ContainerItem>>;

	async fn dedup_manifest(&self, manifest_id: &str) -> Result<DedupManifest>;
}

/// [`BuildServer`] over the Azure DevOps REST API.
pub struct AzureDevOpsClient {
	http: Arc<dyn HttpClient>,
	base: Url,
	project: String,
	blob_store: Url,
}

impl AzureDevOpsClient {
	pub const DEFAULT_BLOB_STORE: &'static str = "https://vsblob.dev.azure.com/dnceng-public/_apis/blob/blobs";

	pub fn new(http: Arc<dyn HttpClient>, base: Url, project: impl Into<String>, blob_store: Url) -> Self {
		Self {
			http,
			base,
			project: project.into(),
			blob_store,
		}
	}

	fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
		let mut url = self.base.clone();
		url.path_segments_mut()
			.map_err(|_| Error::InvalidOperation(format!("{} cannot be a base url", self.base)))?
			.pop_if_empty()
			.push(&self.project)
			.extend(path.split('/'));
		url.query_pairs_mut()
			.extend_pairs(query)
			.append_pair("api-version", API_VERSION);
		Ok(url)
	}

	fn blob_url(&self, blob_id: &str) -> Result<Url> {
		let mut url = self.blob_store.clone();
		url.path_segments_mut()
			.map_err(|_| Error::InvalidOperation(format!("{} cannot be a base url", self.blob_store)))?
			.pop_if_empty()
			.push(blob_id);
		Ok(url)
	}
}

#[async_trait]
impl BlobStore for AzureDevOpsClient {
	async fn fetch_blob(&self, blob_id: &str) -> Result<Bytes> {
		self.http.get(&self.blob_url(blob_id)?).await
	}
}

#[async_trait]
impl BuildServer for AzureDevOpsClient {
	async fn latest_build(&self, definition: u32, branch: &str) -> Result<Option<Build>> {
		let definition = definition.to_string();
		let url = self.url(
			"_apis/build/builds",
			&[
				("definitions", definition.as_str()),
				("branchName", branch),
				("$top", "1"),
				("statusFilter", "completed"),
				("resultFilter", "succeeded"),
				("queryOrder", "finishTimeDescending"),
			],
		)?;
		debug!(url = %url, "Querying latest build");
		let builds: ListResponse<Build> = get_json(self.http.as_ref(), &url).await?;
		Ok(builds.value.into_iter().next())
	}

	async fn build(&self, id: u64) -> Result<Option<Build>> {
		let url = self.url(&format!("_apis/build/builds/{id}"), &[])?;
		get_json_opt(self.http.as_ref(), &url).await
	}

	async fn artifact(&self, build_id: u64, name: &str) -> Result<Option<Artifact>> {
		let url = self.url(&format!("_apis/build/builds/{build_id}/artifacts"), &[("artifactName", name)])?;
		let response: Option<ArtifactResponse> = get_json_opt(self.http.as_ref(), &url).await?;
		response.map(Artifact::try_from).transpose()
	}

	async fn container_items(&self, container_id: u64, item_path: &str) -> Result<Vec<ContainerItem>> {
		let container_id = container_id.to_string();
		let mut url = self.base.clone();
		url.path_segments_mut()
			.map_err(|_| Error::InvalidOperation(format!("{} cannot be a base url", self.base)))?
			.pop_if_empty()
			.extend(["_apis", "resources", "Containers", container_id.as_str()]);
		url.query_pairs_mut()
			.append_pair("itemPath", item_path)
			.append_pair("api-version", API_VERSION);
		let items: ListResponse<ContainerItem> = get_json(self.http.as_ref(), &url).await?;
		Ok(items.value)
	}

	async fn dedup_manifest(&self, manifest_id: &str) -> Result<DedupManifest> {
		let body = self.fetch_blob(manifest_id).await?;
		let text = std::str::from_utf8(&body).map_err(|e| Error::InvalidOperation(format!("artifact manifest {manifest_id} is not text: {e}")))?;
		DedupManifest::parse(text)
	}
}

#[cfg(test)]
mod tests {
	use std::ops::Range;

	use parking_lot::Mutex;
	use pretty_assertions::assert_eq;

	use super::*;

	struct Canned {
		responses: HashMap<String, &'static str>,
		seen: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl HttpClient for Canned {
		async fn get(&self, url: &Url) -> Result<Bytes> {
			self.seen.lock().push(url.to_string());
			self.responses
				.get(url.as_str())
				.map(|body| Bytes::from_static(body.as_bytes()))
				.ok_or_else(|| Error::Status {
					url: url.to_string(),
					status: 404,
				})
		}

		async fn get_range(&self, url: &Url, _range: Range<u64>) -> Result<Bytes> {
			self.get(url).await
		}

		async fn content_length(&self, _url: &Url) -> Result<Option<u64>> {
			Ok(None)
		}
	}

	fn client(responses: &[(&str, &'static str)]) -> (Arc<Canned>, AzureDevOpsClient) {
		let http = Arc::new(Canned {
			responses: responses.iter().map(|(url, body)| (url.to_string(), *body)).collect(),
			seen: Mutex::new(Vec::new()),
		});
		let server = AzureDevOpsClient::new(
			http.clone(),
			Url::parse("https://dev.azure.com/dnceng-public/").unwrap(),
			"public",
			Url::parse(AzureDevOpsClient::DEFAULT_BLOB_STORE).unwrap(),
		);
		(http, server)
	}

	#[tokio::test]
	async fn latest_build_queries_successful_builds_on_branch() {
		let url = "https://dev.azure.com/dnceng-public/public/_apis/build/builds?definitions=95&branchName=refs%2Fpull%2F123%2Fmerge&%24top=1&statusFilter=completed&resultFilter=succeeded&queryOrder=finishTimeDescending&api-version=7.1";
		let (_, server) = client(&[(
			url,
			r#"{"count":1,"value":[{"id":77,"buildNumber":"20250101.3","sourceVersion":"abc123","sourceBranch":"refs/pull/123/merge","triggerInfo":{"pr.number":"123"}}]}"#,
		)]);

		let build = server.latest_build(95, "refs/pull/123/merge").await.unwrap().unwrap();
		assert_eq!(build.id, 77);
		assert_eq!(build.source_version, "abc123");
		assert_eq!(build.pull_request(), Some(123));
	}

	#[tokio::test]
	async fn missing_build_is_none() {
		let (_, server) = client(&[]);
		assert_eq!(server.build(5).await.unwrap(), None);
	}

	#[tokio::test]
	async fn parses_container_and_pipeline_artifacts() {
		let (_, server) = client(&[
			(
				"https://dev.azure.com/dnceng-public/public/_apis/build/builds/1/artifacts?artifactName=PackageArtifacts&api-version=7.1",
				r##"{"id":1,"name":"PackageArtifacts","resource":{"type":"Container","data":"#/4242/PackageArtifacts"}}"##,
			),
			(
				"https://dev.azure.com/dnceng-public/public/_apis/build/builds/2/artifacts?artifactName=PackageArtifacts&api-version=7.1",
				r#"{"id":2,"name":"PackageArtifacts","resource":{"type":"PipelineArtifact","data":"MANIFEST01"}}"#,
			),
		]);

		let container = server.artifact(1, "PackageArtifacts").await.unwrap().unwrap();
		assert_eq!(
			container.kind,
			ArtifactKind::Container {
				container_id: 4242,
				item_path: "PackageArtifacts".into(),
			}
		);
		let pipeline = server.artifact(2, "PackageArtifacts").await.unwrap().unwrap();
		assert_eq!(
			pipeline.kind,
			ArtifactKind::Pipeline {
				manifest_id: "MANIFEST01".into(),
			}
		);
	}

	#[tokio::test]
	async fn dedup_manifest_and_blobs_come_from_blob_store() {
		let (http, server) = client(&[
			(
				"https://vsblob.dev.azure.com/dnceng-public/_apis/blob/blobs/MANIFEST01",
				"download BLOB1 bin/Microsoft.CodeAnalysis.dll\n",
			),
			("https://vsblob.dev.azure.com/dnceng-public/_apis/blob/blobs/BLOB1", "MZ"),
		]);

		let manifest = server.dedup_manifest("MANIFEST01").await.unwrap();
		assert_eq!(manifest.files().len(), 1);
		assert_eq!(server.fetch_blob("BLOB1").await.unwrap().as_ref(), b"MZ");
		assert_eq!(http.seen.lock().len(), 2);
	}
}
