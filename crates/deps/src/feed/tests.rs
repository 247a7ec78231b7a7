use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::Error;
use crate::http::HttpClient;

/// An in-memory feed.
#[derive(Debug, Default)]
pub(crate) struct MemoryFeed {
	name: String,
	primary: bool,
	packages: Mutex<HashMap<String, Vec<(PackageVersion, Vec<DependencyGroup>, String)>>>,
	broken_metadata: Mutex<HashSet<String>>,
	offline: bool,
	pub(crate) listings: AtomicUsize,
}

impl MemoryFeed {
	pub(crate) fn new(name: &str, primary: bool) -> Self {
		Self {
			name: name.to_string(),
			primary,
			..Self::default()
		}
	}

	pub(crate) fn offline(name: &str) -> Self {
		Self {
			offline: true,
			..Self::new(name, false)
		}
	}

	/// Publishes `id` at `version` with dependencies for `framework` (`None`
	/// for the framework-agnostic group).
	pub(crate) fn publish(self, id: &str, version: &str, framework: Option<&str>, dependencies: &[(&str, &str)]) -> Self {
		let group = DependencyGroup {
			target_framework: framework.map(str::to_string),
			dependencies: dependencies
				.iter()
				.map(|(id, range)| PackageReference::new(*id, VersionRange::parse(range).unwrap()))
				.collect(),
		};
		self.publish_with_manifest(id, version, vec![group], "<package/>")
	}

	pub(crate) fn publish_with_manifest(self, id: &str, version: &str, groups: Vec<DependencyGroup>, manifest: &str) -> Self {
		self.packages.lock().entry(id.to_ascii_lowercase()).or_default().push((
			PackageVersion::parse(version).unwrap(),
			groups,
			manifest.to_string(),
		));
		self
	}

	pub(crate) fn break_metadata(self, id: &str) -> Self {
		self.broken_metadata.lock().insert(id.to_ascii_lowercase());
		self
	}

	fn entry<T>(&self, id: &str, version: &PackageVersion, pick: impl Fn(&(PackageVersion, Vec<DependencyGroup>, String)) -> T) -> Result<T> {
		self.packages
			.lock()
			.get(&id.to_ascii_lowercase())
			.and_then(|versions| versions.iter().find(|(v, _, _)| v == version).map(pick))
			.ok_or_else(|| Error::NotFound(format!("{id} {version} not on {}", self.name)))
	}
}

#[async_trait]
impl FeedClient for MemoryFeed {
	fn name(&self) -> &str {
		&self.name
	}

	fn is_primary(&self) -> bool {
		self.primary
	}

	async fn list_versions(&self, id: &str) -> Result<Vec<PackageVersion>> {
		self.listings.fetch_add(1, Ordering::SeqCst);
		if self.offline {
			return Err(Error::Http {
				url: format!("memory://{}", self.name),
				message: "offline".into(),
			});
		}
		Ok(self
			.packages
			.lock()
			.get(&id.to_ascii_lowercase())
			.map(|versions| versions.iter().map(|(version, _, _)| version.clone()).collect())
			.unwrap_or_default())
	}

	async fn dependency_groups(&self, id: &str, version: &PackageVersion) -> Result<Vec<DependencyGroup>> {
		if self.broken_metadata.lock().contains(&id.to_ascii_lowercase()) {
			return Err(Error::Status {
				url: format!("memory://{}/{id}", self.name),
				status: 500,
			});
		}
		self.entry(id, version, |(_, groups, _)| groups.clone())
	}

	async fn download_url(&self, id: &str, version: &PackageVersion) -> Result<Url> {
		Url::parse(&format!("https://{}.example/{id}.{version}.nupkg", self.name)).map_err(|e| Error::InvalidOperation(e.to_string()))
	}

	async fn manifest(&self, id: &str, version: &PackageVersion) -> Result<String> {
		self.entry(id, version, |(_, _, manifest)| manifest.clone())
	}
}

fn feeds(feeds: Vec<MemoryFeed>) -> FeedSet {
	FeedSet::new(feeds.into_iter().map(|feed| Arc::new(feed) as Arc<dyn FeedClient>).collect())
}

fn reference(id: &str, range: &str) -> PackageReference {
	PackageReference::new(id, VersionRange::parse(range).unwrap())
}

fn net8() -> TargetFramework {
	TargetFramework::parse("net8.0").unwrap()
}

#[tokio::test]
async fn latest_comes_from_first_feed_with_results() {
	let set = feeds(vec![
		MemoryFeed::new("tools", false).publish("Roslyn", "4.13.0-2.final", None, &[]),
		MemoryFeed::new("nuget", true)
			.publish("Roslyn", "4.12.0", None, &[])
			.publish("Roslyn", "9.9.9", None, &[]),
	]);
	let (feed, version) = set.latest("roslyn").await.unwrap().unwrap();
	assert_eq!(feed.name(), "tools");
	assert_eq!(version.to_string(), "4.13.0-2.final");
}

#[tokio::test]
async fn find_skips_failing_and_non_listing_feeds() {
	let set = feeds(vec![
		MemoryFeed::offline("mirror"),
		MemoryFeed::new("tools", false).publish("A", "1.0.0", None, &[]),
		MemoryFeed::new("nuget", true).publish("A", "2.0.0", None, &[]),
	]);
	let found = set.find("A", &PackageVersion::parse("2.0.0").unwrap()).await.unwrap().unwrap();
	assert_eq!(found.name(), "nuget");
	assert!(set.find("A", &PackageVersion::parse("3.0.0").unwrap()).await.is_err());

	let healthy = feeds(vec![MemoryFeed::new("nuget", true)]);
	assert!(healthy.find("A", &PackageVersion::parse("3.0.0").unwrap()).await.unwrap().is_none());
}

#[test]
fn dependency_sets_ignore_reference_order() {
	let a = DependencySet::new([reference("B", "1.0"), reference("a", "[2.0]")], net8());
	let b = DependencySet::new([reference("a", "[2.0]"), reference("B", "1.0"), reference("B", "1.0")], net8());
	assert_eq!(a, b);
	assert_eq!(a.references().len(), 2);
	assert_ne!(a, DependencySet::new([reference("a", "[2.0]")], net8()));
}

#[test]
fn dependency_sets_ignore_id_casing() {
	let upper = DependencySet::new([reference("Newtonsoft.Json", "13.0.1")], net8());
	let lower = DependencySet::new([reference("newtonsoft.json", "13.0.1")], net8());
	assert_eq!(upper, lower);

	let mut seen = HashSet::new();
	seen.insert(upper);
	assert!(!seen.insert(lower));
	assert_ne!(
		DependencySet::new([reference("Newtonsoft.Json", "13.0.1")], net8()),
		DependencySet::new([reference("Newtonsoft.Json", "13.0.3")], net8())
	);
}

#[test]
fn selects_nearest_dependency_group() {
	let groups = vec![
		DependencyGroup {
			target_framework: Some(".NETStandard2.0".into()),
			dependencies: vec![reference("Standard", "1.0")],
		},
		DependencyGroup {
			target_framework: Some("net6.0".into()),
			dependencies: vec![reference("Net", "1.0")],
		},
		DependencyGroup {
			target_framework: Some("uap10.0".into()),
			dependencies: vec![],
		},
	];
	let chosen = DependencyGroup::select(&groups, &net8()).unwrap();
	assert_eq!(chosen.dependencies, vec![reference("Net", "1.0")]);
}

#[tokio::test]
async fn closure_picks_lowest_versions_satisfying_every_range() {
	let set = feeds(vec![
		MemoryFeed::new("nuget", true)
			.publish("App", "1.0.0", Some("net6.0"), &[("Lib", "[1.2.0, )"), ("Util", "1.0.0")])
			.publish("Lib", "1.0.0", None, &[])
			.publish("Lib", "1.2.0", None, &[("Util", "[1.5.0, 2.0.0)")])
			.publish("Lib", "1.3.0", None, &[])
			.publish("Util", "1.0.0", None, &[])
			.publish("Util", "1.5.0", None, &[])
			.publish("Util", "1.6.0-preview", None, &[])
			.publish("Util", "2.0.0", None, &[]),
	]);
	let result = resolve_closure(&set, &[reference("App", "1.0.0")], &net8()).await;

	let chosen: Vec<String> = result.packages.iter().map(|p| p.identity.to_string()).collect();
	assert_eq!(chosen, vec!["App@1.0.0", "Lib@1.2.0", "Util@1.5.0"]);
	assert!(result.errors.is_empty());
}

#[tokio::test]
async fn closure_isolates_failing_dependencies() {
	let set = feeds(vec![
		MemoryFeed::new("nuget", true)
			.publish("App", "1.0.0", None, &[("Missing", "1.0"), ("Good", "1.0"), ("Broken", "1.0")])
			.publish("Good", "1.0.0", None, &[])
			.publish("Broken", "1.0.0", None, &[])
			.break_metadata("Broken"),
	]);
	let result = resolve_closure(&set, &[reference("App", "1.0")], &net8()).await;

	let chosen: Vec<String> = result.packages.iter().map(|p| p.identity.to_string()).collect();
	assert_eq!(chosen, vec!["App@1.0.0", "Good@1.0.0"]);
	assert_eq!(result.errors.keys().collect::<Vec<_>>(), vec!["broken", "missing"]);
}

#[tokio::test]
async fn closure_reports_unsatisfiable_ranges() {
	let set = feeds(vec![
		MemoryFeed::new("nuget", true)
			.publish("A", "1.0.0", None, &[("C", "[1.0.0]")])
			.publish("B", "1.0.0", None, &[("C", "[2.0.0]")])
			.publish("C", "1.0.0", None, &[])
			.publish("C", "2.0.0", None, &[]),
	]);
	let result = resolve_closure(&set, &[reference("A", "1.0"), reference("B", "1.0")], &net8()).await;

	assert_eq!(
		result.errors.get("c"),
		Some(&Error::NotFound("no version of C satisfies [1.0.0] and [2.0.0]".into()))
	);
	assert_eq!(result.packages.len(), 2);
}

/// Canned HTTP responses keyed by URL.
struct Canned(HashMap<&'static str, &'static str>);

#[async_trait]
impl HttpClient for Canned {
	async fn get(&self, url: &Url) -> Result<Bytes> {
		self.0
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

fn v3_feed() -> V3FeedClient {
	let http = Canned(HashMap::from([
		(
			"https://feed.example/v3/index.json",
			r#"{"version":"3.0.0","resources":[
				{"@id":"https://feed.example/flat","@type":"PackageBaseAddress/3.0.0"},
				{"@id":"https://feed.example/reg/","@type":"RegistrationsBaseUrl/3.6.0"}]}"#,
		),
		("https://feed.example/flat/some.package/index.json", r#"{"versions":["1.0.0","2.0.0-beta.1","not a version"]}"#),
		(
			"https://feed.example/reg/some.package/1.0.0.json",
			r#"{"catalogEntry":"https://feed.example/catalog/some.package.1.0.0.json"}"#,
		),
		(
			"https://feed.example/catalog/some.package.1.0.0.json",
			r#"{"dependencyGroups":[
				{"targetFramework":".NETStandard2.0","dependencies":[{"id":"Dep","range":"[1.0.0, )"}]},
				{"dependencies":[{"id":"Any"}]}]}"#,
		),
	]));
	V3FeedClient::new(Arc::new(http), "example", Url::parse("https://feed.example/v3/index.json").unwrap(), false)
}

#[tokio::test]
async fn v3_client_lists_versions_and_builds_urls() {
	let feed = v3_feed();
	let versions: Vec<String> = feed.list_versions("Some.Package").await.unwrap().iter().map(ToString::to_string).collect();
	assert_eq!(versions, vec!["1.0.0", "2.0.0-beta.1"]);
	assert!(feed.list_versions("unknown").await.unwrap().is_empty());

	let url = feed.download_url("Some.Package", &PackageVersion::parse("2.0.0-Beta.1").unwrap()).await.unwrap();
	assert_eq!(url.as_str(), "https://feed.example/flat/some.package/2.0.0-beta.1/some.package.2.0.0-beta.1.nupkg");
}

#[tokio::test]
async fn v3_client_follows_catalog_entries_for_dependencies() {
	let feed = v3_feed();
	let groups = feed
		.dependency_groups("Some.Package", &PackageVersion::parse("1.0.0").unwrap())
		.await
		.unwrap();
	assert_eq!(
		groups,
		vec![
			DependencyGroup {
				target_framework: Some(".NETStandard2.0".into()),
				dependencies: vec![reference("Dep", "[1.0.0, )")],
			},
			DependencyGroup {
				target_framework: None,
				dependencies: vec![PackageReference::new("Any", VersionRange::any())],
			},
		]
	);
}
