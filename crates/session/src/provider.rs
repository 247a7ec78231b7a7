//! Compiler version switching and package-set registration.
//!
//! Every change follows the same discipline: read the registry generation,
//! resolve and prefetch without holding any lock, then commit with
//! [`DependencyRegistry::try_set`] against the generation read up front. A
//! commit that lost the race is dropped; whatever it downloaded stays in the
//! [`PackageCache`].
//!
//! Switches of one compiler are also numbered as they arrive, so a slow
//! request never records over a newer one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use kiln_deps::feed::{DependencySet, FeedSet, PackageReference, resolve_closure};
use kiln_deps::http::HttpClient;
use kiln_deps::resolve::FeedPackageSource;
use kiln_deps::{
	BuildConfiguration, CompilerInfo, CompilerKind, CompilerResolver, DllFilter, PackageCache, PackageIdentity, PackageInfo,
	ResolutionFailure, ResolvedPackage, TargetFramework, VersionSpecifier, resolve_first,
};
use kiln_loader::{BinarySupplier, DependencyKey, DependencyRegistry, LoadError, PackageBinaries};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::compat::CompatibilityPolicy;

/// Errors raised by [`CompilerDependencyProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
	#[error(transparent)]
	Resolution(#[from] ResolutionFailure),
	#[error("failed to fetch {package}: {source}")]
	Fetch {
		package: String,
		#[source]
		source: kiln_deps::Error,
	},
	/// Another change committed while this one was in flight.
	#[error("superseded by a newer dependency change (generation {expected} moved to {actual})")]
	Superseded { expected: u64, actual: u64 },
	/// A newer switch of the same compiler was requested while this one was
	/// in flight.
	#[error("a newer {kind} switch was requested")]
	Overtaken { kind: CompilerKind },
	#[error(transparent)]
	Registry(LoadError),
}

impl ProviderError {
	fn fetch(package: &PackageIdentity, source: kiln_deps::Error) -> Self {
		Self::Fetch {
			package: package.to_string(),
			source,
		}
	}
}

impl From<LoadError> for ProviderError {
	fn from(error: LoadError) -> Self {
		match error {
			LoadError::StaleGeneration { expected, actual } => Self::Superseded { expected, actual },
			other => Self::Registry(other),
		}
	}
}

/// What is in effect for one compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedInfo {
	pub kind: CompilerKind,
	/// The interpretation of the request that resolved.
	pub specifier: VersionSpecifier,
	pub identity: PackageIdentity,
	pub info: PackageInfo,
	pub configuration: BuildConfiguration,
	/// True when the host's own binaries are in use.
	pub builtin: bool,
	/// True when the requested package was older than the supported minimum
	/// and the host's binaries were kept instead.
	pub fell_back_to_builtin: bool,
}

impl LoadedInfo {
	fn same_binaries(&self, other: &LoadedInfo) -> bool {
		self.identity == other.identity
			&& self.builtin == other.builtin
			&& self.fell_back_to_builtin == other.fell_back_to_builtin
			&& self.configuration == other.configuration
	}
}

#[derive(Debug, Clone)]
enum LoadState {
	Loaded(LoadedInfo),
	Failed,
}

/// Per-compiler switch bookkeeping. Only the newest request may record.
#[derive(Debug, Default)]
struct Switches {
	requests: HashMap<CompilerKind, u64>,
	loaded: HashMap<CompilerKind, LoadState>,
}

impl Switches {
	fn begin(&mut self, kind: CompilerKind) -> u64 {
		let latest = self.requests.entry(kind).or_default();
		*latest += 1;
		*latest
	}

	fn is_latest(&self, kind: CompilerKind, request: u64) -> bool {
		self.requests.get(&kind) == Some(&request)
	}
}

/// One package registered by [`CompilerDependencyProvider::use_packages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
	pub identity: PackageIdentity,
	/// Name of the feed that served it.
	pub feed: String,
	/// Number of binaries selected for the target framework.
	pub binaries: usize,
}

/// Outcome of [`CompilerDependencyProvider::use_packages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSetReport {
	pub packages: Vec<PackageSummary>,
	/// Failures keyed by lowercase package id. Other packages still register.
	pub errors: BTreeMap<String, kiln_deps::Error>,
	/// Registry generation after the commit.
	pub generation: u64,
}

/// Where `use_packages` looks packages up.
#[derive(Clone)]
pub struct PackageFeeds {
	pub feeds: FeedSet,
	pub http: Arc<dyn HttpClient>,
	pub range_hosts: Arc<[String]>,
}

/// Resolves compiler versions and package sets into registry entries.
pub struct CompilerDependencyProvider {
	resolvers: Vec<Arc<dyn CompilerResolver>>,
	cache: Arc<PackageCache>,
	registry: Arc<DependencyRegistry>,
	packages: PackageFeeds,
	compat: CompatibilityPolicy,
	switches: Mutex<Switches>,
	package_key: Mutex<Option<DependencyKey>>,
}

impl CompilerDependencyProvider {
	/// `resolvers` are tried in order for every candidate interpretation.
	pub fn new(
		resolvers: Vec<Arc<dyn CompilerResolver>>,
		cache: Arc<PackageCache>,
		registry: Arc<DependencyRegistry>,
		packages: PackageFeeds,
		compat: CompatibilityPolicy,
	) -> Self {
		Self {
			resolvers,
			cache,
			registry,
			packages,
			compat,
			switches: Mutex::new(Switches::default()),
			package_key: Mutex::new(None),
		}
	}

	pub fn registry(&self) -> &Arc<DependencyRegistry> {
		&self.registry
	}

	pub fn cache(&self) -> &Arc<PackageCache> {
		&self.cache
	}

	/// Switches `kind` to `version` (`None` or `"built-in"` for the host's
	/// binaries). Returns whether the binaries in effect changed.
	///
	/// On failure the registry is left as it was and
	/// [`get_loaded_info`](Self::get_loaded_info) reports `None` until the next
	/// successful switch.
	///
	/// The last request for a compiler wins: a request that finishes after a
	/// newer one for the same `kind` started changes nothing and fails with
	/// [`ProviderError::Overtaken`], or with its own error if it failed.
	pub async fn use_version(
		&self,
		kind: CompilerKind,
		version: Option<&str>,
		configuration: BuildConfiguration,
	) -> Result<bool, ProviderError> {
		let request = self.switches.lock().begin(kind);
		let expected = self.registry.current_generation();

		let prepared = self.prepare(kind.info(), version, configuration).await;

		let mut switches = self.switches.lock();
		let latest = switches.is_latest(kind, request);
		let (loaded, supplier) = match prepared {
			Ok(prepared) => prepared,
			Err(error) => {
				warn!(compiler = %kind, version = version.unwrap_or_default(), error = %error, latest, "Compiler switch failed");
				if latest {
					switches.loaded.insert(kind, LoadState::Failed);
				}
				return Err(error);
			}
		};
		if !latest {
			debug!(compiler = %kind, package = %loaded.identity, "Dropping compiler switch overtaken by a newer request");
			return Err(ProviderError::Overtaken { kind });
		}

		if let Some(LoadState::Loaded(previous)) = switches.loaded.get(&kind)
			&& previous.same_binaries(&loaded)
		{
			debug!(compiler = %kind, package = %loaded.identity, "Compiler already in effect");
			switches.loaded.insert(kind, LoadState::Loaded(loaded));
			return Ok(false);
		}

		let key = DependencyKey::Compiler(kind);
		let committed = match supplier {
			Some(supplier) => self.registry.try_set(key, supplier, expected).map(|_| true),
			None => self.registry.try_remove(&key, expected),
		};
		let changed = match committed {
			Ok(changed) => changed,
			Err(error) => {
				warn!(compiler = %kind, package = %loaded.identity, error = %error, "Dropping superseded compiler switch");
				return Err(error.into());
			}
		};

		info!(
			compiler = %kind,
			package = %loaded.identity,
			version = %loaded.info.version,
			builtin = loaded.builtin,
			fell_back = loaded.fell_back_to_builtin,
			generation = self.registry.current_generation(),
			"Compiler switched"
		);
		switches.loaded.insert(kind, LoadState::Loaded(loaded));
		Ok(changed)
	}

	async fn prepare(
		&self,
		compiler: &'static CompilerInfo,
		version: Option<&str>,
		configuration: BuildConfiguration,
	) -> Result<(LoadedInfo, Option<Arc<dyn BinarySupplier>>), ProviderError> {
		let resolution = resolve_first(&self.resolvers, compiler, version, configuration).await?;
		let package = resolution.package;
		let info = package
			.info()
			.await
			.map_err(|source| ProviderError::fetch(package.identity(), source))?
			.clone();

		let builtin = package.is_builtin();
		let fell_back = !builtin && self.compat.falls_below(compiler.kind, &info);
		if fell_back {
			warn!(
				compiler = %compiler.kind,
				version = %info.version,
				minimum = ?self.compat.minimum(compiler.kind).map(ToString::to_string),
				"Version is below the supported minimum; keeping built-in binaries"
			);
		}

		let supplier = if builtin || fell_back {
			None
		} else {
			Some(self.prefetch(&package, DllFilter::compiler(compiler.package_folder)).await?)
		};

		let loaded = LoadedInfo {
			kind: compiler.kind,
			specifier: resolution.specifier,
			identity: package.identity().clone(),
			info,
			configuration,
			builtin: builtin || fell_back,
			fell_back_to_builtin: fell_back,
		};
		Ok((loaded, supplier))
	}

	async fn prefetch(&self, package: &Arc<ResolvedPackage>, filter: DllFilter) -> Result<Arc<dyn BinarySupplier>, ProviderError> {
		let binaries = self
			.cache
			.get_assemblies(package, &filter)
			.await
			.map_err(|source| ProviderError::fetch(package.identity(), source))?;
		debug!(package = %package.identity(), count = binaries.len(), "Prefetched compiler binaries");
		Ok(Arc::new(PackageBinaries::new(Arc::clone(&self.cache), vec![(Arc::clone(package), filter)])))
	}

	/// What is in effect for `kind`. `None` means the last switch failed.
	///
	/// Before any switch this describes the host's built-in compiler.
	pub async fn get_loaded_info(&self, kind: CompilerKind) -> Option<LoadedInfo> {
		let state = self.switches.lock().loaded.get(&kind).cloned();
		match state {
			Some(LoadState::Loaded(loaded)) => Some(loaded),
			Some(LoadState::Failed) => None,
			None => self.builtin_info(kind).await,
		}
	}

	async fn builtin_info(&self, kind: CompilerKind) -> Option<LoadedInfo> {
		let resolution = resolve_first(&self.resolvers, kind.info(), None, BuildConfiguration::default())
			.await
			.map_err(|error| debug!(compiler = %kind, error = %error, "No built-in compiler description"))
			.ok()?;
		let info = resolution.package.info().await.ok()?.clone();
		Some(LoadedInfo {
			kind,
			specifier: resolution.specifier,
			identity: resolution.package.identity().clone(),
			info,
			configuration: BuildConfiguration::default(),
			builtin: true,
			fell_back_to_builtin: false,
		})
	}

	/// Resolves `references` and their dependencies for `target_framework`
	/// and registers the result, replacing the previous package set.
	///
	/// Packages that fail to resolve or download are reported in
	/// [`PackageSetReport::errors`]; the rest are registered. An empty set
	/// only clears the previous one.
	pub async fn use_packages(
		&self,
		references: Vec<PackageReference>,
		target_framework: TargetFramework,
	) -> Result<PackageSetReport, ProviderError> {
		let expected = self.registry.current_generation();
		let set = DependencySet::new(references, target_framework);

		if set.is_empty() {
			let mut current = self.package_key.lock();
			if let Some(previous) = current.as_ref() {
				self.registry.try_remove(previous, expected)?;
				*current = None;
				info!("Cleared package references");
			}
			return Ok(PackageSetReport {
				generation: self.registry.current_generation(),
				..PackageSetReport::default()
			});
		}

		let closure = resolve_closure(&self.packages.feeds, set.references(), &target_framework).await;
		let mut errors: BTreeMap<String, kiln_deps::Error> = closure.errors;

		let filter = DllFilter::nearest_target(target_framework);
		let fetched = join_all(closure.packages.iter().map(|resolved| {
			let package = self.cache.package(resolved.identity.clone(), || {
				Box::new(FeedPackageSource::new(
					Arc::clone(&resolved.feed),
					Arc::clone(&self.packages.http),
					Arc::clone(&self.packages.range_hosts),
				))
			});
			let filter = &filter;
			async move {
				let result = self.cache.get_assemblies(&package, filter).await;
				(resolved, package, result)
			}
		}))
		.await;

		let mut summaries = Vec::new();
		let mut selections = Vec::new();
		for (resolved, package, result) in fetched {
			match result {
				Ok(binaries) => {
					summaries.push(PackageSummary {
						identity: resolved.identity.clone(),
						feed: resolved.feed.name().to_string(),
						binaries: binaries.len(),
					});
					selections.push((package, filter.clone()));
				}
				Err(error) => {
					warn!(package = %resolved.identity, error = %error, "Package download failed");
					errors.insert(resolved.identity.id().to_ascii_lowercase(), error);
				}
			}
		}

		let key = DependencyKey::Packages(set);
		let supplier: Arc<dyn BinarySupplier> = Arc::new(PackageBinaries::new(Arc::clone(&self.cache), selections));

		let mut current = self.package_key.lock();
		let generation = match self.registry.try_replace(current.as_ref(), key.clone(), supplier, expected) {
			Ok(generation) => generation,
			Err(error) => {
				warn!(error = %error, "Dropping superseded package set");
				return Err(error.into());
			}
		};
		*current = Some(key);

		info!(packages = summaries.len(), failed = errors.len(), generation, "Registered package references");
		Ok(PackageSetReport {
			packages: summaries,
			errors,
			generation,
		})
	}
}
