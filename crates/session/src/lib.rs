//! Swappable compiler sessions.
//!
//! A [`Session`] wires the pieces together from a [`KilnConfig`]:
//!
//! - [`CompilerDependencyProvider`] turns version requests into registry
//!   entries (`use_version`, `use_packages`) and reports what is loaded.
//! - [`CompilerFacade`] compiles inside an isolated context rebuilt whenever
//!   the registry generation moves.
//! - [`CompatibilityPolicy`] keeps the host's compiler when a requested
//!   version is older than the supported minimum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_deps::build_server::{AzureDevOpsClient, BuildServer};
use kiln_deps::feed::{FeedClient, FeedSet, PackageReference, V3FeedClient};
use kiln_deps::http::{CorsProxyDecorator, DecoratedClient, HttpClient, ReqwestClient};
use kiln_deps::resolve::{BuiltInResolver, CiResolver, FeedResolver};
use kiln_deps::{BuildConfiguration, CompilerKind, CompilerResolver, PackageCache, TargetFramework};
use kiln_loader::{
	CompilationInput, DependencyRegistry, EntryPointFactory, EntryPointTable, HostModules, InMemoryMaterializer, IsolatedLoader,
	LoadContext, ModuleMaterializer, ModuleProbe, NativeLibraryMaterializer, NoHostModules,
};
use tracing::{info, warn};
use url::Url;

mod compat;
mod config;
mod facade;
mod logging;
mod provider;

pub use compat::CompatibilityPolicy;
pub use config::{
	BuildServerConfig, CONFIG_ENV, CompatConfig, ConfigError, FeedConfig, HttpConfig, KilnConfig, LoaderConfig, MaterializerKind,
	default_path,
};
pub use facade::{CompileFailure, CompileOutcome, CompiledReport, CompilerFacade};
pub use logging::{LOG_DIR_ENV, LOG_ENV, init_tracing};
pub use provider::{CompilerDependencyProvider, LoadedInfo, PackageFeeds, PackageSetReport, PackageSummary, ProviderError};

/// Modules the built-in entry points resolve.
const CSHARP_MODULES: [&str; 2] = ["Microsoft.CodeAnalysis", "Microsoft.CodeAnalysis.CSharp"];
const RAZOR_MODULES: [&str; 1] = ["Microsoft.CodeAnalysis.Razor.Compiler"];

/// A configured provider and facade sharing one registry and cache.
pub struct Session {
	config: KilnConfig,
	provider: CompilerDependencyProvider,
	facade: CompilerFacade,
}

impl Session {
	pub fn builder(config: KilnConfig) -> SessionBuilder {
		SessionBuilder::new(config)
	}

	/// Builds a session with network clients and defaults from `config`.
	pub fn from_config(config: KilnConfig) -> Result<Self, ConfigError> {
		SessionBuilder::new(config).build()
	}

	pub fn config(&self) -> &KilnConfig {
		&self.config
	}

	pub fn provider(&self) -> &CompilerDependencyProvider {
		&self.provider
	}

	pub fn registry(&self) -> &Arc<DependencyRegistry> {
		self.provider.registry()
	}

	/// See [`CompilerDependencyProvider::use_version`].
	pub async fn use_version(
		&self,
		kind: CompilerKind,
		version: Option<&str>,
		configuration: BuildConfiguration,
	) -> Result<bool, ProviderError> {
		self.provider.use_version(kind, version, configuration).await
	}

	pub async fn get_loaded_info(&self, kind: CompilerKind) -> Option<LoadedInfo> {
		self.provider.get_loaded_info(kind).await
	}

	/// See [`CompilerDependencyProvider::use_packages`].
	pub async fn use_packages(
		&self,
		references: Vec<PackageReference>,
		target_framework: TargetFramework,
	) -> Result<PackageSetReport, ProviderError> {
		self.provider.use_packages(references, target_framework).await
	}

	pub async fn compile(&self, input: CompilationInput) -> CompileOutcome {
		self.facade.compile(input).await
	}

	/// The installed load context, if a compile has built one.
	pub fn current_context(&self) -> Option<Arc<LoadContext>> {
		self.facade.loader().current()
	}
}

/// Builds a [`Session`], letting hosts and tests replace any collaborator.
pub struct SessionBuilder {
	config: KilnConfig,
	http: Option<Arc<dyn HttpClient>>,
	feeds: Option<Vec<Arc<dyn FeedClient>>>,
	build_server: Option<Arc<dyn BuildServer>>,
	host: Option<Arc<dyn HostModules>>,
	materializer: Option<Arc<dyn ModuleMaterializer>>,
	entry_points: EntryPointTable,
}

impl SessionBuilder {
	pub fn new(config: KilnConfig) -> Self {
		let mut entry_points = EntryPointTable::new();
		entry_points
			.register("csharp", Arc::new(ModuleProbe::new(CSHARP_MODULES)))
			.register("razor", Arc::new(ModuleProbe::new(RAZOR_MODULES)));
		Self {
			config,
			http: None,
			feeds: None,
			build_server: None,
			host: None,
			materializer: None,
			entry_points,
		}
	}

	/// Transport for every request. The configured CORS proxy still applies.
	pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
		self.http = Some(http);
		self
	}

	/// Replaces the configured `[[feeds]]`.
	pub fn feeds(mut self, feeds: Vec<Arc<dyn FeedClient>>) -> Self {
		self.feeds = Some(feeds);
		self
	}

	pub fn build_server(mut self, server: Arc<dyn BuildServer>) -> Self {
		self.build_server = Some(server);
		self
	}

	/// Modules the host process already provides.
	pub fn host(mut self, host: Arc<dyn HostModules>) -> Self {
		self.host = Some(host);
		self
	}

	pub fn materializer(mut self, materializer: Arc<dyn ModuleMaterializer>) -> Self {
		self.materializer = Some(materializer);
		self
	}

	pub fn entry_point(mut self, name: impl Into<String>, factory: Arc<dyn EntryPointFactory>) -> Self {
		self.entry_points.register(name, factory);
		self
	}

	pub fn build(self) -> Result<Session, ConfigError> {
		let config = self.config;

		let transport: Arc<dyn HttpClient> = match self.http {
			Some(http) => http,
			None => Arc::new(ReqwestClient::new(
				config.http.user_agent.clone(),
				Duration::from_secs(config.http.timeout_secs),
			)?),
		};
		let http: Arc<dyn HttpClient> = match &config.http.cors_proxy {
			Some(proxy) => {
				let proxy = parse_url("http.cors_proxy", proxy)?;
				Arc::new(DecoratedClient::new(transport).with(Arc::new(CorsProxyDecorator::new(proxy))))
			}
			None => transport,
		};
		let range_hosts: Arc<[String]> = Arc::from(config.http.range_hosts.clone());

		let feeds: Vec<Arc<dyn FeedClient>> = match self.feeds {
			Some(feeds) => feeds,
			None => config
				.feeds
				.iter()
				.map(|feed| {
					let index = parse_url(&format!("feeds.{}.url", feed.name), &feed.url)?;
					Ok(Arc::new(V3FeedClient::new(Arc::clone(&http), feed.name.clone(), index, feed.primary)) as Arc<dyn FeedClient>)
				})
				.collect::<Result<_, ConfigError>>()?,
		};
		let feeds = FeedSet::new(feeds);

		let build_server: Arc<dyn BuildServer> = match self.build_server {
			Some(server) => server,
			None => Arc::new(AzureDevOpsClient::new(
				Arc::clone(&http),
				parse_url("build_server.base_url", &config.build_server.base_url)?,
				config.build_server.project.clone(),
				parse_url("build_server.blob_store", &config.build_server.blob_store)?,
			)),
		};

		let cache = Arc::new(PackageCache::new());
		let builtin: HashMap<CompilerKind, _> = config.builtin.clone().into_iter().collect();
		let resolvers: Vec<Arc<dyn CompilerResolver>> = vec![
			Arc::new(BuiltInResolver::new(&builtin)),
			Arc::new(FeedResolver::new(
				Arc::clone(&cache),
				feeds.clone(),
				Arc::clone(&http),
				Arc::clone(&range_hosts),
			)),
			Arc::new(CiResolver::new(
				Arc::clone(&cache),
				build_server,
				Arc::clone(&http),
				Arc::clone(&range_hosts),
			)),
		];

		let compat = CompatibilityPolicy::from_config(&config.compat)?;
		let registry = Arc::new(DependencyRegistry::new());
		let provider = CompilerDependencyProvider::new(
			resolvers,
			cache,
			Arc::clone(&registry),
			PackageFeeds {
				feeds,
				http,
				range_hosts,
			},
			compat,
		);

		let materializer: Arc<dyn ModuleMaterializer> = match (self.materializer, config.loader.materializer) {
			(Some(materializer), _) => materializer,
			(None, MaterializerKind::InMemory) => Arc::new(InMemoryMaterializer),
			(None, MaterializerKind::NativeLibrary) => Arc::new(NativeLibraryMaterializer::new(config.loader.native_temp_prefix.clone())),
		};
		let host: Arc<dyn HostModules> = match self.host {
			Some(host) => host,
			None => Arc::new(NoHostModules),
		};
		let loader = IsolatedLoader::new(registry, materializer, host, config.loader.companions.clone());

		if self.entry_points.get(&config.loader.entry_point).is_err() {
			warn!(
				entry_point = %config.loader.entry_point,
				known = ?self.entry_points.names().collect::<Vec<_>>(),
				"Configured entry point is not registered; compiles will fail"
			);
		}
		let facade = CompilerFacade::new(loader, self.entry_points, config.loader.entry_point.clone());

		info!(
			feeds = config.feeds.len(),
			entry_point = %config.loader.entry_point,
			materializer = ?config.loader.materializer,
			"Session ready"
		);
		Ok(Session { config, provider, facade })
	}
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
	Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
		field: field.to_string(),
		value: value.to_string(),
	})
}
