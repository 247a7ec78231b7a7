//! `kiln.toml` configuration.
//!
//! ```toml
//! [[feeds]]
//! name = "nuget"
//! url = "https://api.nuget.org/v3/index.json"
//! primary = true
//!
//! [http]
//! cors_proxy = "https://proxy.example/?"
//! range_hosts = ["api.nuget.org"]
//!
//! [builtin.roslyn]
//! version = "4.12.0"
//! commit = "0123456789abcdef"
//!
//! [compat.minimum]
//! roslyn = "4.0.0"
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use kiln_deps::CompilerKind;
use kiln_deps::build_server::AzureDevOpsClient;
use kiln_deps::resolve::BuiltinCompiler;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

const CONFIG_FILE: &str = "kiln.toml";

/// Errors raised while loading configuration or wiring a session from it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {}: {error}", path.display())]
	Io { path: PathBuf, error: std::io::Error },
	#[error("invalid configuration{}: {message}", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
	Parse { path: Option<PathBuf>, message: String },
	#[error("invalid url for {field}: '{value}'")]
	InvalidUrl { field: String, value: String },
	#[error("invalid minimum version for {kind}: '{value}'")]
	InvalidVersion { kind: CompilerKind, value: String },
	#[error("failed to create http client: {0}")]
	Http(#[from] kiln_deps::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
	/// Package feeds in priority order.
	pub feeds: Vec<FeedConfig>,
	pub build_server: BuildServerConfig,
	pub http: HttpConfig,
	pub loader: LoaderConfig,
	/// What the host ships per compiler.
	pub builtin: BTreeMap<CompilerKind, BuiltinCompiler>,
	pub compat: CompatConfig,
}

impl Default for KilnConfig {
	fn default() -> Self {
		Self {
			feeds: vec![
				FeedConfig {
					name: "dotnet-tools".into(),
					url: "https://pkgs.dev.azure.com/dnceng/public/_packaging/dotnet-tools/nuget/v3/index.json".into(),
					primary: false,
				},
				FeedConfig {
					name: "nuget".into(),
					url: "https://api.nuget.org/v3/index.json".into(),
					primary: true,
				},
			],
			build_server: BuildServerConfig::default(),
			http: HttpConfig::default(),
			loader: LoaderConfig::default(),
			builtin: BTreeMap::new(),
			compat: CompatConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
	pub name: String,
	/// Service index url.
	pub url: String,
	#[serde(default)]
	pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildServerConfig {
	pub base_url: String,
	pub project: String,
	pub blob_store: String,
}

impl Default for BuildServerConfig {
	fn default() -> Self {
		Self {
			base_url: "https://dev.azure.com/dnceng-public/".into(),
			project: "public".into(),
			blob_store: AzureDevOpsClient::DEFAULT_BLOB_STORE.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
	/// Prefix prepended to package download urls.
	pub cors_proxy: Option<String>,
	/// Hosts known to honor range requests.
	pub range_hosts: Vec<String>,
	pub user_agent: String,
	pub timeout_secs: u64,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			cors_proxy: None,
			range_hosts: vec!["api.nuget.org".into()],
			user_agent: concat!("kiln/", env!("CARGO_PKG_VERSION")).into(),
			timeout_secs: 60,
		}
	}
}

/// How binaries become modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaterializerKind {
	#[default]
	InMemory,
	NativeLibrary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
	/// Binaries resolved eagerly in every isolated context.
	pub companions: Vec<String>,
	/// Entry point the facade compiles with.
	pub entry_point: String,
	pub materializer: MaterializerKind,
	/// Prefix of per-context directories for native libraries.
	pub native_temp_prefix: String,
}

impl Default for LoaderConfig {
	fn default() -> Self {
		Self {
			companions: [
				"Microsoft.CodeAnalysis.Workspaces",
				"Microsoft.CodeAnalysis.CSharp.Workspaces",
				"Microsoft.CodeAnalysis.Features",
				"Microsoft.CodeAnalysis.CSharp.Features",
				"Microsoft.CodeAnalysis.CodeStyle",
			]
			.map(String::from)
			.to_vec(),
			entry_point: "csharp".into(),
			materializer: MaterializerKind::InMemory,
			native_temp_prefix: "kiln-".into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompatConfig {
	/// Oldest version each compiler may be swapped to.
	pub minimum: BTreeMap<CompilerKind, String>,
}

impl Default for CompatConfig {
	fn default() -> Self {
		Self {
			minimum: BTreeMap::from([(CompilerKind::Roslyn, "4.0.0".to_string())]),
		}
	}
}

impl KilnConfig {
	pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
		toml::from_str(text).map_err(|error| ConfigError::Parse {
			path: None,
			message: error.to_string(),
		})
	}

	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		let config = toml::from_str(&text).map_err(|error| ConfigError::Parse {
			path: Some(path.to_path_buf()),
			message: error.to_string(),
		})?;
		debug!(path = %path.display(), "Loaded configuration");
		Ok(config)
	}

	/// Loads `explicit`, else `$KILN_CONFIG`, else the user config file if it
	/// exists, else defaults.
	pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
		discover_with(explicit, std::env::var_os(CONFIG_ENV), default_path())
	}
}

/// `<config dir>/kiln/kiln.toml`.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("kiln").join(CONFIG_FILE))
}

fn discover_with(explicit: Option<&Path>, env: Option<OsString>, fallback: Option<PathBuf>) -> Result<KilnConfig, ConfigError> {
	if let Some(path) = explicit {
		return KilnConfig::load(path);
	}
	if let Some(path) = env.filter(|value| !value.is_empty()) {
		return KilnConfig::load(Path::new(&path));
	}
	match fallback {
		Some(path) if path.is_file() => KilnConfig::load(&path),
		_ => Ok(KilnConfig::default()),
	}
}
