use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CompilerResolver;
use crate::Result;
use crate::archive::{EmptyArchive, EntrySource};
use crate::compiler::{BuildConfiguration, CompilerInfo, CompilerKind};
use crate::package::{CommitLink, PackageIdentity, PackageInfo, PackageSource, ResolvedPackage};
use crate::specifier::VersionSpecifier;
use crate::version::PackageVersion;

/// What the host ships for one compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinCompiler {
	pub version: String,
	pub commit: Option<String>,
}

/// Claims [`VersionSpecifier::BuiltIn`]: keep using the host's binaries.
pub struct BuiltInResolver {
	packages: HashMap<CompilerKind, Arc<ResolvedPackage>>,
}

impl BuiltInResolver {
	pub fn new(compilers: &HashMap<CompilerKind, BuiltinCompiler>) -> Self {
		let packages = CompilerKind::ALL
			.into_iter()
			.map(|kind| {
				let info = kind.info();
				let builtin = compilers.get(&kind).cloned().unwrap_or_default();
				let version = PackageVersion::parse(&builtin.version).unwrap_or_else(|_| PackageVersion::new(0, 0, 0));
				let package = ResolvedPackage::new(
					PackageIdentity::new(info.package_id, version),
					Box::new(BuiltinSource::new(info, builtin)),
				);
				(kind, Arc::new(package))
			})
			.collect();
		Self { packages }
	}
}

#[async_trait]
impl CompilerResolver for BuiltInResolver {
	fn name(&self) -> &'static str {
		"built-in"
	}

	async fn resolve(
		&self,
		compiler: &'static CompilerInfo,
		specifier: &VersionSpecifier,
		_configuration: BuildConfiguration,
	) -> Result<Option<Arc<ResolvedPackage>>> {
		if *specifier != VersionSpecifier::BuiltIn {
			return Ok(None);
		}
		Ok(self.packages.get(&compiler.kind).cloned())
	}
}

#[derive(Debug)]
struct BuiltinSource {
	info: PackageInfo,
}

impl BuiltinSource {
	fn new(compiler: &CompilerInfo, builtin: BuiltinCompiler) -> Self {
		let version = if builtin.version.is_empty() { "built-in".to_string() } else { builtin.version };
		let commit = builtin.commit.map(|hash| CommitLink {
			url: compiler.commit_url(&hash),
			hash,
		});
		Self {
			info: PackageInfo {
				version,
				commit,
				from_primary_registry: false,
			},
		}
	}
}

#[async_trait]
impl PackageSource for BuiltinSource {
	async fn info(&self, _identity: &PackageIdentity) -> Result<PackageInfo> {
		Ok(self.info.clone())
	}

	async fn open(&self, _identity: &PackageIdentity) -> Result<Arc<dyn EntrySource>> {
		Ok(Arc::new(EmptyArchive))
	}

	fn provides_assets(&self) -> bool {
		false
	}
}
