//! Compiler version resolution.
//!
//! Each [`CompilerResolver`] claims some [`VersionSpecifier`] shapes and turns
//! them into a [`ResolvedPackage`]. [`resolve_first`] walks the parsed
//! candidates in priority order and, for each, the resolvers in registration
//! order; the first success wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::compiler::{BuildConfiguration, CompilerInfo};
use crate::package::ResolvedPackage;
use crate::specifier::VersionSpecifier;

mod builtin;
mod ci;
mod feed;

pub use builtin::{BuiltInResolver, BuiltinCompiler};
pub use ci::CiResolver;
pub use feed::{FeedPackageSource, FeedResolver};

/// A strategy that turns a version specifier into a package.
#[async_trait]
pub trait CompilerResolver: Send + Sync {
	/// Short name used to tag errors.
	fn name(&self) -> &'static str;

	/// Returns `Ok(None)` when this resolver does not handle `specifier`.
	async fn resolve(
		&self,
		compiler: &'static CompilerInfo,
		specifier: &VersionSpecifier,
		configuration: BuildConfiguration,
	) -> crate::Result<Option<Arc<ResolvedPackage>>>;
}

/// A resolver's failure on one candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{resolver}: {specifier}: {source}")]
pub struct ResolveError {
	pub resolver: &'static str,
	pub specifier: VersionSpecifier,
	#[source]
	pub source: crate::Error,
}

/// Why a version request produced no package.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionFailure {
	/// No resolver claimed any interpretation of the input.
	#[error("could not parse version '{input}'")]
	Unrecognized { input: String },
	/// Resolvers claimed the input but every attempt failed.
	#[error("could not resolve version '{input}': {}", join(.errors))]
	Failed { input: String, errors: Vec<ResolveError> },
}

fn join(errors: &[ResolveError]) -> String {
	errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
	pub package: Arc<ResolvedPackage>,
	/// The interpretation of the input that succeeded.
	pub specifier: VersionSpecifier,
}

/// Resolves `input` with the first resolver that succeeds.
pub async fn resolve_first(
	resolvers: &[Arc<dyn CompilerResolver>],
	compiler: &'static CompilerInfo,
	input: Option<&str>,
	configuration: BuildConfiguration,
) -> Result<Resolution, ResolutionFailure> {
	let display = input.unwrap_or_default().trim().to_string();
	let mut errors = Vec::new();
	let mut claimed = false;

	for specifier in VersionSpecifier::parse(input) {
		for resolver in resolvers {
			match resolver.resolve(compiler, &specifier, configuration).await {
				Ok(Some(package)) => {
					info!(
						compiler = %compiler.kind,
						resolver = resolver.name(),
						specifier = %specifier,
						package = %package.identity(),
						"Resolved compiler version"
					);
					return Ok(Resolution { package, specifier });
				}
				Ok(None) => {}
				Err(source) => {
					claimed = true;
					debug!(resolver = resolver.name(), specifier = %specifier, error = %source, "Resolver failed");
					errors.push(ResolveError {
						resolver: resolver.name(),
						specifier: specifier.clone(),
						source,
					});
				}
			}
		}
	}

	if claimed {
		Err(ResolutionFailure::Failed { input: display, errors })
	} else {
		Err(ResolutionFailure::Unrecognized { input: display })
	}
}

impl fmt::Display for Resolution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.package.identity(), self.specifier)
	}
}
