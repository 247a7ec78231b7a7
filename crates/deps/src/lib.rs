//! Compiler dependency resolution and package fetch caching.
//!
//! This crate turns a free-text compiler version request into loadable binaries:
//!
//! - [`specifier`] parses user input into prioritized [`VersionSpecifier`] candidates.
//! - [`resolve`] runs the resolver strategies (built-in, package feed, CI artifacts)
//!   and aggregates their failures.
//! - [`cache::PackageCache`] interns [`ResolvedPackage`] values by identity and memoizes
//!   filtered binary sets per `(identity, filter)` with singleflight downloads.
//! - [`archive`] indexes zip central directories over full or ranged byte sources,
//!   and exposes dedup artifact manifests behind the same entry listing.
//!
//! Network access goes through the [`http::HttpClient`] trait; the feed and build-server
//! wire protocols sit behind [`feed::FeedClient`] and [`build_server::BuildServer`].

pub mod archive;
pub mod binary;
pub mod build_server;
pub mod cache;
pub mod compiler;
pub mod feed;
pub mod filter;
pub mod framework;
pub mod http;
pub mod package;
pub mod resolve;
pub mod specifier;
pub mod version;

pub use binary::{BinaryFormat, LoadedBinary};
pub use cache::PackageCache;
pub use compiler::{BuildConfiguration, CompilerInfo, CompilerKind};
pub use filter::DllFilter;
pub use framework::TargetFramework;
pub use package::{CommitLink, PackageIdentity, PackageInfo, ResolvedPackage};
pub use resolve::{CompilerResolver, Resolution, ResolutionFailure, ResolveError, resolve_first};
pub use specifier::VersionSpecifier;
pub use version::{PackageVersion, VersionRange};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while locating, downloading or decoding packages.
///
/// Errors are cloneable so a single in-flight download can publish its failure
/// to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The transport failed before a response arrived.
	#[error("request to {url} failed: {message}")]
	Http { url: String, message: String },
	/// The server answered with a non-success status.
	#[error("request to {url} returned status {status}")]
	Status { url: String, status: u16 },
	/// A response body could not be decoded.
	#[error("invalid response from {url}: {message}")]
	Json { url: String, message: String },
	/// The archive structure is malformed or uses an unsupported feature.
	#[error("invalid archive: {0}")]
	Archive(String),
	/// A version or version range failed to parse.
	#[error("invalid version '{0}'")]
	Version(String),
	/// A package does not contain what its manifest or layout promises.
	#[error("{0}")]
	InvalidOperation(String),
	/// The requested package, build or artifact does not exist.
	#[error("{0}")]
	NotFound(String),
	/// The in-flight computation was abandoned before it produced a value.
	#[error("{0}")]
	Aborted(String),
	/// Local input/output failure.
	#[error("io error: {0}")]
	Io(String),
}

impl From<std::io::Error> for Error {
	fn from(error: std::io::Error) -> Self {
		Self::Io(error.to_string())
	}
}

impl Error {
	/// Returns true for a 404 response.
	pub fn is_not_found_status(&self) -> bool {
		matches!(self, Self::Status { status: 404, .. })
	}
}
