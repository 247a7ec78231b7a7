//! Isolated, generation-tracked loading of swappable compiler binaries.
//!
//! - [`DependencyRegistry`] maps [`DependencyKey`]s to async binary suppliers
//!   and bumps a generation counter on every membership change.
//! - [`LoadContext`] is one isolated module arena built from a registry
//!   snapshot; it resolves names lazily and records its last load failure.
//! - [`IsolatedLoader`] keeps the current context, rebuilding it when the
//!   registry generation moves or the context is poisoned.
//! - [`ModuleMaterializer`] turns binaries into loaded modules, either kept in
//!   memory or opened as native shared libraries.
//! - [`EntryPointTable`] maps configured names to compiler entry points.

mod context;
mod entry;
mod loader;
mod materializer;
mod registry;

pub use context::{HostModules, LoadContext, LoadFailure, Module, ModuleImage, ModuleOrigin, NoHostModules, StaticHostModules};
pub use entry::{
	CompilationInput, CompiledOutput, CompilerEntryPoint, EntryPointFactory, EntryPointTable, ModuleProbe, ModuleSummary,
	SourceFile,
};
pub use loader::IsolatedLoader;
pub use materializer::{InMemoryMaterializer, MaterializeScope, ModuleMaterializer, NativeLibraryMaterializer};
pub use registry::{BinarySupplier, DependencyKey, DependencyRegistry, FixedBinaries, PackageBinaries};

/// A convenient type alias for `Result` with `E` = [`LoadError`].
pub type Result<T, E = LoadError> = std::result::Result<T, E>;

/// Errors raised while building or using isolated contexts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
	/// A registered supplier could not produce its binaries.
	#[error("failed to fetch dependencies: {0}")]
	Fetch(#[from] kiln_deps::Error),
	/// A binary could not be materialized into a module.
	#[error("failed to load '{name}': {message}")]
	Module { name: String, message: String },
	/// A required module is neither in the context nor on the host.
	#[error("module '{0}' is not available")]
	Missing(String),
	/// The registry moved past the generation a caller expected.
	#[error("registry is at generation {actual}, expected {expected}")]
	StaleGeneration { expected: u64, actual: u64 },
	/// No entry point is registered under the configured name.
	#[error("unknown entry point '{0}'")]
	UnknownEntryPoint(String),
	/// The compiler ran and failed.
	#[error("{0}")]
	Compiler(String),
	/// Local input/output failure while materializing modules.
	#[error("io error: {0}")]
	Io(String),
}

impl From<std::io::Error> for LoadError {
	fn from(error: std::io::Error) -> Self {
		Self::Io(error.to_string())
	}
}
