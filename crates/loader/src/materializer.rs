//! Turning binaries into loaded modules.

use std::path::PathBuf;
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::debug;

use kiln_deps::LoadedBinary;

use crate::context::ModuleImage;
use crate::{LoadError, Result};

/// Creates one materialization scope per load context.
pub trait ModuleMaterializer: Send + Sync {
	fn scope(&self, label: &str) -> Result<Box<dyn MaterializeScope>>;
}

/// Materializes binaries for a single context. Dropping the scope releases
/// everything it produced.
pub trait MaterializeScope: Send + Sync {
	fn materialize(&self, binary: &LoadedBinary) -> Result<ModuleImage>;
}

/// Keeps native bytes in memory for hosts that interpret modules themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryMaterializer;

impl ModuleMaterializer for InMemoryMaterializer {
	fn scope(&self, _label: &str) -> Result<Box<dyn MaterializeScope>> {
		Ok(Box::new(InMemoryMaterializer))
	}
}

impl MaterializeScope for InMemoryMaterializer {
	fn materialize(&self, binary: &LoadedBinary) -> Result<ModuleImage> {
		let bytes = binary.native_bytes().map_err(|error| LoadError::Module {
			name: binary.name().to_string(),
			message: error.to_string(),
		})?;
		Ok(ModuleImage::Bytes(bytes))
	}
}

/// Writes binaries into a per-context temporary directory and opens them as
/// shared libraries.
#[derive(Debug, Clone)]
pub struct NativeLibraryMaterializer {
	prefix: String,
	root: Option<PathBuf>,
}

impl NativeLibraryMaterializer {
	pub fn new(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			root: None,
		}
	}

	/// Creates context directories below `root` instead of the system
	/// temporary directory.
	pub fn in_dir(mut self, root: impl Into<PathBuf>) -> Self {
		self.root = Some(root.into());
		self
	}
}

impl ModuleMaterializer for NativeLibraryMaterializer {
	fn scope(&self, label: &str) -> Result<Box<dyn MaterializeScope>> {
		let mut builder = tempfile::Builder::new();
		let prefix = format!("{}{label}-", self.prefix);
		builder.prefix(&prefix);
		let dir = match &self.root {
			Some(root) => builder.tempdir_in(root)?,
			None => builder.tempdir()?,
		};
		debug!(dir = %dir.path().display(), "Created native module directory");
		Ok(Box::new(NativeScope {
			libraries: Mutex::new(Vec::new()),
			dir,
		}))
	}
}

struct NativeScope {
	// Declared before `dir` so every library closes before its file is deleted.
	libraries: Mutex<Vec<Arc<Library>>>,
	dir: TempDir,
}

impl MaterializeScope for NativeScope {
	fn materialize(&self, binary: &LoadedBinary) -> Result<ModuleImage> {
		let failed = |message: String| LoadError::Module {
			name: binary.name().to_string(),
			message,
		};
		let bytes = binary.native_bytes().map_err(|error| failed(error.to_string()))?;
		let path = self.dir.path().join(library_file_name(binary.name()));
		std::fs::write(&path, &bytes).map_err(|error| failed(format!("cannot write {}: {error}", path.display())))?;

		// SAFETY: library initializers run here; only registered binaries
		// reach this point.
		let library = unsafe { Library::new(&path) }.map_err(|error| failed(error.to_string()))?;
		let library = Arc::new(library);
		self.libraries.lock().push(Arc::clone(&library));
		debug!(module = binary.name(), path = %path.display(), "Opened native module");
		Ok(ModuleImage::Library(library))
	}
}

fn library_file_name(name: &str) -> String {
	format!("{name}{}", std::env::consts::DLL_SUFFIX)
}

#[cfg(test)]
mod tests {
	use kiln_deps::BinaryFormat;

	use super::*;

	#[test]
	fn in_memory_keeps_native_bytes() {
		let binary = LoadedBinary::new("Microsoft.CodeAnalysis", &b"MZ core"[..], BinaryFormat::Native);
		let scope = InMemoryMaterializer.scope("kiln-gen-1").unwrap();
		let ModuleImage::Bytes(bytes) = scope.materialize(&binary).unwrap() else {
			panic!("expected in-memory image");
		};
		assert_eq!(bytes.as_ref(), b"MZ core");
	}

	#[test]
	fn in_memory_reports_conversion_failures() {
		let binary = LoadedBinary::new("Broken", &b"not a module"[..], BinaryFormat::PortableIntermediate);
		let scope = InMemoryMaterializer.scope("kiln-gen-1").unwrap();
		let error = scope.materialize(&binary).unwrap_err();
		assert!(matches!(&error, LoadError::Module { name, .. } if name == "Broken"), "unexpected error: {error}");
	}

	#[test]
	fn native_scope_rejects_non_libraries_and_cleans_up() {
		let root = tempfile::tempdir().unwrap();
		let materializer = NativeLibraryMaterializer::new("kiln-test-").in_dir(root.path());
		let binary = LoadedBinary::new("Microsoft.CodeAnalysis", &b"MZ core"[..], BinaryFormat::Native);

		let scope = materializer.scope("kiln-gen-3").unwrap();
		let entries: Vec<_> = std::fs::read_dir(root.path()).unwrap().flatten().collect();
		assert_eq!(entries.len(), 1);
		assert!(entries[0].file_name().to_string_lossy().starts_with("kiln-test-kiln-gen-3-"));

		let error = scope.materialize(&binary).unwrap_err();
		assert!(matches!(error, LoadError::Module { .. }), "unexpected error: {error}");

		drop(scope);
		assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
	}
}
