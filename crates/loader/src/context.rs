//! Isolated module arenas.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use kiln_deps::LoadedBinary;
use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::materializer::{MaterializeScope, ModuleMaterializer};
use crate::{LoadError, Result};

tokio::task_local! {
	static CURRENT: Arc<LoadContext>;
}

/// Where a resolved module came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
	/// Materialized from the context's own snapshot.
	Isolated { generation: u64 },
	/// Delegated to the host's copy.
	Host,
}

/// Loaded form of a module.
#[derive(Debug, Clone)]
pub enum ModuleImage {
	/// Native bytes held in memory.
	Bytes(Bytes),
	/// An opened shared library.
	Library(Arc<Library>),
	/// Provided by the host process.
	Host,
}

/// A module resolved inside a [`LoadContext`].
#[derive(Debug, Clone)]
pub struct Module {
	pub name: String,
	pub origin: ModuleOrigin,
	pub image: ModuleImage,
}

/// The most recent load failure of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
	pub name: String,
	pub message: String,
}

impl fmt::Display for LoadFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "failed to load '{}': {}", self.name, self.message)
	}
}

impl From<LoadFailure> for LoadError {
	fn from(failure: LoadFailure) -> Self {
		Self::Module {
			name: failure.name,
			message: failure.message,
		}
	}
}

/// The host's own modules, used for names a context does not override.
pub trait HostModules: Send + Sync {
	fn contains(&self, name: &str) -> bool;
}

/// A host that provides nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostModules;

impl HostModules for NoHostModules {
	fn contains(&self, _name: &str) -> bool {
		false
	}
}

/// A host with a fixed set of module names.
#[derive(Debug, Default, Clone)]
pub struct StaticHostModules {
	names: HashSet<String>,
}

impl StaticHostModules {
	pub fn new<I, S>(names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		Self {
			names: names.into_iter().map(|name| name.as_ref().to_ascii_lowercase()).collect(),
		}
	}
}

impl HostModules for StaticHostModules {
	fn contains(&self, name: &str) -> bool {
		self.names.contains(&name.to_ascii_lowercase())
	}
}

/// One generation's isolated modules.
///
/// Names resolve lazily: a snapshot binary is materialized on first request,
/// anything else is delegated to the host. Both outcomes are memoized for the
/// context's lifetime. A failed materialization is recorded in the
/// last-failure slot and poisons the context; callers poll
/// [`last_failure`](Self::last_failure) after every use.
pub struct LoadContext {
	label: String,
	generation: u64,
	isolated: bool,
	binaries: HashMap<String, LoadedBinary>,
	// Declared before `scope` so modules drop before the scope releases them.
	modules: Mutex<HashMap<String, Option<Module>>>,
	last_failure: Mutex<Option<LoadFailure>>,
	host: Arc<dyn HostModules>,
	scope: Option<Box<dyn MaterializeScope>>,
}

impl LoadContext {
	/// Creates an isolated context over `binaries`.
	pub fn isolated(
		generation: u64,
		binaries: Vec<LoadedBinary>,
		materializer: &dyn ModuleMaterializer,
		host: Arc<dyn HostModules>,
	) -> Result<Self> {
		let label = format!("kiln-gen-{generation}");
		let scope = materializer.scope(&label)?;
		let binaries = binaries
			.into_iter()
			.map(|binary| (binary.name().to_ascii_lowercase(), binary))
			.collect();
		Ok(Self {
			label,
			generation,
			isolated: true,
			binaries,
			modules: Mutex::new(HashMap::new()),
			last_failure: Mutex::new(None),
			host,
			scope: Some(scope),
		})
	}

	/// The host's default context: no overrides, everything delegated.
	pub fn host_default(generation: u64, host: Arc<dyn HostModules>) -> Self {
		Self {
			label: "host".to_string(),
			generation,
			isolated: false,
			binaries: HashMap::new(),
			modules: Mutex::new(HashMap::new()),
			last_failure: Mutex::new(None),
			host,
			scope: None,
		}
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn is_isolated(&self) -> bool {
		self.isolated
	}

	/// True when the snapshot overrides `name`.
	pub fn overrides(&self, name: &str) -> bool {
		self.binaries.contains_key(&name.to_ascii_lowercase())
	}

	/// Resolves `name`, or returns `None` and records why in the failure slot
	/// when an override fails to load.
	pub fn resolve(&self, name: &str) -> Option<Module> {
		let key = name.to_ascii_lowercase();
		if let Some(memo) = self.modules.lock().get(&key) {
			return memo.clone();
		}

		let resolved = match (self.binaries.get(&key), &self.scope) {
			(Some(binary), Some(scope)) => match scope.materialize(binary) {
				Ok(image) => Some(Module {
					name: binary.name().to_string(),
					origin: ModuleOrigin::Isolated {
						generation: self.generation,
					},
					image,
				}),
				Err(error) => {
					self.record_failure(binary.name(), &error);
					return None;
				}
			},
			_ => self.host.contains(name).then(|| Module {
				name: name.to_string(),
				origin: ModuleOrigin::Host,
				image: ModuleImage::Host,
			}),
		};

		self.modules.lock().entry(key).or_insert(resolved).clone()
	}

	/// Resolves `name`, failing when it is unavailable.
	pub fn require(&self, name: &str) -> Result<Module> {
		if let Some(module) = self.resolve(name) {
			return Ok(module);
		}
		match self.last_failure() {
			Some(failure) if failure.name.eq_ignore_ascii_case(name) => Err(failure.into()),
			_ => Err(LoadError::Missing(name.to_string())),
		}
	}

	/// Eagerly resolves every name in `companions` the snapshot overrides, so
	/// they come from this generation rather than the host.
	pub fn preload(&self, companions: &[String]) {
		for name in companions.iter().filter(|name| self.overrides(name)) {
			if self.resolve(name).is_some() {
				debug!(context = %self.label, module = %name, "Preloaded companion module");
			}
		}
	}

	pub fn last_failure(&self) -> Option<LoadFailure> {
		self.last_failure.lock().clone()
	}

	pub fn is_poisoned(&self) -> bool {
		self.last_failure.lock().is_some()
	}

	/// Runs `future` with this context as [`current`](Self::current).
	pub async fn scope<F: Future>(self: &Arc<Self>, future: F) -> F::Output {
		CURRENT.scope(Arc::clone(self), future).await
	}

	/// The context of the enclosing [`scope`](Self::scope), if any.
	pub fn current() -> Option<Arc<LoadContext>> {
		CURRENT.try_with(Arc::clone).ok()
	}

	fn record_failure(&self, name: &str, error: &LoadError) {
		let message = match error {
			LoadError::Module { message, .. } => message.clone(),
			other => other.to_string(),
		};
		warn!(context = %self.label, module = name, error = %message, "Module failed to load");
		*self.last_failure.lock() = Some(LoadFailure {
			name: name.to_string(),
			message,
		});
	}
}

impl fmt::Debug for LoadContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LoadContext")
			.field("label", &self.label)
			.field("generation", &self.generation)
			.field("binaries", &self.binaries.len())
			.field("poisoned", &self.is_poisoned())
			.finish()
	}
}

#[cfg(test)]
mod tests;
