//! Current-context bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::context::{HostModules, LoadContext};
use crate::materializer::ModuleMaterializer;
use crate::registry::DependencyRegistry;

/// Owns the current [`LoadContext`] and builds replacements from the
/// registry.
///
/// Building never installs: the caller compares generations after the slow
/// build and only then calls [`install`](Self::install). Replaced contexts
/// are dropped by the loader, but compiles that still hold an `Arc` keep
/// theirs alive until they finish.
pub struct IsolatedLoader {
	registry: Arc<DependencyRegistry>,
	materializer: Arc<dyn ModuleMaterializer>,
	host: Arc<dyn HostModules>,
	companions: Vec<String>,
	current: Mutex<Option<Arc<LoadContext>>>,
}

impl IsolatedLoader {
	pub fn new(
		registry: Arc<DependencyRegistry>,
		materializer: Arc<dyn ModuleMaterializer>,
		host: Arc<dyn HostModules>,
		companions: Vec<String>,
	) -> Self {
		Self {
			registry,
			materializer,
			host,
			companions,
			current: Mutex::new(None),
		}
	}

	pub fn registry(&self) -> &Arc<DependencyRegistry> {
		&self.registry
	}

	/// The installed context, if it is still at `generation` and healthy.
	pub fn reusable(&self, generation: u64) -> Option<Arc<LoadContext>> {
		let current = self.current.lock();
		current
			.as_ref()
			.filter(|context| context.generation() == generation && !context.is_poisoned())
			.cloned()
	}

	/// Builds a context for `generation` from the registry's current
	/// contents.
	pub async fn build(&self, generation: u64) -> Result<Arc<LoadContext>> {
		if self.registry.is_empty() {
			debug!(generation, "No overrides registered; using host context");
			return Ok(Arc::new(LoadContext::host_default(generation, Arc::clone(&self.host))));
		}

		let binaries = self.registry.all_binaries().await?;
		let count = binaries.len();
		let context = LoadContext::isolated(generation, binaries, self.materializer.as_ref(), Arc::clone(&self.host))?;
		context.preload(&self.companions);
		info!(context = context.label(), binaries = count, "Built isolated context");
		Ok(Arc::new(context))
	}

	/// Makes `context` current, releasing the previous one.
	pub fn install(&self, context: Arc<LoadContext>) {
		let previous = self.current.lock().replace(context);
		if let Some(previous) = previous {
			debug!(context = previous.label(), "Released previous context");
		}
	}

	/// Clears `context` if it is still the current one.
	pub fn discard(&self, context: &Arc<LoadContext>) -> bool {
		let mut current = self.current.lock();
		if current.as_ref().is_some_and(|installed| Arc::ptr_eq(installed, context)) {
			*current = None;
			debug!(context = context.label(), "Discarded context");
			return true;
		}
		false
	}

	pub fn current(&self) -> Option<Arc<LoadContext>> {
		self.current.lock().clone()
	}
}
