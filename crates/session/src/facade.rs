//! Compiling inside the current isolated context.

use std::sync::Arc;

use kiln_loader::{
	CompilationInput, CompiledOutput, DependencyRegistry, EntryPointTable, IsolatedLoader, LoadContext, LoadError, LoadFailure,
};
use tracing::{debug, warn};

/// Why a compile produced no output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileFailure {
	/// Registered binaries could not be fetched.
	#[error("failed to fetch compiler dependencies: {0}")]
	Dependencies(String),
	/// A module failed to load; the context was discarded.
	#[error("{0}")]
	Isolation(LoadFailure),
	/// The registry moved while the context was being built.
	#[error("dependencies changed from generation {built} to {current} while loading; try again")]
	Superseded { built: u64, current: u64 },
	#[error("unknown entry point '{0}'")]
	EntryPoint(String),
	/// The compiler itself failed or panicked.
	#[error("{0}")]
	Compiler(String),
	#[error("io error: {0}")]
	Io(String),
}

impl From<LoadError> for CompileFailure {
	fn from(error: LoadError) -> Self {
		match error {
			LoadError::Fetch(error) => Self::Dependencies(error.to_string()),
			LoadError::Module { name, message } => Self::Isolation(LoadFailure { name, message }),
			LoadError::Missing(name) => Self::Isolation(LoadFailure {
				name,
				message: "not available in the context or on the host".into(),
			}),
			LoadError::StaleGeneration { expected, actual } => Self::Superseded {
				built: expected,
				current: actual,
			},
			LoadError::UnknownEntryPoint(name) => Self::EntryPoint(name),
			LoadError::Compiler(message) => Self::Compiler(message),
			LoadError::Io(message) => Self::Io(message),
		}
	}
}

/// A successful compile and where it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledReport {
	pub output: CompiledOutput,
	pub generation: u64,
	/// Label of the context the compile ran in.
	pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
	Compiled(CompiledReport),
	Failed(CompileFailure),
}

impl CompileOutcome {
	pub fn is_compiled(&self) -> bool {
		matches!(self, Self::Compiled(_))
	}
}

/// Runs the configured entry point inside a context that matches the
/// registry's current generation.
pub struct CompilerFacade {
	registry: Arc<DependencyRegistry>,
	loader: IsolatedLoader,
	entry_points: EntryPointTable,
	entry_point: String,
}

impl CompilerFacade {
	pub fn new(loader: IsolatedLoader, entry_points: EntryPointTable, entry_point: impl Into<String>) -> Self {
		Self {
			registry: Arc::clone(loader.registry()),
			loader,
			entry_points,
			entry_point: entry_point.into(),
		}
	}

	pub fn loader(&self) -> &IsolatedLoader {
		&self.loader
	}

	/// Compiles `input`. Every failure, including a compiler panic, comes back
	/// as [`CompileOutcome::Failed`].
	pub async fn compile(&self, input: CompilationInput) -> CompileOutcome {
		match self.try_compile(input).await {
			Ok(report) => CompileOutcome::Compiled(report),
			Err(failure) => {
				warn!(entry_point = %self.entry_point, error = %failure, "Compile failed");
				CompileOutcome::Failed(failure)
			}
		}
	}

	async fn try_compile(&self, input: CompilationInput) -> Result<CompiledReport, CompileFailure> {
		let factory = self.entry_points.get(&self.entry_point)?;
		let context = self.context().await?;
		let entry = factory.create(&context)?;

		let scoped = Arc::clone(&context);
		let task = tokio::spawn(async move { scoped.scope(entry.compile(&input)).await });
		let result = match task.await {
			Ok(result) => result,
			Err(error) if error.is_panic() => Err(LoadError::Compiler("compiler panicked".into())),
			Err(error) => Err(LoadError::Compiler(error.to_string())),
		};

		if let Some(failure) = context.last_failure() {
			self.loader.discard(&context);
			warn!(context = context.label(), module = %failure.name, error = %failure.message, "Discarding poisoned context");
			return Err(CompileFailure::Isolation(failure));
		}

		Ok(CompiledReport {
			output: result?,
			generation: context.generation(),
			context: context.label().to_string(),
		})
	}

	/// The installed context if it is current, else a freshly built one.
	async fn context(&self) -> Result<Arc<LoadContext>, CompileFailure> {
		let generation = self.registry.current_generation();
		if let Some(context) = self.loader.reusable(generation) {
			debug!(context = context.label(), "Reusing context");
			return Ok(context);
		}

		let context = self.loader.build(generation).await?;
		let current = self.registry.current_generation();
		if current != generation {
			warn!(built = generation, current, "Registry changed while building context");
			return Err(CompileFailure::Superseded { built: generation, current });
		}
		if let Some(failure) = context.last_failure() {
			return Err(CompileFailure::Isolation(failure));
		}

		self.loader.install(Arc::clone(&context));
		Ok(context)
	}
}
