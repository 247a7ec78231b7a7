//! Named compiler entry points.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{LoadContext, ModuleOrigin};
use crate::{LoadError, Result};

/// One source document handed to the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
	pub name: String,
	pub text: String,
}

impl SourceFile {
	pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			text: text.into(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationInput {
	pub files: Vec<SourceFile>,
}

/// A compiler module as seen by a compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
	pub name: String,
	pub origin: ModuleOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledOutput {
	pub diagnostics: Vec<String>,
	/// Compiler modules the compile ran against.
	pub modules: Vec<ModuleSummary>,
}

/// A compiler instantiated inside one load context.
#[async_trait]
pub trait CompilerEntryPoint: Send + Sync {
	async fn compile(&self, input: &CompilationInput) -> Result<CompiledOutput>;
}

/// Instantiates a [`CompilerEntryPoint`] against a context.
pub trait EntryPointFactory: Send + Sync {
	fn create(&self, context: &Arc<LoadContext>) -> Result<Box<dyn CompilerEntryPoint>>;
}

/// Entry points by configured name.
#[derive(Default, Clone)]
pub struct EntryPointTable {
	factories: HashMap<String, Arc<dyn EntryPointFactory>>,
}

impl EntryPointTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn EntryPointFactory>) -> &mut Self {
		self.factories.insert(name.into(), factory);
		self
	}

	pub fn get(&self, name: &str) -> Result<Arc<dyn EntryPointFactory>> {
		self.factories
			.get(name)
			.cloned()
			.ok_or_else(|| LoadError::UnknownEntryPoint(name.to_string()))
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.factories.keys().map(String::as_str)
	}
}

/// Entry point that resolves a fixed list of compiler modules and reports
/// where each came from.
///
/// Hosts register real compilers next to it; on its own it shows which
/// generation a compile would run against.
#[derive(Debug, Clone)]
pub struct ModuleProbe {
	required: Vec<String>,
}

impl ModuleProbe {
	pub fn new<I, S>(required: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			required: required.into_iter().map(Into::into).collect(),
		}
	}
}

impl EntryPointFactory for ModuleProbe {
	fn create(&self, context: &Arc<LoadContext>) -> Result<Box<dyn CompilerEntryPoint>> {
		Ok(Box::new(ProbeEntryPoint {
			context: Arc::clone(context),
			required: self.required.clone(),
		}))
	}
}

struct ProbeEntryPoint {
	context: Arc<LoadContext>,
	required: Vec<String>,
}

#[async_trait]
impl CompilerEntryPoint for ProbeEntryPoint {
	async fn compile(&self, input: &CompilationInput) -> Result<CompiledOutput> {
		let modules = self
			.required
			.iter()
			.map(|name| {
				self.context.require(name).map(|module| ModuleSummary {
					name: module.name,
					origin: module.origin,
				})
			})
			.collect::<Result<Vec<_>>>()?;

		let diagnostics = input
			.files
			.iter()
			.filter(|file| file.text.trim().is_empty())
			.map(|file| format!("{}: warning: empty source file", file.name))
			.collect();
		Ok(CompiledOutput { diagnostics, modules })
	}
}

#[cfg(test)]
mod tests {
	use kiln_deps::{BinaryFormat, LoadedBinary};
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::context::StaticHostModules;
	use crate::materializer::InMemoryMaterializer;

	#[test]
	fn unknown_entry_point_is_an_error() {
		let table = EntryPointTable::new();
		assert_eq!(table.get("csharp").err(), Some(LoadError::UnknownEntryPoint("csharp".into())));
	}

	#[tokio::test]
	async fn probe_reports_module_origins() {
		let context = Arc::new(
			LoadContext::isolated(
				4,
				vec![LoadedBinary::new("Microsoft.CodeAnalysis.CSharp", &b"MZ"[..], BinaryFormat::Native)],
				&InMemoryMaterializer,
				Arc::new(StaticHostModules::new(["Microsoft.CodeAnalysis"])),
			)
			.unwrap(),
		);
		let mut table = EntryPointTable::new();
		table.register("csharp", Arc::new(ModuleProbe::new(["Microsoft.CodeAnalysis", "Microsoft.CodeAnalysis.CSharp"])));

		let entry = table.get("csharp").unwrap().create(&context).unwrap();
		let output = entry
			.compile(&CompilationInput {
				files: vec![SourceFile::new("Program.cs", "class C {}"), SourceFile::new("Empty.cs", " ")],
			})
			.await
			.unwrap();

		assert_eq!(
			output.modules,
			vec![
				ModuleSummary {
					name: "Microsoft.CodeAnalysis".into(),
					origin: ModuleOrigin::Host,
				},
				ModuleSummary {
					name: "Microsoft.CodeAnalysis.CSharp".into(),
					origin: ModuleOrigin::Isolated { generation: 4 },
				},
			]
		);
		assert_eq!(output.diagnostics, vec!["Empty.cs: warning: empty source file".to_string()]);
	}
}
