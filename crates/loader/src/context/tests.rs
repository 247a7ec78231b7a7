use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_deps::BinaryFormat;
use pretty_assertions::assert_eq;

use super::*;
use crate::materializer::InMemoryMaterializer;

/// Counts materializations and fails for names starting with `Broken`.
#[derive(Default)]
struct Counting {
	calls: Arc<AtomicUsize>,
}

struct CountingScope {
	calls: Arc<AtomicUsize>,
}

impl ModuleMaterializer for Counting {
	fn scope(&self, _label: &str) -> Result<Box<dyn MaterializeScope>> {
		Ok(Box::new(CountingScope {
			calls: Arc::clone(&self.calls),
		}))
	}
}

impl MaterializeScope for CountingScope {
	fn materialize(&self, binary: &LoadedBinary) -> Result<ModuleImage> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if binary.name().starts_with("Broken") {
			return Err(LoadError::Module {
				name: binary.name().to_string(),
				message: "bad image format".into(),
			});
		}
		Ok(ModuleImage::Bytes(binary.data().clone()))
	}
}

fn binary(name: &str) -> LoadedBinary {
	LoadedBinary::new(name, Bytes::from(format!("MZ {name}")), BinaryFormat::Native)
}

fn host() -> Arc<dyn HostModules> {
	Arc::new(StaticHostModules::new(["System.Runtime", "Microsoft.CodeAnalysis"]))
}

fn context(names: &[&str]) -> (LoadContext, Arc<AtomicUsize>) {
	let materializer = Counting::default();
	let calls = Arc::clone(&materializer.calls);
	let context = LoadContext::isolated(7, names.iter().map(|name| binary(name)).collect(), &materializer, host()).unwrap();
	(context, calls)
}

#[test]
fn overrides_are_materialized_once() {
	let (context, calls) = context(&["Microsoft.CodeAnalysis"]);
	assert_eq!(context.label(), "kiln-gen-7");

	let first = context.resolve("Microsoft.CodeAnalysis").unwrap();
	let again = context.resolve("microsoft.codeanalysis").unwrap();
	assert_eq!(first.origin, ModuleOrigin::Isolated { generation: 7 });
	assert_eq!(again.origin, ModuleOrigin::Isolated { generation: 7 });
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert!(!context.is_poisoned());
}

#[test]
fn misses_delegate_to_host() {
	let (context, calls) = context(&["Microsoft.CodeAnalysis"]);

	let runtime = context.resolve("System.Runtime").unwrap();
	assert_eq!(runtime.origin, ModuleOrigin::Host);
	assert!(context.resolve("Humanizer").is_none());
	assert!(!context.is_poisoned());
	assert_eq!(context.require("Humanizer").unwrap_err(), LoadError::Missing("Humanizer".into()));
	assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_override_poisons_context() {
	let (context, _) = context(&["Broken.Analyzer", "Microsoft.CodeAnalysis"]);

	assert!(context.resolve("Broken.Analyzer").is_none());
	assert_eq!(
		context.last_failure(),
		Some(LoadFailure {
			name: "Broken.Analyzer".into(),
			message: "bad image format".into(),
		})
	);
	assert!(context.is_poisoned());
	assert_eq!(
		context.require("Broken.Analyzer").unwrap_err().to_string(),
		"failed to load 'Broken.Analyzer': bad image format"
	);
}

#[test]
fn preload_resolves_overridden_companions_only() {
	let (context, calls) = context(&["Microsoft.CodeAnalysis.Workspaces", "Microsoft.CodeAnalysis"]);
	context.preload(&[
		"Microsoft.CodeAnalysis.Workspaces".to_string(),
		"Microsoft.CodeAnalysis.Features".to_string(),
	]);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert!(context.overrides("microsoft.codeanalysis.workspaces"));
}

#[test]
fn host_default_never_isolates() {
	let context = LoadContext::host_default(0, host());
	assert!(!context.is_isolated());
	assert_eq!(context.resolve("Microsoft.CodeAnalysis").unwrap().origin, ModuleOrigin::Host);
}

#[tokio::test]
async fn scope_sets_current_context() {
	assert!(LoadContext::current().is_none());
	let context = Arc::new(LoadContext::isolated(3, vec![binary("Microsoft.CodeAnalysis")], &InMemoryMaterializer, host()).unwrap());

	let seen = context
		.scope(async { LoadContext::current().map(|current| current.generation()) })
		.await;
	assert_eq!(seen, Some(3));
	assert!(LoadContext::current().is_none());
}
