//! Generation-tracked registry of binary overrides.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::try_join_all;
use indexmap::IndexMap;
use kiln_deps::feed::DependencySet;
use kiln_deps::{CompilerKind, DllFilter, LoadedBinary, PackageCache, ResolvedPackage};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{LoadError, Result};

/// What a registry entry overrides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyKey {
	/// The binaries of one swappable compiler.
	Compiler(CompilerKind),
	/// A user-requested package set.
	Packages(DependencySet),
}

impl fmt::Display for DependencyKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Compiler(kind) => write!(f, "compiler {kind}"),
			Self::Packages(set) => write!(f, "packages {set}"),
		}
	}
}

/// Produces the binaries behind one registry entry.
#[async_trait]
pub trait BinarySupplier: Send + Sync {
	async fn binaries(&self) -> kiln_deps::Result<Arc<[LoadedBinary]>>;
}

/// A supplier with its binaries already in hand.
#[derive(Debug, Clone)]
pub struct FixedBinaries(pub Arc<[LoadedBinary]>);

#[async_trait]
impl BinarySupplier for FixedBinaries {
	async fn binaries(&self) -> kiln_deps::Result<Arc<[LoadedBinary]>> {
		Ok(Arc::clone(&self.0))
	}
}

/// Binaries selected from resolved packages through the shared cache.
pub struct PackageBinaries {
	cache: Arc<PackageCache>,
	selections: Vec<(Arc<ResolvedPackage>, DllFilter)>,
}

impl PackageBinaries {
	pub fn new(cache: Arc<PackageCache>, selections: Vec<(Arc<ResolvedPackage>, DllFilter)>) -> Self {
		Self { cache, selections }
	}
}

#[async_trait]
impl BinarySupplier for PackageBinaries {
	async fn binaries(&self) -> kiln_deps::Result<Arc<[LoadedBinary]>> {
		let cache = &self.cache;
		let sets = try_join_all(
			self.selections
				.iter()
				.map(|(package, filter)| async move { cache.get_assemblies(package, filter).await }),
		)
		.await?;
		Ok(sets.iter().flat_map(|set| set.iter().cloned()).collect())
	}
}

/// Registry of binary overrides keyed by [`DependencyKey`].
///
/// Every membership change bumps the generation. Readers compare the
/// generation they observed before slow work with the one after; nothing else
/// signals staleness.
#[derive(Default)]
pub struct DependencyRegistry {
	entries: RwLock<IndexMap<DependencyKey, Arc<dyn BinarySupplier>>>,
	generation: AtomicU64,
}

impl DependencyRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current_generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	pub fn contains(&self, key: &DependencyKey) -> bool {
		self.entries.read().contains_key(key)
	}

	/// Registers `supplier` under `key`, replacing and re-ordering any
	/// existing entry. Returns the new generation.
	pub fn set(&self, key: DependencyKey, supplier: Arc<dyn BinarySupplier>) -> u64 {
		let mut entries = self.entries.write();
		Self::insert_last(&mut entries, key.clone(), supplier);
		let generation = self.bump();
		debug!(key = %key, generation, "Registered dependency");
		generation
	}

	/// Like [`set`](Self::set), but only while the registry is still at
	/// `expected`.
	pub fn try_set(&self, key: DependencyKey, supplier: Arc<dyn BinarySupplier>, expected: u64) -> Result<u64> {
		let mut entries = self.entries.write();
		let actual = self.current_generation();
		if actual != expected {
			warn!(key = %key, expected, actual, "Dropping superseded registration");
			return Err(LoadError::StaleGeneration { expected, actual });
		}
		Self::insert_last(&mut entries, key.clone(), supplier);
		let generation = self.bump();
		debug!(key = %key, generation, "Registered dependency");
		Ok(generation)
	}

	/// Removes `key`. Returns false, leaving the generation alone, when it was
	/// not registered.
	pub fn remove(&self, key: &DependencyKey) -> bool {
		let mut entries = self.entries.write();
		if entries.shift_remove(key).is_none() {
			return false;
		}
		let generation = self.bump();
		debug!(key = %key, generation, "Removed dependency");
		true
	}

	/// Like [`remove`](Self::remove), but only while the registry is still at
	/// `expected`.
	pub fn try_remove(&self, key: &DependencyKey, expected: u64) -> Result<bool> {
		let mut entries = self.entries.write();
		let actual = self.current_generation();
		if actual != expected {
			return Err(LoadError::StaleGeneration { expected, actual });
		}
		if entries.shift_remove(key).is_none() {
			return Ok(false);
		}
		self.bump();
		Ok(true)
	}

	/// Removes `previous` and registers `supplier` under `key` as one change,
	/// only while the registry is still at `expected`. The generation moves
	/// once. Returns the new generation.
	pub fn try_replace(
		&self,
		previous: Option<&DependencyKey>,
		key: DependencyKey,
		supplier: Arc<dyn BinarySupplier>,
		expected: u64,
	) -> Result<u64> {
		let mut entries = self.entries.write();
		let actual = self.current_generation();
		if actual != expected {
			warn!(key = %key, expected, actual, "Dropping superseded replacement");
			return Err(LoadError::StaleGeneration { expected, actual });
		}
		if let Some(previous) = previous
			&& *previous != key
		{
			entries.shift_remove(previous);
		}
		Self::insert_last(&mut entries, key.clone(), supplier);
		let generation = self.bump();
		debug!(key = %key, generation, "Replaced dependency");
		Ok(generation)
	}

	/// Awaits every supplier in registration order and flattens the results.
	///
	/// Binaries are matched by logical name, ignoring case; on a collision the
	/// later registration wins.
	pub async fn all_binaries(&self) -> Result<Vec<LoadedBinary>> {
		let suppliers: Vec<(DependencyKey, Arc<dyn BinarySupplier>)> = self
			.entries
			.read()
			.iter()
			.map(|(key, supplier)| (key.clone(), Arc::clone(supplier)))
			.collect();

		let sets = try_join_all(suppliers.iter().map(|(_, supplier)| supplier.binaries())).await?;

		let mut merged: IndexMap<String, (LoadedBinary, &DependencyKey)> = IndexMap::new();
		for ((key, _), set) in suppliers.iter().zip(&sets) {
			for binary in set.iter() {
				let name = binary.name().to_ascii_lowercase();
				if let Some((_, previous)) = merged.get(&name) {
					warn!(binary = binary.name(), previous = %previous, winner = %key, "Binary registered twice; later registration wins");
				}
				merged.insert(name, (binary.clone(), key));
			}
		}
		Ok(merged.into_values().map(|(binary, _)| binary).collect())
	}

	fn insert_last(entries: &mut IndexMap<DependencyKey, Arc<dyn BinarySupplier>>, key: DependencyKey, supplier: Arc<dyn BinarySupplier>) {
		entries.shift_remove(&key);
		entries.insert(key, supplier);
	}

	fn bump(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}
}
