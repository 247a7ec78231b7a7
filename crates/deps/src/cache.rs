//! Package interning and filtered binary caching.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::binary::LoadedBinary;
use crate::filter::DllFilter;
use crate::package::{PackageIdentity, PackageSource, ResolvedPackage};
use crate::{Error, Result};

type CacheKey = (PackageIdentity, DllFilter);
type Shared = Result<Arc<[LoadedBinary]>>;

/// Tracking state for a fetch in progress.
struct InFlightFetch {
	tx: watch::Sender<Option<Shared>>,
	rx: watch::Receiver<Option<Shared>>,
}

/// Process-wide cache of resolved packages and the binaries selected from
/// them.
///
/// # Concurrency
///
/// - `packages`: one [`ResolvedPackage`] per identity, so each archive is
///   opened at most once
/// - `assemblies`: completed `(identity, filter)` results; failures are never
///   stored
/// - `inflight`: singleflight gate ensuring at most one download per
///   `(identity, filter)` across all callers
#[derive(Default)]
pub struct PackageCache {
	packages: RwLock<HashMap<PackageIdentity, Arc<ResolvedPackage>>>,
	assemblies: RwLock<HashMap<CacheKey, Arc<[LoadedBinary]>>>,
	inflight: Arc<Mutex<HashMap<CacheKey, Arc<InFlightFetch>>>>,
}

impl PackageCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the interned package for `identity`, creating it from
	/// `make_source` on first sight.
	pub fn package(&self, identity: PackageIdentity, make_source: impl FnOnce() -> Box<dyn PackageSource>) -> Arc<ResolvedPackage> {
		if let Some(package) = self.packages.read().get(&identity) {
			return Arc::clone(package);
		}
		let mut packages = self.packages.write();
		Arc::clone(
			packages
				.entry(identity.clone())
				.or_insert_with(|| Arc::new(ResolvedPackage::new(identity, make_source()))),
		)
	}

	fn completed(&self, key: &CacheKey) -> Option<Arc<[LoadedBinary]>> {
		self.assemblies.read().get(key).cloned()
	}

	/// Returns the binaries `filter` selects from `package`.
	///
	/// # Singleflight Protocol
	///
	/// 1. Fast path: return a completed result
	/// 2. Leader election: first caller becomes leader, others become waiters
	/// 3. Leader work: re-check completed results, download, store on
	///    success, publish to waiters, remove the inflight entry
	/// 4. Waiters receive the leader's result, success or failure
	///
	/// A leader dropped mid-fetch publishes [`Error::Aborted`] to its waiters
	/// and clears its inflight entry so the next call starts over.
	pub async fn get_assemblies(&self, package: &ResolvedPackage, filter: &DllFilter) -> Result<Arc<[LoadedBinary]>> {
		if package.is_builtin() {
			return Ok(Arc::from(Vec::new()));
		}

		let key: CacheKey = (package.identity().clone(), filter.clone());

		// 1. Fast path
		if let Some(binaries) = self.completed(&key) {
			debug!(package = %package.identity(), "Binary cache hit");
			return Ok(binaries);
		}

		// 2. Leader election
		let (inflight, is_leader) = {
			let mut map = self.inflight.lock();
			if let Some(existing) = map.get(&key) {
				(Arc::clone(existing), false)
			} else {
				let (tx, rx) = watch::channel(None);
				let fetch = Arc::new(InFlightFetch { tx, rx });
				map.insert(key.clone(), Arc::clone(&fetch));
				(fetch, true)
			}
		};

		if !is_leader {
			// 3a. Wait for leader
			let mut rx = inflight.rx.clone();
			loop {
				let published = rx.borrow().clone();
				if let Some(result) = published {
					return result;
				}
				if rx.changed().await.is_err() {
					return Err(Error::Aborted(format!("fetch of {} dropped without a result", package.identity())));
				}
			}
		}

		// 3b. Leader work
		let guard = FetchGuard {
			key: key.clone(),
			inflight_map: Arc::clone(&self.inflight),
			inflight,
			completed: false,
		};

		if let Some(binaries) = self.completed(&key) {
			return guard.complete(Ok(binaries), |_| {});
		}

		let result = fetch(package, filter).await;
		guard.complete(result, |binaries| {
			self.assemblies.write().insert(key.clone(), Arc::clone(binaries));
		})
	}
}

async fn fetch(package: &ResolvedPackage, filter: &DllFilter) -> Result<Arc<[LoadedBinary]>> {
	let archive = package.archive().await?;
	let entries = archive.entries();
	let selected = filter.select(&entries);
	if selected.is_empty() {
		warn!(package = %package.identity(), filter = ?filter, entries = entries.len(), "Filter selected no binaries");
	}

	let archive = &archive;
	let binaries = try_join_all(selected.iter().map(|path| async move {
		let data = archive.read(path).await?;
		Ok::<_, Error>(LoadedBinary::from_entry(path, data))
	}))
	.await?;
	debug!(package = %package.identity(), count = binaries.len(), "Fetched binaries");
	Ok(Arc::from(binaries))
}

/// Guard that un-wedges the inflight map if the leader fails or is cancelled.
struct FetchGuard {
	key: CacheKey,
	inflight_map: Arc<Mutex<HashMap<CacheKey, Arc<InFlightFetch>>>>,
	inflight: Arc<InFlightFetch>,
	completed: bool,
}

impl FetchGuard {
	/// Stores a success through `store`, removes the inflight entry, then
	/// publishes to waiters.
	fn complete(mut self, result: Shared, store: impl FnOnce(&Arc<[LoadedBinary]>)) -> Shared {
		self.completed = true;
		if let Ok(binaries) = &result {
			store(binaries);
		}
		self.inflight_map.lock().remove(&self.key);
		let _ = self.inflight.tx.send(Some(result.clone()));
		result
	}
}

impl Drop for FetchGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		// Leader exited early: unblock waiters and allow a retry.
		self.inflight_map.lock().remove(&self.key);
		let _ = self.inflight.tx.send(Some(Err(Error::Aborted(format!(
			"fetch of {} aborted (leader cancelled)",
			self.key.0
		)))));
	}
}
