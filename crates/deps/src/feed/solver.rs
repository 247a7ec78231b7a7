//! Transitive dependency closure over a [`FeedSet`].
//!
//! The solver iterates to a fixpoint. Each round rebuilds the constraint set
//! from the roots plus the dependencies of every currently chosen package,
//! fetches whatever metadata is still missing (concurrently, joined before
//! solving), and picks the lowest version satisfying every range on an id.
//! A failure on one id is recorded against that id; the rest still resolve.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use super::{DependencyGroup, FeedClient, FeedSet, PackageReference};
use crate::Error;
use crate::framework::TargetFramework;
use crate::package::PackageIdentity;
use crate::version::{PackageVersion, VersionRange};

const MAX_ROUNDS: usize = 32;

/// A package chosen for the closure, with the feed that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedReference {
	pub identity: PackageIdentity,
	pub feed: Arc<dyn FeedClient>,
}

/// Outcome of [`resolve_closure`].
#[derive(Debug, Default)]
pub struct ClosureResolution {
	/// Chosen packages, ordered by id.
	pub packages: Vec<ResolvedReference>,
	/// Failures keyed by lowercase package id.
	pub errors: BTreeMap<String, Error>,
}

struct Listing {
	feed: Arc<dyn FeedClient>,
	versions: Vec<PackageVersion>,
}

/// Resolves `roots` and their transitive dependencies for `target`.
pub async fn resolve_closure(feeds: &FeedSet, roots: &[PackageReference], target: &TargetFramework) -> ClosureResolution {
	let mut listings: HashMap<String, Listing> = HashMap::new();
	let mut dependencies: HashMap<PackageIdentity, Vec<PackageReference>> = HashMap::new();
	let mut fetch_errors: BTreeMap<String, Error> = BTreeMap::new();
	let mut chosen: BTreeMap<String, PackageIdentity> = BTreeMap::new();
	let mut solve_errors: BTreeMap<String, Error> = BTreeMap::new();

	for round in 0..MAX_ROUNDS {
		let constraints = collect_constraints(roots, &chosen, &dependencies);

		let unlisted: Vec<(String, String)> = constraints
			.iter()
			.filter(|(key, _)| !listings.contains_key(*key) && !fetch_errors.contains_key(*key))
			.map(|(key, (id, _))| (key.clone(), id.clone()))
			.collect();
		let listed = join_all(unlisted.iter().map(|(_, id)| feeds.versions(id))).await;
		for ((key, id), result) in unlisted.into_iter().zip(listed) {
			match result {
				Ok(Some(found)) => {
					listings.insert(
						key,
						Listing {
							feed: found.feed,
							versions: found.versions,
						},
					);
				}
				Ok(None) => {
					fetch_errors.insert(key, Error::NotFound(format!("package {id} was not found on any feed")));
				}
				Err(error) => {
					fetch_errors.insert(key, error);
				}
			}
		}

		let mut next: BTreeMap<String, PackageIdentity> = BTreeMap::new();
		solve_errors.clear();
		for (key, (id, ranges)) in &constraints {
			let Some(listing) = listings.get(key) else {
				continue;
			};
			let satisfying = listing
				.versions
				.iter()
				.filter(|version| ranges.iter().all(|range| range.satisfies(version)));
			match VersionRange::any().lowest_satisfying(satisfying) {
				Some(version) => {
					next.insert(key.clone(), PackageIdentity::new(id.as_str(), version.clone()));
				}
				None => {
					let wanted: Vec<String> = ranges.iter().map(ToString::to_string).collect();
					solve_errors.insert(
						key.clone(),
						Error::NotFound(format!("no version of {id} satisfies {}", wanted.join(" and "))),
					);
				}
			}
		}

		let undescribed: Vec<PackageIdentity> = next
			.values()
			.filter(|identity| !dependencies.contains_key(*identity) && !fetch_errors.contains_key(&key_of(identity.id())))
			.cloned()
			.collect();
		let described = join_all(undescribed.iter().map(|identity| {
			let feed = Arc::clone(&listings[&key_of(identity.id())].feed);
			async move { feed.dependency_groups(identity.id(), identity.version()).await }
		}))
		.await;
		for (identity, result) in undescribed.into_iter().zip(described) {
			match result {
				Ok(groups) => {
					let selected = DependencyGroup::select(&groups, target)
						.map(|group| group.dependencies.clone())
						.unwrap_or_default();
					dependencies.insert(identity, selected);
				}
				Err(error) => {
					warn!(package = %identity, error = %error, "Dependency metadata unavailable");
					fetch_errors.insert(key_of(identity.id()), error);
				}
			}
		}
		next.retain(|key, _| !fetch_errors.contains_key(key));

		if next == chosen {
			debug!(rounds = round + 1, packages = chosen.len(), "Dependency closure converged");
			break;
		}
		chosen = next;
		if round + 1 == MAX_ROUNDS {
			warn!(rounds = MAX_ROUNDS, "Dependency closure did not converge");
		}
	}

	let mut errors = fetch_errors;
	errors.extend(solve_errors);
	let packages = chosen
		.into_iter()
		.filter(|(key, _)| !errors.contains_key(key))
		.filter_map(|(key, identity)| {
			let feed = Arc::clone(&listings.get(&key)?.feed);
			Some(ResolvedReference { identity, feed })
		})
		.collect();

	ClosureResolution { packages, errors }
}

fn key_of(id: &str) -> String {
	id.to_ascii_lowercase()
}

/// Ranges per lowercase id, keeping the first spelling of each id.
fn collect_constraints(
	roots: &[PackageReference],
	chosen: &BTreeMap<String, PackageIdentity>,
	dependencies: &HashMap<PackageIdentity, Vec<PackageReference>>,
) -> BTreeMap<String, (String, Vec<VersionRange>)> {
	let mut constraints: BTreeMap<String, (String, Vec<VersionRange>)> = BTreeMap::new();
	let declared = chosen
		.values()
		.filter_map(|identity| dependencies.get(identity))
		.flatten();
	for reference in roots.iter().chain(declared) {
		let entry = constraints
			.entry(key_of(&reference.id))
			.or_insert_with(|| (reference.id.clone(), Vec::new()));
		if !entry.1.contains(&reference.range) {
			entry.1.push(reference.range.clone());
		}
	}
	constraints
}
