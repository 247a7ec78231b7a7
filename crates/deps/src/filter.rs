//! Archive entry filters selecting "the binaries we want" from a package.
//!
//! Filters are cache keys: two filters compare equal exactly when they select
//! the same entries, so every variant holds only structural, normalized fields.

use std::collections::BTreeMap;

use tracing::warn;

use crate::framework::TargetFramework;

/// File name prefix shared by every compiler binary.
pub const COMPILER_BINARY_PREFIX: &str = "microsoft.";

/// Shim binaries shipped in reference packs that must not be loaded.
pub const DEFAULT_EXCLUDED_SUFFIXES: &[&str] = &[".thunk.dll", ".wrapper.dll"];

/// Predicate over archive entry paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DllFilter {
	/// Vendor binaries exactly one level below `folder`.
	Compiler { folder: String },
	/// Binaries exactly `depth` levels below `folder`, minus shim suffixes.
	FrameworkReference {
		folder: String,
		depth: usize,
		excluded_suffixes: Vec<String>,
	},
	/// `lib/<tfm>/*.dll` from the group nearest to `target_framework`.
	NearestTarget { target_framework: TargetFramework },
}

impl DllFilter {
	pub fn compiler(folder: &str) -> Self {
		Self::Compiler {
			folder: normalize_folder(folder),
		}
	}

	pub fn framework_reference(folder: &str) -> Self {
		Self::FrameworkReference {
			folder: normalize_folder(folder),
			depth: 1,
			excluded_suffixes: DEFAULT_EXCLUDED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
		}
	}

	pub fn framework_reference_with(folder: &str, depth: usize, excluded_suffixes: &[&str]) -> Self {
		let mut excluded_suffixes: Vec<String> = excluded_suffixes.iter().map(|s| s.to_ascii_lowercase()).collect();
		excluded_suffixes.sort();
		excluded_suffixes.dedup();
		Self::FrameworkReference {
			folder: normalize_folder(folder),
			depth: depth.max(1),
			excluded_suffixes,
		}
	}

	pub fn nearest_target(target_framework: TargetFramework) -> Self {
		Self::NearestTarget { target_framework }
	}

	/// Selects matching entry paths, preserving their order.
	pub fn select(&self, entries: &[String]) -> Vec<String> {
		match self {
			Self::Compiler { folder } => entries
				.iter()
				.filter(|entry| {
					let lower = entry.to_ascii_lowercase();
					relative_at_depth(&lower, folder, 1).is_some_and(|name| {
						name.starts_with(COMPILER_BINARY_PREFIX) && is_loadable(name) && !name.ends_with(".resources.dll")
					})
				})
				.cloned()
				.collect(),
			Self::FrameworkReference {
				folder,
				depth,
				excluded_suffixes,
			} => entries
				.iter()
				.filter(|entry| {
					let lower = entry.to_ascii_lowercase();
					relative_at_depth(&lower, folder, *depth).is_some_and(|name| {
						is_loadable(name) && !excluded_suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
					})
				})
				.cloned()
				.collect(),
			Self::NearestTarget { target_framework } => select_nearest(entries, target_framework),
		}
	}
}

fn normalize_folder(folder: &str) -> String {
	folder.trim_matches('/').replace('\\', "/").to_ascii_lowercase()
}

fn is_loadable(name: &str) -> bool {
	name.ends_with(".dll") || name.ends_with(".wasm")
}

/// Returns the file name if `path` sits exactly `depth` levels below `folder`.
fn relative_at_depth<'a>(path: &'a str, folder: &str, depth: usize) -> Option<&'a str> {
	let rest = if folder.is_empty() {
		path
	} else {
		path.strip_prefix(folder)?.strip_prefix('/')?
	};
	if rest.split('/').count() != depth || rest.split('/').any(str::is_empty) {
		return None;
	}
	rest.rsplit('/').next()
}

/// Groups `lib/` entries by target framework and keeps the nearest group.
fn select_nearest(entries: &[String], requested: &TargetFramework) -> Vec<String> {
	let mut groups: BTreeMap<String, (TargetFramework, Vec<String>)> = BTreeMap::new();

	for entry in entries {
		let lower = entry.to_ascii_lowercase();
		let Some(rest) = lower.strip_prefix("lib/") else {
			continue;
		};
		let (folder, framework) = match rest.split_once('/') {
			Some((folder, file)) if !file.contains('/') && is_loadable(file) => match TargetFramework::parse(folder) {
				Ok(framework) => (folder.to_string(), framework),
				Err(_) => continue,
			},
			None if is_loadable(rest) => (String::new(), TargetFramework::ANY),
			_ => continue,
		};
		groups
			.entry(folder)
			.or_insert_with(|| (framework, Vec::new()))
			.1
			.push(entry.clone());
	}

	let frameworks: Vec<TargetFramework> = groups.values().map(|(framework, _)| *framework).collect();
	let Some(nearest) = requested.nearest(&frameworks).copied() else {
		warn!(
			requested = %requested,
			available = ?groups.keys().collect::<Vec<_>>(),
			"No compatible target framework group; selecting nothing"
		);
		return Vec::new();
	};

	groups
		.into_values()
		.filter(|(framework, _)| *framework == nearest)
		.flat_map(|(_, entries)| entries)
		.collect()
}
