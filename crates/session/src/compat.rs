//! Minimum supported compiler versions.

use std::collections::BTreeMap;

use kiln_deps::{CompilerKind, PackageInfo, PackageVersion};

use crate::config::{CompatConfig, ConfigError};

/// Per-compiler version floors. Packages below the floor are not registered;
/// the host's binaries stay in use instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatibilityPolicy {
	minimum: BTreeMap<CompilerKind, PackageVersion>,
}

impl CompatibilityPolicy {
	pub fn new(minimum: BTreeMap<CompilerKind, PackageVersion>) -> Self {
		Self { minimum }
	}

	pub fn from_config(config: &CompatConfig) -> Result<Self, ConfigError> {
		let minimum = config
			.minimum
			.iter()
			.map(|(kind, value)| {
				PackageVersion::parse(value)
					.map(|version| (*kind, version))
					.map_err(|_| ConfigError::InvalidVersion {
						kind: *kind,
						value: value.clone(),
					})
			})
			.collect::<Result<_, _>>()?;
		Ok(Self { minimum })
	}

	pub fn minimum(&self, kind: CompilerKind) -> Option<&PackageVersion> {
		self.minimum.get(&kind)
	}

	/// True when `info` names a version below `kind`'s floor. Labels that are
	/// not versions (CI build ids, `built-in`) are never below it.
	pub fn falls_below(&self, kind: CompilerKind, info: &PackageInfo) -> bool {
		let Some(minimum) = self.minimum(kind) else {
			return false;
		};
		PackageVersion::parse(&info.version).is_ok_and(|version| version < *minimum)
	}
}
