//! Target framework monikers and nearest-compatible selection.
//!
//! Library packages ship one binary folder per target framework
//! (`lib/net6.0`, `lib/netstandard2.0`, ...). A consumer targeting some
//! framework picks the closest folder it can load. Precedence, best first:
//!
//! 1. same family, highest version not above the requested one
//! 2. `netcoreapp*` for `net5.0+` requesters
//! 3. `netstandard*` up to the level the requester implements
//! 4. the framework-agnostic group
//!
//! Ties within a tier go to the highest version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameworkFamily {
	/// `net5.0` and later.
	Net,
	NetCoreApp,
	NetStandard,
	/// .NET Framework (`net45`, `net472`).
	NetFramework,
	/// Binaries usable from any framework.
	Any,
}

/// A parsed target framework moniker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetFramework {
	family: FrameworkFamily,
	version: (u16, u16, u16),
}

impl TargetFramework {
	pub const ANY: TargetFramework = TargetFramework {
		family: FrameworkFamily::Any,
		version: (0, 0, 0),
	};

	pub const fn new(family: FrameworkFamily, major: u16, minor: u16) -> Self {
		Self {
			family,
			version: (major, minor, 0),
		}
	}

	pub fn family(&self) -> FrameworkFamily {
		self.family
	}

	pub fn version(&self) -> (u16, u16, u16) {
		self.version
	}

	/// Parses a short folder name (`net8.0`, `netstandard2.0`, `net472`) or a
	/// long catalog name (`.NETStandard2.0`, `.NETFramework4.6.1`).
	pub fn parse(input: &str) -> Result<Self> {
		let invalid = || Error::Version(format!("target framework {input}"));
		let lower = input.trim().to_ascii_lowercase();
		// Platform suffixes (`net8.0-windows`) do not change compatibility here.
		let lower = lower.split('-').next().unwrap_or_default();

		if lower.is_empty() || lower == "any" || lower == "dotnet" {
			return Ok(Self::ANY);
		}

		let (family, rest) = if let Some(rest) = lower.strip_prefix(".netstandard").or_else(|| lower.strip_prefix("netstandard")) {
			(FrameworkFamily::NetStandard, rest)
		} else if let Some(rest) = lower.strip_prefix(".netcoreapp").or_else(|| lower.strip_prefix("netcoreapp")) {
			(FrameworkFamily::NetCoreApp, rest)
		} else if let Some(rest) = lower.strip_prefix(".netframework") {
			(FrameworkFamily::NetFramework, rest)
		} else if let Some(rest) = lower.strip_prefix("net") {
			if rest.contains('.') {
				(FrameworkFamily::Net, rest)
			} else {
				return parse_compact_framework(rest).ok_or_else(invalid);
			}
		} else {
			return Err(invalid());
		};

		let version = parse_dotted(rest).ok_or_else(invalid)?;
		let framework = Self { family, version };
		if family == FrameworkFamily::Net && version.0 < 5 {
			// `net4.5` style dotted .NET Framework names.
			return Ok(Self {
				family: FrameworkFamily::NetFramework,
				version,
			});
		}
		Ok(framework)
	}

	/// Returns the precedence tier of `candidate` for this requester, or
	/// `None` if it cannot be consumed.
	pub fn compatibility_tier(&self, candidate: &TargetFramework) -> Option<u8> {
		use FrameworkFamily::*;

		if candidate.family == Any {
			return Some(3);
		}

		match self.family {
			Net => match candidate.family {
				Net if candidate.version <= self.version => Some(0),
				NetCoreApp => Some(1),
				NetStandard if candidate.version <= (2, 1, 0) => Some(2),
				_ => None,
			},
			NetCoreApp => match candidate.family {
				NetCoreApp if candidate.version <= self.version => Some(0),
				NetStandard if candidate.version <= netstandard_for_core(self.version) => Some(2),
				_ => None,
			},
			NetStandard => match candidate.family {
				NetStandard if candidate.version <= self.version => Some(0),
				_ => None,
			},
			NetFramework => match candidate.family {
				NetFramework if candidate.version <= self.version => Some(0),
				NetStandard => netstandard_for_framework(self.version)
					.filter(|level| candidate.version <= *level)
					.map(|_| 2),
				_ => None,
			},
			Any => None,
		}
	}

	/// Picks the nearest compatible framework among `candidates`.
	pub fn nearest<'a, I>(&self, candidates: I) -> Option<&'a TargetFramework>
	where
		I: IntoIterator<Item = &'a TargetFramework>,
	{
		candidates
			.into_iter()
			.filter_map(|candidate| self.compatibility_tier(candidate).map(|tier| (tier, candidate)))
			.min_by(|(tier_a, a), (tier_b, b)| tier_a.cmp(tier_b).then_with(|| b.version.cmp(&a.version)))
			.map(|(_, candidate)| candidate)
	}
}

fn parse_dotted(text: &str) -> Option<(u16, u16, u16)> {
	let mut parts = text.split('.');
	let major = parts.next()?.parse().ok()?;
	let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
	let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
	if parts.next().is_some() {
		return None;
	}
	Some((major, minor, patch))
}

/// `net472` style: one digit per component.
fn parse_compact_framework(digits: &str) -> Option<TargetFramework> {
	if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	let digit = |i: usize| digits.as_bytes().get(i).map_or(0, |b| u16::from(b - b'0'));
	Some(TargetFramework {
		family: FrameworkFamily::NetFramework,
		version: (digit(0), digit(1), digit(2)),
	})
}

fn netstandard_for_core(version: (u16, u16, u16)) -> (u16, u16, u16) {
	match version {
		v if v >= (3, 0, 0) => (2, 1, 0),
		v if v >= (2, 0, 0) => (2, 0, 0),
		_ => (1, 6, 0),
	}
}

fn netstandard_for_framework(version: (u16, u16, u16)) -> Option<(u16, u16, u16)> {
	match version {
		v if v >= (4, 6, 1) => Some((2, 0, 0)),
		v if v >= (4, 6, 0) => Some((1, 3, 0)),
		v if v >= (4, 5, 1) => Some((1, 2, 0)),
		v if v >= (4, 5, 0) => Some((1, 1, 0)),
		_ => None,
	}
}

impl fmt::Display for TargetFramework {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let (major, minor, patch) = self.version;
		match self.family {
			FrameworkFamily::Net => write!(f, "net{major}.{minor}"),
			FrameworkFamily::NetCoreApp => write!(f, "netcoreapp{major}.{minor}"),
			FrameworkFamily::NetStandard => write!(f, "netstandard{major}.{minor}"),
			FrameworkFamily::NetFramework if patch == 0 => write!(f, "net{major}{minor}"),
			FrameworkFamily::NetFramework => write!(f, "net{major}{minor}{patch}"),
			FrameworkFamily::Any => f.write_str("any"),
		}
	}
}

impl FromStr for TargetFramework {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

impl Serialize for TargetFramework {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for TargetFramework {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let text = String::deserialize(deserializer)?;
		Self::parse(&text).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use rstest::rstest;

	use super::*;

	fn tfm(text: &str) -> TargetFramework {
		TargetFramework::parse(text).unwrap()
	}

	#[rstest]
	#[case::net("net8.0", "net8.0")]
	#[case::platform_suffix("net8.0-windows", "net8.0")]
	#[case::core("netcoreapp3.1", "netcoreapp3.1")]
	#[case::standard("netstandard2.0", "netstandard2.0")]
	#[case::framework("net472", "net472")]
	#[case::framework_two_digit("net48", "net48")]
	#[case::long_standard(".NETStandard2.0", "netstandard2.0")]
	#[case::long_framework(".NETFramework4.6.1", "net461")]
	#[case::long_core(".NETCoreApp3.1", "netcoreapp3.1")]
	#[case::any("any", "any")]
	fn parses_monikers(#[case] input: &str, #[case] expected: &str) {
		assert_eq!(tfm(input).to_string(), expected);
	}

	#[rstest]
	#[case::net_over_standard(&["net6.0", "netstandard2.0"], "net8.0", Some("net6.0"))]
	#[case::highest_net_not_above(&["net6.0", "net7.0", "net9.0"], "net8.0", Some("net7.0"))]
	#[case::exact_match(&["net8.0", "net6.0"], "net8.0", Some("net8.0"))]
	#[case::core_over_standard(&["netcoreapp3.1", "netstandard2.1"], "net8.0", Some("netcoreapp3.1"))]
	#[case::standard_only(&["netstandard1.3", "netstandard2.0"], "net8.0", Some("netstandard2.0"))]
	#[case::framework_rejected(&["net472"], "net8.0", None)]
	#[case::newer_net_rejected(&["net9.0"], "net8.0", None)]
	#[case::any_last(&["any", "netstandard2.0"], "net8.0", Some("netstandard2.0"))]
	#[case::any_fallback(&["any", "net472"], "net8.0", Some("any"))]
	#[case::framework_uses_standard20(&["netstandard2.0", "netstandard2.1"], "net472", Some("netstandard2.0"))]
	#[case::old_framework_uses_standard13(&["netstandard1.3", "netstandard2.0"], "net46", Some("netstandard1.3"))]
	#[case::framework_prefers_framework(&["net45", "netstandard2.0"], "net48", Some("net45"))]
	#[case::core21_caps_standard(&["netstandard2.1", "netstandard2.0"], "netcoreapp2.1", Some("netstandard2.0"))]
	#[case::standard_requester(&["net6.0", "netstandard1.6"], "netstandard2.0", Some("netstandard1.6"))]
	fn nearest_group(#[case] available: &[&str], #[case] requested: &str, #[case] expected: Option<&str>) {
		let available: Vec<TargetFramework> = available.iter().map(|t| tfm(t)).collect();
		let chosen = tfm(requested).nearest(&available).map(ToString::to_string);
		assert_eq!(chosen.as_deref(), expected);
	}

	#[test]
	fn rejects_unknown_monikers() {
		assert!(TargetFramework::parse("uap10.0").is_err());
		assert!(TargetFramework::parse("net4x").is_err());
	}
}
