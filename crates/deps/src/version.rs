//! Package versions and version ranges as published on package feeds.
//!
//! Feeds accept versions with one to four numeric components (`1`, `1.2`,
//! `4.0.0.0`). [`PackageVersion`] normalizes those onto [`semver::Version`]
//! and keeps the fourth "revision" component beside it. Build metadata is
//! carried for display but ignored by equality and ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{Error, Result};

/// A feed package version.
#[derive(Debug, Clone)]
pub struct PackageVersion {
	version: semver::Version,
	revision: u64,
}

impl PackageVersion {
	/// Creates a stable three-component version.
	pub fn new(major: u64, minor: u64, patch: u64) -> Self {
		Self {
			version: semver::Version::new(major, minor, patch),
			revision: 0,
		}
	}

	/// Parses a lenient feed version string.
	pub fn parse(input: &str) -> Result<Self> {
		let text = input.trim();
		let invalid = || Error::Version(input.to_string());

		let (core_and_pre, build) = match text.split_once('+') {
			Some((head, build)) => (head, Some(build)),
			None => (text, None),
		};
		let (core, pre) = match core_and_pre.split_once('-') {
			Some((core, pre)) => (core, Some(pre)),
			None => (core_and_pre, None),
		};

		let parts: Vec<&str> = core.split('.').collect();
		if parts.is_empty() || parts.len() > 4 {
			return Err(invalid());
		}
		let mut numbers = [0u64; 4];
		for (slot, part) in numbers.iter_mut().zip(&parts) {
			if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
				return Err(invalid());
			}
			*slot = part.parse().map_err(|_| invalid())?;
		}

		let mut normalized = format!("{}.{}.{}", numbers[0], numbers[1], numbers[2]);
		if let Some(pre) = pre {
			normalized.push('-');
			normalized.push_str(pre);
		}
		if let Some(build) = build {
			normalized.push('+');
			normalized.push_str(build);
		}

		let version = semver::Version::parse(&normalized).map_err(|_| invalid())?;
		Ok(Self {
			version,
			revision: numbers[3],
		})
	}

	pub fn major(&self) -> u64 {
		self.version.major
	}

	pub fn minor(&self) -> u64 {
		self.version.minor
	}

	pub fn patch(&self) -> u64 {
		self.version.patch
	}

	pub fn revision(&self) -> u64 {
		self.revision
	}

	/// Returns true when the version carries a prerelease label.
	pub fn is_prerelease(&self) -> bool {
		!self.version.pre.is_empty()
	}

	/// Normalized string without build metadata, as used in feed URLs.
	pub fn normalized(&self) -> String {
		let mut out = format!("{}.{}.{}", self.version.major, self.version.minor, self.version.patch);
		if self.revision != 0 {
			out.push_str(&format!(".{}", self.revision));
		}
		if !self.version.pre.is_empty() {
			out.push('-');
			out.push_str(self.version.pre.as_str());
		}
		out
	}

	fn sort_key(&self) -> (u64, u64, u64, u64) {
		(self.version.major, self.version.minor, self.version.patch, self.revision)
	}
}

impl fmt::Display for PackageVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.normalized())?;
		if !self.version.build.is_empty() {
			write!(f, "+{}", self.version.build)?;
		}
		Ok(())
	}
}

impl FromStr for PackageVersion {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

impl PartialEq for PackageVersion {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for PackageVersion {}

impl Hash for PackageVersion {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.sort_key().hash(state);
		self.version.pre.hash(state);
	}
}

impl PartialOrd for PackageVersion {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for PackageVersion {
	fn cmp(&self, other: &Self) -> Ordering {
		self.sort_key()
			.cmp(&other.sort_key())
			.then_with(|| self.version.pre.cmp(&other.version.pre))
	}
}

/// One end of a [`VersionRange`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bound {
	pub version: PackageVersion,
	pub inclusive: bool,
}

/// A feed version range in interval notation.
///
/// | Notation | Meaning |
/// |---|---|
/// | `1.0` | `1.0 <= x` |
/// | `[1.0]` | `x == 1.0` |
/// | `[1.0, 2.0)` | `1.0 <= x < 2.0` |
/// | `(1.0, )` | `1.0 < x` |
/// | `(, 2.0]` | `x <= 2.0` |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
	min: Option<Bound>,
	max: Option<Bound>,
}

impl VersionRange {
	/// A range accepting every version.
	pub fn any() -> Self {
		Self { min: None, max: None }
	}

	/// `version <= x`.
	pub fn at_least(version: PackageVersion) -> Self {
		Self {
			min: Some(Bound { version, inclusive: true }),
			max: None,
		}
	}

	/// `x == version`.
	pub fn exact(version: PackageVersion) -> Self {
		Self {
			min: Some(Bound {
				version: version.clone(),
				inclusive: true,
			}),
			max: Some(Bound { version, inclusive: true }),
		}
	}

	pub fn min(&self) -> Option<&Bound> {
		self.min.as_ref()
	}

	pub fn max(&self) -> Option<&Bound> {
		self.max.as_ref()
	}

	/// Parses interval notation or a bare minimum version.
	pub fn parse(input: &str) -> Result<Self> {
		let text = input.trim();
		let invalid = || Error::Version(input.to_string());

		if text.is_empty() {
			return Ok(Self::any());
		}

		let Some(open) = text.chars().next().filter(|c| *c == '[' || *c == '(') else {
			return Ok(Self::at_least(PackageVersion::parse(text)?));
		};
		let close = text.chars().last().filter(|c| *c == ']' || *c == ')').ok_or_else(invalid)?;
		let inner = &text[1..text.len() - 1];

		let Some((left, right)) = inner.split_once(',') else {
			if open != '[' || close != ']' {
				return Err(invalid());
			}
			return Ok(Self::exact(PackageVersion::parse(inner)?));
		};

		let bound = |part: &str, inclusive: bool| -> Result<Option<Bound>> {
			let part = part.trim();
			if part.is_empty() {
				Ok(None)
			} else {
				Ok(Some(Bound {
					version: PackageVersion::parse(part)?,
					inclusive,
				}))
			}
		};

		let range = Self {
			min: bound(left, open == '[')?,
			max: bound(right, close == ']')?,
		};
		if let (Some(min), Some(max)) = (&range.min, &range.max)
			&& (min.version > max.version || (min.version == max.version && !(min.inclusive && max.inclusive)))
		{
			return Err(invalid());
		}
		Ok(range)
	}

	/// Returns true if `version` falls inside the range.
	pub fn satisfies(&self, version: &PackageVersion) -> bool {
		let above_min = self.min.as_ref().is_none_or(|min| match version.cmp(&min.version) {
			Ordering::Greater => true,
			Ordering::Equal => min.inclusive,
			Ordering::Less => false,
		});
		let below_max = self.max.as_ref().is_none_or(|max| match version.cmp(&max.version) {
			Ordering::Less => true,
			Ordering::Equal => max.inclusive,
			Ordering::Greater => false,
		});
		above_min && below_max
	}

	/// Picks the lowest satisfying version, preferring stable releases.
	pub fn lowest_satisfying<'a, I>(&self, candidates: I) -> Option<&'a PackageVersion>
	where
		I: IntoIterator<Item = &'a PackageVersion>,
	{
		let matching: Vec<&PackageVersion> = candidates.into_iter().filter(|v| self.satisfies(v)).collect();
		let stable = matching.iter().copied().filter(|v| !v.is_prerelease()).min();
		stable.or_else(|| matching.into_iter().min())
	}
}

impl fmt::Display for VersionRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (&self.min, &self.max) {
			(None, None) => f.write_str("(, )"),
			(Some(min), Some(max)) if min.version == max.version => write!(f, "[{}]", min.version),
			(min, max) => {
				match min {
					Some(min) => write!(f, "{}{}, ", if min.inclusive { '[' } else { '(' }, min.version)?,
					None => f.write_str("(, ")?,
				}
				match max {
					Some(max) => write!(f, "{}{}", max.version, if max.inclusive { ']' } else { ')' }),
					None => f.write_str(")"),
				}
			}
		}
	}
}

impl FromStr for VersionRange {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

#[cfg(test)]
mod tests;
