//! Free-text compiler version requests.

use std::fmt;

use crate::version::PackageVersion;

/// One interpretation of a user's version request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSpecifier {
	/// Whatever the host ships with.
	BuiltIn,
	/// An exact version on a package feed.
	ExactVersion(PackageVersion),
	/// The newest version on the first feed that has any.
	Latest,
	/// A CI build by id.
	CiBuild(u64),
	/// The newest successful CI build of a pull request.
	PullRequest(u64),
	/// The newest successful CI build of a branch.
	Branch(String),
}

impl VersionSpecifier {
	/// Parses user input into candidate interpretations in priority order.
	///
	/// Resolution tries each candidate in turn, so ambiguous input yields more
	/// than one: `"123"` is a pull request before it is a build id, and
	/// `"2.1.0"` is a feed version before it is a branch name.
	pub fn parse(input: Option<&str>) -> Vec<Self> {
		let text = input.map(str::trim).unwrap_or_default();

		if text.is_empty() || text.eq_ignore_ascii_case("built-in") {
			return vec![Self::BuiltIn];
		}

		if text.eq_ignore_ascii_case("latest") {
			return vec![Self::Latest];
		}

		if text.bytes().all(|b| b.is_ascii_digit())
			&& let Ok(number) = text.parse::<u64>()
		{
			return vec![Self::PullRequest(number), Self::CiBuild(number)];
		}

		if let Ok(version) = PackageVersion::parse(text) {
			return vec![Self::ExactVersion(version), Self::Branch(text.to_string())];
		}

		vec![Self::Branch(text.to_string())]
	}
}

impl fmt::Display for VersionSpecifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::BuiltIn => f.write_str("built-in"),
			Self::ExactVersion(version) => write!(f, "version {version}"),
			Self::Latest => f.write_str("latest"),
			Self::CiBuild(id) => write!(f, "build {id}"),
			Self::PullRequest(number) => write!(f, "pull request #{number}"),
			Self::Branch(name) => write!(f, "branch '{name}'"),
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn number_is_pull_request_then_build() {
		assert_eq!(
			VersionSpecifier::parse(Some("123")),
			vec![VersionSpecifier::PullRequest(123), VersionSpecifier::CiBuild(123)]
		);
	}

	#[test]
	fn latest_is_exactly_latest() {
		assert_eq!(VersionSpecifier::parse(Some("latest")), vec![VersionSpecifier::Latest]);
		assert_eq!(VersionSpecifier::parse(Some("LATEST")), vec![VersionSpecifier::Latest]);
	}

	#[test]
	fn plain_name_is_branch() {
		assert_eq!(VersionSpecifier::parse(Some("main")), vec![VersionSpecifier::Branch("main".into())]);
		assert_eq!(
			VersionSpecifier::parse(Some("features/ref-fields")),
			vec![VersionSpecifier::Branch("features/ref-fields".into())]
		);
	}

	#[test]
	fn version_is_tried_before_branch() {
		assert_eq!(
			VersionSpecifier::parse(Some("2.1.0")),
			vec![
				VersionSpecifier::ExactVersion(PackageVersion::new(2, 1, 0)),
				VersionSpecifier::Branch("2.1.0".into())
			]
		);
	}

	#[test]
	fn missing_or_blank_is_built_in() {
		assert_eq!(VersionSpecifier::parse(None), vec![VersionSpecifier::BuiltIn]);
		assert_eq!(VersionSpecifier::parse(Some("  ")), vec![VersionSpecifier::BuiltIn]);
		assert_eq!(VersionSpecifier::parse(Some("built-in")), vec![VersionSpecifier::BuiltIn]);
	}

	#[test]
	fn oversized_number_falls_back_to_branch() {
		let input = "99999999999999999999999";
		assert_eq!(VersionSpecifier::parse(Some(input)), vec![VersionSpecifier::Branch(input.into())]);
	}
}
