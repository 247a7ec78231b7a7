use pretty_assertions::assert_eq;
use rstest::rstest;

use super::*;

fn v(text: &str) -> PackageVersion {
	PackageVersion::parse(text).unwrap()
}

#[rstest]
#[case::one_part("4", "4.0.0")]
#[case::two_parts("4.12", "4.12.0")]
#[case::three_parts("4.12.0", "4.12.0")]
#[case::revision("4.0.0.1", "4.0.0.1")]
#[case::zero_revision("4.0.0.0", "4.0.0")]
#[case::prerelease("4.14.0-3.25168.8", "4.14.0-3.25168.8")]
#[case::dashed_prerelease("5.0.0-ci-main", "5.0.0-ci-main")]
fn normalizes_lenient_versions(#[case] input: &str, #[case] expected: &str) {
	assert_eq!(v(input).normalized(), expected);
}

#[rstest]
#[case::empty("")]
#[case::five_parts("1.2.3.4.5")]
#[case::letters("main")]
#[case::trailing_dot("1.2.")]
#[case::empty_prerelease("1.2.3-")]
fn rejects_invalid_versions(#[case] input: &str) {
	assert!(PackageVersion::parse(input).is_err());
}

#[test]
fn ordering_puts_prerelease_before_release_and_respects_revision() {
	let mut versions = vec![v("2.0.0"), v("2.0.0-preview.2"), v("1.9.9.1"), v("1.9.9"), v("2.0.0-preview.10")];
	versions.sort();
	let rendered: Vec<String> = versions.iter().map(ToString::to_string).collect();
	assert_eq!(rendered, ["1.9.9", "1.9.9.1", "2.0.0-preview.2", "2.0.0-preview.10", "2.0.0"]);
}

#[test]
fn build_metadata_is_ignored_by_equality() {
	assert_eq!(v("1.0.0+abc"), v("1.0.0+def"));
	assert_eq!(v("1.0.0+abc").to_string(), "1.0.0+abc");
	assert_eq!(v("1.0.0+abc").normalized(), "1.0.0");
}

#[rstest]
#[case::bare_minimum("1.0", "1.0.0", true)]
#[case::bare_minimum_below("1.0", "0.9.0", false)]
#[case::exact_hit("[1.2.0]", "1.2.0", true)]
#[case::exact_miss("[1.2.0]", "1.2.1", false)]
#[case::half_open_upper("[1.0, 2.0)", "2.0.0", false)]
#[case::half_open_inside("[1.0, 2.0)", "1.99.0", true)]
#[case::exclusive_min("(1.0, )", "1.0.0", false)]
#[case::exclusive_min_above("(1.0, )", "1.0.1", true)]
#[case::inclusive_max("(, 2.0]", "2.0.0", true)]
fn range_membership(#[case] range: &str, #[case] version: &str, #[case] expected: bool) {
	assert_eq!(VersionRange::parse(range).unwrap().satisfies(&v(version)), expected);
}

#[rstest]
#[case::inverted("[2.0, 1.0]")]
#[case::empty_exclusive("(1.0, 1.0)")]
#[case::unterminated("[1.0, 2.0")]
#[case::open_exact("(1.0)")]
fn rejects_invalid_ranges(#[case] input: &str) {
	assert!(VersionRange::parse(input).is_err());
}

#[test]
fn range_display_round_trips_common_forms() {
	for text in ["[1.0.0, )", "[1.0.0]", "[1.0.0, 2.0.0)", "(, 3.0.0]"] {
		assert_eq!(VersionRange::parse(text).unwrap().to_string(), text);
	}
}

#[test]
fn lowest_satisfying_prefers_stable() {
	let candidates = [v("1.0.0-beta"), v("1.0.0"), v("1.1.0"), v("2.0.0")];
	let range = VersionRange::parse("[1.0.0-alpha, )").unwrap();
	assert_eq!(range.lowest_satisfying(&candidates), Some(&candidates[1]));

	let only_pre = [v("3.0.0-rc.1"), v("3.0.0-rc.2")];
	let range = VersionRange::parse("[3.0.0-rc.1, )").unwrap();
	assert_eq!(range.lowest_satisfying(&only_pre), Some(&only_pre[0]));

	let range = VersionRange::parse("[5.0, )").unwrap();
	assert_eq!(range.lowest_satisfying(&candidates), None);
}
