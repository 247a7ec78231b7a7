//! Static descriptions of the swappable compilers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A compiler whose binaries can be swapped at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
	Roslyn,
	Razor,
}

impl CompilerKind {
	pub const ALL: [CompilerKind; 2] = [CompilerKind::Roslyn, CompilerKind::Razor];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Roslyn => "roslyn",
			Self::Razor => "razor",
		}
	}

	/// Returns the packaging and CI coordinates for this compiler.
	pub fn info(self) -> &'static CompilerInfo {
		match self {
			Self::Roslyn => &ROSLYN,
			Self::Razor => &RAZOR,
		}
	}
}

impl fmt::Display for CompilerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CompilerKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"roslyn" => Ok(Self::Roslyn),
			"razor" => Ok(Self::Razor),
			other => Err(format!("unknown compiler '{other}'")),
		}
	}
}

/// Where a compiler's binaries live on feeds and in CI.
#[derive(Debug, PartialEq, Eq)]
pub struct CompilerInfo {
	pub kind: CompilerKind,
	/// Package id on the feeds.
	pub package_id: &'static str,
	/// Folder inside the package that holds the compiler binaries.
	pub package_folder: &'static str,
	/// `owner/name` of the source repository, used for commit links.
	pub repository: &'static str,
	/// Build definition id on the build server.
	pub build_definition: u32,
	/// Artifact that carries the packed compiler.
	pub artifact_name: &'static str,
	/// Loose binaries to pick out of a dedup artifact.
	pub loose_binaries: &'static [&'static str],
}

impl CompilerInfo {
	pub fn commit_url(&self, commit: &str) -> String {
		format!("https://github.com/{}/commit/{commit}", self.repository)
	}
}

static ROSLYN: CompilerInfo = CompilerInfo {
	kind: CompilerKind::Roslyn,
	package_id: "Microsoft.Net.Compilers.Toolset",
	package_folder: "tasks/netcore/bincore",
	repository: "dotnet/roslyn",
	build_definition: 95,
	artifact_name: "PackageArtifacts",
	loose_binaries: &["Microsoft.CodeAnalysis.dll", "Microsoft.CodeAnalysis.CSharp.dll"],
};

static RAZOR: CompilerInfo = CompilerInfo {
	kind: CompilerKind::Razor,
	package_id: "Microsoft.Net.Compilers.Razor.Toolset",
	package_folder: "source-generators",
	repository: "dotnet/razor",
	build_definition: 103,
	artifact_name: "PackageArtifacts",
	loose_binaries: &[
		"Microsoft.CodeAnalysis.Razor.Compiler.dll",
		"Microsoft.AspNetCore.Razor.Utilities.Shared.dll",
		"Microsoft.Extensions.ObjectPool.dll",
	],
};

/// Build flavor of CI artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildConfiguration {
	#[default]
	Release,
	Debug,
}

impl BuildConfiguration {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Release => "Release",
			Self::Debug => "Debug",
		}
	}
}

impl fmt::Display for BuildConfiguration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
