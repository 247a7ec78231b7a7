//! Dedup (pipeline) artifacts.
//!
//! Pipeline artifacts are not stored as one archive. The build server hands
//! out a rehydration manifest instead: one command per line, mapping content
//! blobs to the file names they should be restored as.
//!
//! ```text
//! # comment
//! download 3F2A...01 "bin/Release/Microsoft.CodeAnalysis.dll"
//! download 9C41...7E bin/Release/Microsoft.CodeAnalysis.CSharp.dll
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::EntrySource;
use crate::{Error, Result};

const DOWNLOAD_COMMAND: &str = "download";

/// One manifest line that restores a blob to a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupFile {
	pub blob_id: String,
	pub local_name: String,
}

impl DedupFile {
	/// File name without directories.
	pub fn file_name(&self) -> &str {
		self.local_name.rsplit(['/', '\\']).next().unwrap_or(&self.local_name)
	}
}

/// A parsed rehydration manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupManifest {
	files: Vec<DedupFile>,
}

impl DedupManifest {
	pub fn parse(text: &str) -> Result<Self> {
		let mut files = Vec::new();
		for (number, line) in text.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let tokens = tokenize(line).ok_or_else(|| Error::InvalidOperation(format!("unterminated quote on manifest line {}", number + 1)))?;
			let Some((command, args)) = tokens.split_first() else {
				continue;
			};
			if !command.eq_ignore_ascii_case(DOWNLOAD_COMMAND) {
				debug!(line = number + 1, command = %command, "Skipping unknown manifest command");
				continue;
			}
			let [blob_id, local_name] = args else {
				return Err(Error::InvalidOperation(format!(
					"manifest line {} expects `download <blob-id> <local-name>`",
					number + 1
				)));
			};
			files.push(DedupFile {
				blob_id: blob_id.clone(),
				local_name: local_name.clone(),
			});
		}
		Ok(Self { files })
	}

	pub fn files(&self) -> &[DedupFile] {
		&self.files
	}

	/// Maps every requested file name (case-insensitive, directories ignored)
	/// to its manifest line.
	///
	/// The whole manifest is scanned before failing, so the error names every
	/// missing file at once.
	pub fn locate(&self, requested: &[&str]) -> Result<Vec<DedupFile>> {
		let mut found: BTreeMap<usize, DedupFile> = BTreeMap::new();
		for file in &self.files {
			if let Some(index) = requested.iter().position(|name| name.eq_ignore_ascii_case(file.file_name())) {
				found.entry(index).or_insert_with(|| file.clone());
			}
		}

		let missing: Vec<&str> = requested
			.iter()
			.enumerate()
			.filter(|(index, _)| !found.contains_key(index))
			.map(|(_, name)| *name)
			.collect();
		if !missing.is_empty() {
			return Err(Error::InvalidOperation(format!(
				"artifact manifest does not contain {}",
				missing.join(", ")
			)));
		}
		Ok(found.into_values().collect())
	}
}

/// Splits on whitespace, keeping double-quoted tokens intact.
fn tokenize(line: &str) -> Option<Vec<String>> {
	let mut tokens = Vec::new();
	let mut chars = line.chars().peekable();
	while let Some(&c) = chars.peek() {
		if c.is_whitespace() {
			chars.next();
			continue;
		}
		let mut token = String::new();
		if c == '"' {
			chars.next();
			loop {
				match chars.next()? {
					'"' => break,
					c => token.push(c),
				}
			}
		} else {
			while let Some(&c) = chars.peek() {
				if c.is_whitespace() {
					break;
				}
				token.push(c);
				chars.next();
			}
		}
		tokens.push(token);
	}
	Some(tokens)
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
	async fn fetch_blob(&self, blob_id: &str) -> Result<Bytes>;
}

/// Loose files from a dedup artifact, presented as entries under one folder.
///
/// Each located file appears as `<folder>/<file name>` so the same filters
/// that select binaries from a packed archive apply unchanged.
pub struct DedupArtifact {
	store: Arc<dyn BlobStore>,
	blobs: Vec<(String, String)>,
}

impl DedupArtifact {
	pub fn new(store: Arc<dyn BlobStore>, folder: &str, files: Vec<DedupFile>) -> Self {
		let folder = folder.trim_matches('/');
		let blobs = files
			.into_iter()
			.map(|file| (format!("{folder}/{}", file.file_name()), file.blob_id))
			.collect();
		Self { store, blobs }
	}
}

impl fmt::Debug for DedupArtifact {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DedupArtifact").field("blobs", &self.blobs).finish()
	}
}

#[async_trait]
impl EntrySource for DedupArtifact {
	fn entries(&self) -> Vec<String> {
		self.blobs.iter().map(|(path, _)| path.clone()).collect()
	}

	async fn read(&self, path: &str) -> Result<Bytes> {
		let (_, blob_id) = self
			.blobs
			.iter()
			.find(|(entry, _)| entry == path)
			.ok_or_else(|| Error::NotFound(format!("entry {path} not found in artifact")))?;
		self.store.fetch_blob(blob_id).await
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	const MANIFEST: &str = r#"
# rehydration manifest
download AAA1 "bin/Release/net9.0/Microsoft.CodeAnalysis.dll"
download BBB2 bin/Release/net9.0/microsoft.codeanalysis.csharp.dll

checksum CCC3 bin/Release/net9.0/Microsoft.CodeAnalysis.dll
download DDD4 "bin/Release/net9.0/with space/readme.txt"
"#;

	#[test]
	fn parses_commands_comments_and_quotes() {
		let manifest = DedupManifest::parse(MANIFEST).unwrap();
		assert_eq!(
			manifest.files(),
			&[
				DedupFile {
					blob_id: "AAA1".into(),
					local_name: "bin/Release/net9.0/Microsoft.CodeAnalysis.dll".into(),
				},
				DedupFile {
					blob_id: "BBB2".into(),
					local_name: "bin/Release/net9.0/microsoft.codeanalysis.csharp.dll".into(),
				},
				DedupFile {
					blob_id: "DDD4".into(),
					local_name: "bin/Release/net9.0/with space/readme.txt".into(),
				},
			]
		);
	}

	#[test]
	fn malformed_lines_are_rejected() {
		assert!(DedupManifest::parse("download only-one-arg").is_err());
		assert!(DedupManifest::parse("download AAA \"unterminated").is_err());
	}

	#[test]
	fn locate_matches_file_names_case_insensitively() {
		let manifest = DedupManifest::parse(MANIFEST).unwrap();
		let found = manifest
			.locate(&["Microsoft.CodeAnalysis.dll", "Microsoft.CodeAnalysis.CSharp.dll"])
			.unwrap();
		let ids: Vec<&str> = found.iter().map(|file| file.blob_id.as_str()).collect();
		assert_eq!(ids, vec!["AAA1", "BBB2"]);
	}

	#[test]
	fn locate_names_every_missing_file() {
		let manifest = DedupManifest::parse(MANIFEST).unwrap();
		let error = manifest
			.locate(&["Microsoft.CodeAnalysis.dll", "A.dll", "B.dll"])
			.unwrap_err();
		assert_eq!(error, Error::InvalidOperation("artifact manifest does not contain A.dll, B.dll".into()));
	}

	struct Blobs;

	#[async_trait]
	impl BlobStore for Blobs {
		async fn fetch_blob(&self, blob_id: &str) -> Result<Bytes> {
			Ok(Bytes::from(blob_id.as_bytes().to_vec()))
		}
	}

	#[tokio::test]
	async fn artifact_exposes_files_under_package_folder() {
		let manifest = DedupManifest::parse(MANIFEST).unwrap();
		let files = manifest.locate(&["Microsoft.CodeAnalysis.dll"]).unwrap();
		let artifact = DedupArtifact::new(Arc::new(Blobs), "tasks/netcore/bincore/", files);

		assert_eq!(artifact.entries(), vec!["tasks/netcore/bincore/Microsoft.CodeAnalysis.dll".to_string()]);
		let bytes = artifact.read("tasks/netcore/bincore/Microsoft.CodeAnalysis.dll").await.unwrap();
		assert_eq!(bytes.as_ref(), b"AAA1");
		assert!(artifact.read("tasks/netcore/bincore/missing.dll").await.is_err());
	}
}
