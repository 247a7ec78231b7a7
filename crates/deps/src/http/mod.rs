//! HTTP access behind a narrow trait.
//!
//! Everything that talks to feeds, build servers or blob stores goes through
//! [`HttpClient`]. [`DecoratedClient`] applies [`RequestDecorator`]s to every
//! request URL; [`CorsProxyDecorator`] is the one shipped decorator and only
//! touches package archive downloads.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{Error, Result};

mod reqwest_client;

pub use reqwest_client::ReqwestClient;

/// Minimal asynchronous HTTP GET surface.
#[async_trait]
pub trait HttpClient: Send + Sync {
	/// Downloads the full body.
	async fn get(&self, url: &Url) -> Result<Bytes>;

	/// Downloads `range` of the body. Servers that ignore the `Range` header
	/// produce an error rather than a full body.
	async fn get_range(&self, url: &Url, range: Range<u64>) -> Result<Bytes>;

	/// Returns the body length advertised by the server, if any.
	async fn content_length(&self, url: &Url) -> Result<Option<u64>>;
}

/// Downloads and decodes a JSON document.
pub async fn get_json<T: DeserializeOwned>(client: &dyn HttpClient, url: &Url) -> Result<T> {
	let body = client.get(url).await?;
	serde_json::from_slice(&body).map_err(|e| Error::Json {
		url: url.to_string(),
		message: e.to_string(),
	})
}

/// Like [`get_json`], but maps a 404 to `None`.
pub async fn get_json_opt<T: DeserializeOwned>(client: &dyn HttpClient, url: &Url) -> Result<Option<T>> {
	match get_json(client, url).await {
		Ok(value) => Ok(Some(value)),
		Err(error) if error.is_not_found_status() => Ok(None),
		Err(error) => Err(error),
	}
}

/// Rewrites request URLs before they are sent.
pub trait RequestDecorator: Send + Sync {
	fn decorate(&self, url: &Url) -> Url;
}

/// Routes package archive downloads through a CORS proxy.
///
/// Only URLs whose path ends in `.nupkg` are rewritten to
/// `<proxy><original url>`; JSON API calls go direct.
#[derive(Debug, Clone)]
pub struct CorsProxyDecorator {
	proxy: Url,
}

impl CorsProxyDecorator {
	pub const ARCHIVE_SUFFIX: &'static str = ".nupkg";

	pub fn new(proxy: Url) -> Self {
		Self { proxy }
	}
}

impl RequestDecorator for CorsProxyDecorator {
	fn decorate(&self, url: &Url) -> Url {
		if !url.path().to_ascii_lowercase().ends_with(Self::ARCHIVE_SUFFIX) {
			return url.clone();
		}
		let rewritten = format!("{}{}", self.proxy, url);
		Url::parse(&rewritten).unwrap_or_else(|_| url.clone())
	}
}

/// An [`HttpClient`] that runs every URL through a decorator chain.
pub struct DecoratedClient {
	inner: Arc<dyn HttpClient>,
	decorators: Vec<Arc<dyn RequestDecorator>>,
}

impl DecoratedClient {
	pub fn new(inner: Arc<dyn HttpClient>) -> Self {
		Self {
			inner,
			decorators: Vec::new(),
		}
	}

	pub fn with(mut self, decorator: Arc<dyn RequestDecorator>) -> Self {
		self.decorators.push(decorator);
		self
	}

	fn decorate(&self, url: &Url) -> Url {
		self.decorators.iter().fold(url.clone(), |url, decorator| decorator.decorate(&url))
	}
}

#[async_trait]
impl HttpClient for DecoratedClient {
	async fn get(&self, url: &Url) -> Result<Bytes> {
		self.inner.get(&self.decorate(url)).await
	}

	async fn get_range(&self, url: &Url, range: Range<u64>) -> Result<Bytes> {
		self.inner.get_range(&self.decorate(url), range).await
	}

	async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
		self.inner.content_length(&self.decorate(url)).await
	}
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;
	use pretty_assertions::assert_eq;

	use super::*;

	#[derive(Default)]
	struct Recorder {
		seen: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl HttpClient for Recorder {
		async fn get(&self, url: &Url) -> Result<Bytes> {
			self.seen.lock().push(url.to_string());
			Ok(Bytes::from_static(b"{\"ok\":true}"))
		}

		async fn get_range(&self, url: &Url, _range: Range<u64>) -> Result<Bytes> {
			self.seen.lock().push(url.to_string());
			Ok(Bytes::new())
		}

		async fn content_length(&self, _url: &Url) -> Result<Option<u64>> {
			Ok(None)
		}
	}

	#[tokio::test]
	async fn cors_proxy_only_rewrites_archive_downloads() {
		let recorder = Arc::new(Recorder::default());
		let proxy = Url::parse("https://proxy.example/?url=").unwrap();
		let client = DecoratedClient::new(recorder.clone()).with(Arc::new(CorsProxyDecorator::new(proxy)));

		let api = Url::parse("https://api.nuget.org/v3/index.json").unwrap();
		let archive = Url::parse("https://api.nuget.org/v3-flatcontainer/a/1.0.0/a.1.0.0.nupkg").unwrap();
		let _: serde_json::Value = get_json(&client, &api).await.unwrap();
		client.get(&archive).await.unwrap();

		assert_eq!(
			recorder.seen.lock().clone(),
			vec![
				"https://api.nuget.org/v3/index.json".to_string(),
				"https://proxy.example/?url=https://api.nuget.org/v3-flatcontainer/a/1.0.0/a.1.0.0.nupkg".to_string(),
			]
		);
	}
}
