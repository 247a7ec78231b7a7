//! [`HttpClient`] backed by `reqwest`.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use tracing::trace;
use url::Url;

use super::HttpClient;
use crate::{Error, Result};

/// Shared `reqwest` client with a fixed user agent and request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
	client: Client,
	user_agent: String,
}

impl ReqwestClient {
	pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Result<Self> {
		let client = Client::builder().timeout(timeout).build().map_err(|e| Error::Http {
			url: String::new(),
			message: e.to_string(),
		})?;
		Ok(Self {
			client,
			user_agent: user_agent.into(),
		})
	}

	async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Response> {
		let response = request
			.header(USER_AGENT, &self.user_agent)
			.send()
			.await
			.map_err(|e| Error::Http {
				url: url.to_string(),
				message: e.to_string(),
			})?;

		let status = response.status();
		trace!(url = %url, status = status.as_u16(), "HTTP response");
		if !status.is_success() {
			return Err(Error::Status {
				url: url.to_string(),
				status: status.as_u16(),
			});
		}
		Ok(response)
	}

	async fn body(response: Response, url: &Url) -> Result<Bytes> {
		response.bytes().await.map_err(|e| Error::Http {
			url: url.to_string(),
			message: e.to_string(),
		})
	}
}

#[async_trait]
impl HttpClient for ReqwestClient {
	async fn get(&self, url: &Url) -> Result<Bytes> {
		let response = self.send(self.client.get(url.clone()), url).await?;
		Self::body(response, url).await
	}

	async fn get_range(&self, url: &Url, range: Range<u64>) -> Result<Bytes> {
		if range.is_empty() {
			return Ok(Bytes::new());
		}
		let header = format!("bytes={}-{}", range.start, range.end - 1);
		let response = self.send(self.client.get(url.clone()).header(RANGE, header), url).await?;
		if response.status() != StatusCode::PARTIAL_CONTENT {
			return Err(Error::Http {
				url: url.to_string(),
				message: format!("range request answered with status {}", response.status()),
			});
		}
		let body = Self::body(response, url).await?;
		if body.len() as u64 != range.end - range.start {
			return Err(Error::Http {
				url: url.to_string(),
				message: format!("range request returned {} bytes, expected {}", body.len(), range.end - range.start),
			});
		}
		Ok(body)
	}

	async fn content_length(&self, url: &Url) -> Result<Option<u64>> {
		let response = self.send(self.client.head(url.clone()), url).await?;
		Ok(response
			.headers()
			.get(CONTENT_LENGTH)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.parse().ok()))
	}
}
