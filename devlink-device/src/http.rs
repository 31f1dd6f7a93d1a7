//! HTTPS client used for the authorization server, config document and
//! firmware downloads

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::TransportError;

/// Response with a streaming body
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body
    pub async fn bytes(mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, crate::error::AuthError> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST an `application/x-www-form-urlencoded` body
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse, TransportError>;

    /// GET, optionally asking for `bytes=<offset>-`
    async fn get(&self, url: &str, range_from: Option<u64>, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// [`HttpClient`] backed by reqwest with rustls
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for ReqwestClient {
    /// Default client with a timeout of 30 seconds.
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), timeout }
    }

    fn wrap(resp: reqwest::Response) -> HttpResponse {
        HttpResponse {
            status: resp.status().as_u16(),
            content_length: resp.content_length(),
            body: resp
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(TransportError::Http))
                .boxed(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        if url.is_empty() {
            return Err(TransportError::EmptyUrl);
        }
        let resp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .form(form)
            .send()
            .await
            .map_err(|e| timeout_or(e, url, self.timeout))?;
        Ok(Self::wrap(resp))
    }

    async fn get(&self, url: &str, range_from: Option<u64>, timeout: Duration) -> Result<HttpResponse, TransportError> {
        if url.is_empty() {
            return Err(TransportError::EmptyUrl);
        }
        let mut req = self.client.get(url).timeout(timeout);
        if let Some(offset) = range_from {
            req = req.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let resp = req.send().await.map_err(|e| timeout_or(e, url, timeout))?;
        Ok(Self::wrap(resp))
    }
}

fn timeout_or(e: reqwest::Error, url: &str, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout { url: url.to_string(), timeout }
    } else {
        TransportError::Http(e)
    }
}
