//! Sequenced API request client.
//!
//! Every command travels as a one-element JSON array to
//! `{base_url}?id={sn}[&sid={sid}]`. The sequence number is seeded with
//! 32 random bits and advances on every attempt, retried or not. The
//! HTTP layer itself is behind the [`Transport`] trait so tests can
//! script the server side.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::crypto;
use crate::error::{error_from_code, Error};

/// Minimal HTTP capability the core consumes: post a JSON body, fetch a
/// chunk range, push a chunk body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body and return the response body.
    async fn post_json(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, Error>;

    /// GET a chunk url (the byte range is part of the url).
    async fn get_chunk(&self, url: &str) -> Result<Vec<u8>, Error>;

    /// POST a ciphertext chunk and return the response body.
    async fn post_chunk(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Production [`Transport`] over a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn read_body(resp: reqwest::Response) -> Result<Vec<u8>, Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Network(format!("http status {}", status)));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("body read failed: {}", e)))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| Error::Network(format!("request failed: {}", e)))?;
        Self::read_body(resp).await
    }

    async fn get_chunk(&self, url: &str) -> Result<Vec<u8>, Error> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("chunk fetch failed: {}", e)))?;
        Self::read_body(resp).await
    }

    async fn post_chunk(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let resp = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("chunk post failed: {}", e)))?;
        Self::read_body(resp).await
    }
}

/// Sequenced command client carrying the session id.
pub(crate) struct ApiClient {
    transport: std::sync::Arc<dyn Transport>,
    base_url: String,
    retries: u32,
    sn: u64,
    sid: Option<String>,
}

impl ApiClient {
    pub fn new(transport: std::sync::Arc<dyn Transport>, base_url: String, retries: u32) -> Self {
        Self {
            transport,
            base_url,
            retries,
            sn: crypto::random_u32() as u64,
            sid: None,
        }
    }

    /// Attach the base64url-encoded session id to subsequent requests.
    pub fn set_session(&mut self, sid: String) {
        self.sid = Some(sid);
    }

    #[cfg(test)]
    pub fn sequence(&self) -> u64 {
        self.sn
    }

    fn url(&self) -> String {
        match &self.sid {
            Some(sid) => format!("{}?id={}&sid={}", self.base_url, self.sn, sid),
            None => format!("{}?id={}", self.base_url, self.sn),
        }
    }

    /// Send a command, retrying on transport failure and on the server's
    /// "try again" code. Each attempt consumes a sequence number.
    pub async fn request<C, R>(&mut self, cmd: &C) -> Result<R, Error>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(&[cmd])
            .map_err(|e| Error::BadArgs(format!("command serialization failed: {}", e)))?;

        let mut last_err = Error::Network("no attempts made".into());
        for attempt in 0..=self.retries {
            let url = self.url();
            self.sn += 1;

            match self.transport.post_json(&url, &body).await {
                Err(e) if e.is_transient() => {
                    debug!(target: "mega::api", "attempt {} transport error: {}", attempt + 1, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
                Ok(buf) => match parse_response::<R>(&buf) {
                    Err(Error::Eagain) => {
                        debug!(target: "mega::api", "attempt {} got EAGAIN", attempt + 1);
                        last_err = Error::Eagain;
                    }
                    other => return other,
                },
            }
        }
        Err(last_err)
    }
}

/// Parse a response body: a one-element array of the expected object, a
/// scalar error code, or a one-element array of an error code.
fn parse_response<R: DeserializeOwned>(buf: &[u8]) -> Result<R, Error> {
    let value: serde_json::Value = serde_json::from_slice(buf)
        .map_err(|_| Error::BadResp(format!("not JSON: {}", String::from_utf8_lossy(buf))))?;

    let first = match value {
        serde_json::Value::Number(n) => serde_json::Value::Number(n),
        serde_json::Value::Array(arr) => arr
            .into_iter()
            .next()
            .ok_or_else(|| Error::BadResp("empty response array".into()))?,
        other => {
            return Err(Error::BadResp(format!("unexpected response shape: {}", other)));
        }
    };

    if let Some(code) = first.as_i64() {
        if code < 0 {
            return Err(error_from_code(code));
        }
    }

    serde_json::from_value(first).map_err(|e| Error::BadResp(format!("decode failed: {}", e)))
}
