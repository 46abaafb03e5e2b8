//! Minimal stateless HTTP call helper: one POST per call.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use url::Url;

use xrpc_core::{params_from, Frame};

use crate::error::HttpError;

/// A JSON-RPC client over plain HTTP.
///
/// Each call POSTs one request frame and decodes one response frame. The
/// shell answers RPC-level failures with status 500 but the body is still
/// a JSON-RPC response, so the frame is decoded regardless of status.
pub struct HttpClient {
    client: reqwest::Client,
    endpoint: Url,
    id_counter: AtomicI64,
}

impl HttpClient {
    pub fn new(endpoint: &str) -> Result<Self, HttpError> {
        let endpoint = Url::parse(endpoint)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            id_counter: AtomicI64::new(0),
        })
    }

    /// Call `method` with positional `params` and await the result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, HttpError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Frame::request(Some(id), method, params_from(params));

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&frame)
            .send()
            .await?;
        let reply: Frame = serde_json::from_slice(&response.bytes().await?)?;

        if let Some(error) = reply.error {
            return Err(HttpError::Rpc(error));
        }
        match reply.result {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Ok(Value::Null),
        }
    }

    /// Fire a notification; the response body (if any) is discarded.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), HttpError> {
        let frame = Frame::request(None, method, params_from(params));
        self.client
            .post(self.endpoint.clone())
            .json(&frame)
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_endpoint() {
        assert!(HttpClient::new("not a url").is_err());
    }

    #[test]
    fn test_accepts_http_endpoint() {
        assert!(HttpClient::new("http://127.0.0.1:8000/rpc").is_ok());
    }
}
