use crate::error::TransferError;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

/// The HTTP request a task replays on every (re)start.
///
/// It is persisted as JSON in the `request` column so a restored task can
/// resume without the caller rebuilding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> TransferRequestBuilder {
        TransferRequestBuilder {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Builds a `reqwest` request, appending `extra` headers after the stored ones.
    pub fn to_reqwest(
        &self,
        client: &Client,
        extra: &[(&str, String)],
    ) -> Result<RequestBuilder, TransferError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| TransferError::Argument(format!("invalid method {}", self.method)))?;
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::Argument(format!(
                "unsupported scheme in {}",
                self.url
            )));
        }

        let mut builder = client.request(method, url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in extra {
            builder = builder.header(*name, value.as_str());
        }
        Ok(builder)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub struct TransferRequestBuilder {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
}

impl TransferRequestBuilder {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> TransferRequest {
        TransferRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
        }
    }
}
