//! Real network access through `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use reqwest::Client;
use tracing::debug;

use crate::cache::{FetchRequest, FetchResponse, Network, NetworkError};

use super::error::InfraError;

const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

pub struct HttpNetwork {
    client: Client,
    timeout: Duration,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::configuration(format!("failed to build http client: {err}")))?;
        Ok(Self { client, timeout })
    }

    pub fn user_agent() -> &'static str {
        concat!("fetchward/", env!("CARGO_PKG_VERSION"))
    }

    fn map_error(&self, err: reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::Timeout(self.timeout)
        } else {
            NetworkError::transport(err.to_string())
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|err| self.map_error(err))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(|err| self.map_error(err))?;

        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Upstream responded");
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn strips_hop_by_hop_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(HttpNetwork::user_agent().starts_with("fetchward/"));
    }
}
