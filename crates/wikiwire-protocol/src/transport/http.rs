//! reqwest-backed transport

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::trace;
use url::Url;

use super::{HttpConfig, RawResponse, Transport, ensure_crypto_provider};
use crate::error::Result;
use crate::request::{HttpMethod, WireRequest};

/// HTTP transport with a per-session cookie jar.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str, user_agent: &str, config: &HttpConfig) -> Result<Self> {
        ensure_crypto_provider();
        let endpoint = Url::parse(endpoint)?;

        let mut builder = ClientBuilder::new()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::limited(5));

        if config.enable_compression {
            builder = builder.gzip(true).brotli(true).deflate(true);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn get_url(&self, request: &WireRequest) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().extend_pairs(request.params());
        url
    }

    fn form_body(request: &WireRequest) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(request.params())
            .finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WireRequest) -> Result<RawResponse> {
        let builder = match request.method() {
            HttpMethod::Get => self.client.get(self.get_url(request)),
            HttpMethod::Post => self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Self::form_body(request)),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.bytes().await?;

        trace!(
            "{} {} -> {status} ({} bytes)",
            request.method(),
            request.module_label(),
            body.len()
        );

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::RequestClass;

    fn request(method: HttpMethod) -> WireRequest {
        let mut request = WireRequest::new(method, RequestClass::Read);
        request.set("action", "query");
        request.set("titles", "A&B|C D");
        request.set("token", "abc+\\");
        request
    }

    #[test]
    fn test_get_url_encodes_params() {
        let transport =
            HttpTransport::new("https://wiki.example.org/w/api.php", "test", &HttpConfig::default())
                .unwrap();
        let url = transport.get_url(&request(HttpMethod::Get));
        assert_eq!(url.path(), "/w/api.php");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("titles".to_string(), "A&B|C D".to_string())));
        assert_eq!(pairs.last().map(|(k, _)| k.as_str()), Some("token"));
    }

    #[test]
    fn test_form_body_puts_token_last() {
        let body = HttpTransport::form_body(&request(HttpMethod::Post));
        assert!(body.starts_with("action=query"));
        assert!(body.ends_with("token=abc%2B%5C"));
    }
}
