//! HTTP implementation of the lock service transport

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;

use super::push::SseParser;
use super::{
    AcquireResponse, HeartbeatResponse, LockApi, PendingRequest, PushStream, ReleaseResponse,
    RequestAccessResponse, ResourceKey, RespondResponse, StatusResponse,
};

/// HTTP client for the lock service
///
/// All request/response operations are JSON `POST`s under the configured
/// base URL; `subscribe` opens a Server-Sent Events stream.
#[derive(Clone)]
pub struct HttpLockApi {
    http_client: HttpClient,
    base_url: String,
}

impl std::fmt::Debug for HttpLockApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLockApi")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Builder for creating an HttpLockApi
pub struct HttpLockApiBuilder {
    config: HttpConfig,
    client: Option<HttpClient>,
}

impl HttpLockApiBuilder {
    /// Create a builder for the given transport configuration
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Use a pre-built reqwest client instead of constructing one
    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the HttpLockApi
    pub fn build(self) -> Result<HttpLockApi> {
        let http_client = match self.client {
            Some(c) => c,
            None => HttpClient::builder()
                .timeout(self.config.request_timeout)
                .build()
                .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?,
        };

        Ok(HttpLockApi {
            http_client,
            base_url: self.config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct IdentityBody<'a> {
    resource_key: &'a str,
    client_id: &'a str,
    tab_id: &'a str,
}

#[derive(Serialize)]
struct AcquireBody<'a> {
    resource_key: &'a str,
    client_id: &'a str,
    tab_id: &'a str,
    display_name: &'a str,
    ttl_secs: u64,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    resource_key: &'a str,
    client_id: &'a str,
    tab_id: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    resource_key: &'a str,
    client_id: &'a str,
    tab_id: &'a str,
    display_name: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct RespondBody<'a> {
    request_id: Uuid,
    client_id: &'a str,
    tab_id: &'a str,
    granted: bool,
}

impl HttpLockApi {
    /// Create a client from a transport configuration
    pub fn new(config: HttpConfig) -> Result<Self> {
        HttpLockApiBuilder::new(config).build()
    }

    /// Create a builder
    pub fn builder(config: HttpConfig) -> HttpLockApiBuilder {
        HttpLockApiBuilder::new(config)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(Error::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_error_status(status, &text));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("malformed {} response: {}", path, e)))
    }
}

/// Map an HTTP error status onto the lock error taxonomy
fn map_error_status(status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 | 403 | 409 | 410 => Error::TokenInvalid(format!("{}: {}", status, body)),
        400 | 404 | 422 => Error::Protocol(format!("{}: {}", status, body)),
        _ => Error::Network(format!("{}: {}", status, body)),
    }
}

#[async_trait]
impl LockApi for HttpLockApi {
    async fn status(&self, key: &ResourceKey, identity: &Identity) -> Result<StatusResponse> {
        self.post_json(
            "status",
            &IdentityBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
            },
        )
        .await
    }

    async fn acquire(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse> {
        debug!(resource_key = %key, ttl_secs = ttl.as_secs(), "Requesting lock acquire");
        self.post_json(
            "acquire",
            &AcquireBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                display_name,
                ttl_secs: ttl.as_secs(),
            },
        )
        .await
    }

    async fn steal(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        ttl: Duration,
    ) -> Result<AcquireResponse> {
        debug!(resource_key = %key, "Requesting lock steal");
        self.post_json(
            "steal",
            &AcquireBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                display_name,
                ttl_secs: ttl.as_secs(),
            },
        )
        .await
    }

    async fn release(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<ReleaseResponse> {
        self.post_json(
            "release",
            &TokenBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                token,
            },
        )
        .await
    }

    async fn heartbeat(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        token: &str,
    ) -> Result<HeartbeatResponse> {
        self.post_json(
            "heartbeat",
            &TokenBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                token,
            },
        )
        .await
    }

    async fn subscribe(&self, key: &ResourceKey, identity: &Identity) -> Result<PushStream> {
        let response = self
            .http_client
            .get(self.url("subscribe"))
            .query(&[
                ("resource_key", key.as_str()),
                ("client_id", identity.client_id.as_str()),
                ("tab_id", identity.tab_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("{}: {}", status, text)));
        }

        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut parser = SseParser::new();

            while let Some(chunk_result) = bytes_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(newline_pos) = buffer.find('\n') {
                            let line = buffer[..newline_pos].to_string();
                            buffer = buffer[newline_pos + 1..].to_string();

                            if let Some(event) = parser.push_line(&line) {
                                yield event;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Channel(e.to_string()));
                        break;
                    }
                }
            }

            // A final event may lack the trailing blank line.
            if let Some(event) = parser.finish() {
                yield event;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn request_access(
        &self,
        key: &ResourceKey,
        identity: &Identity,
        display_name: &str,
        message: &str,
    ) -> Result<RequestAccessResponse> {
        self.post_json(
            "request",
            &RequestBody {
                resource_key: key.as_str(),
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                display_name,
                message,
            },
        )
        .await
    }

    async fn respond(
        &self,
        request_id: Uuid,
        identity: &Identity,
        granted: bool,
    ) -> Result<RespondResponse> {
        self.post_json(
            "respond",
            &RespondBody {
                request_id,
                client_id: &identity.client_id,
                tab_id: &identity.tab_id,
                granted,
            },
        )
        .await
    }

    async fn pending_requests(&self, key: &ResourceKey) -> Result<Vec<PendingRequest>> {
        #[derive(Serialize)]
        struct KeyBody<'a> {
            resource_key: &'a str,
        }
        self.post_json(
            "pending_requests",
            &KeyBody {
                resource_key: key.as_str(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpLockApi::new(HttpConfig::new("https://locks.example.com/api/"))
            .expect("build client");
        assert_eq!(api.url("status"), "https://locks.example.com/api/status");
    }

    #[test]
    fn test_error_status_mapping() {
        let conflictish = map_error_status(reqwest::StatusCode::CONFLICT, "token mismatch");
        assert!(matches!(conflictish, Error::TokenInvalid(_)));

        let malformed = map_error_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad body");
        assert!(matches!(malformed, Error::Protocol(_)));

        let outage = map_error_status(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(outage, Error::Network(_)));
    }
}
