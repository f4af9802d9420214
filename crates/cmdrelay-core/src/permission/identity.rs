//! Identity endpoint client.
//!
//! The identity endpoint is the backend's session-scoped "who am I"
//! resource. On success it returns a JSON object with at least a
//! `permissions` array; on 401 the caller has no session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, COOKIE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::SessionCredential;

/// Default timeout for one identity fetch.
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Body returned by the identity endpoint.
///
/// Fields other than `permissions` are preserved verbatim in `profile` so
/// that a proxy can pass the document through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Permission strings granted to the session.
    pub permissions: Vec<String>,

    /// Remaining fields of the identity document.
    #[serde(flatten)]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

/// Errors from an identity fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The endpoint answered 401: there is no valid session.
    #[error("identity endpoint rejected the session")]
    Unauthenticated,

    /// The endpoint answered with another non-success status.
    #[error("identity endpoint returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be sent or the response could not be read.
    #[error("identity transport error: {0}")]
    Transport(String),

    /// The response body is not a valid identity document.
    #[error("identity response could not be decoded: {0}")]
    Decode(String),
}

/// Fetches the identity of one logical session.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Performs one identity fetch.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unauthenticated`] on 401 and the other
    /// variants for every other failure.
    async fn fetch_identity(&self) -> Result<Identity, IdentityError>;
}

#[derive(Clone)]
enum IdentityAuth {
    Anonymous,
    Bearer(SessionCredential),
    Cookie(SecretString),
}

/// [`IdentityClient`] over HTTP.
///
/// A browser reaches the identity endpoint through the relay, presenting
/// its session cookie; the relay reaches the backend directly with a bearer
/// token. Both are expressed with the `with_*` constructors.
#[derive(Clone)]
pub struct HttpIdentityClient {
    http: reqwest::Client,
    url: String,
    auth: IdentityAuth,
    timeout: Duration,
}

impl HttpIdentityClient {
    /// Creates an anonymous client for `url`.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            auth: IdentityAuth::Anonymous,
            timeout: DEFAULT_IDENTITY_TIMEOUT,
        }
    }

    /// Presents `credential` as a bearer token.
    #[must_use]
    pub fn with_bearer(mut self, credential: SessionCredential) -> Self {
        self.auth = IdentityAuth::Bearer(credential);
        self
    }

    /// Presents `credential` as the session cookie `cookie_name`.
    #[must_use]
    pub fn with_cookie(mut self, cookie_name: &str, credential: &SessionCredential) -> Self {
        self.auth = IdentityAuth::Cookie(SecretString::from(format!(
            "{cookie_name}={}",
            credential.expose()
        )));
        self
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The endpoint this client queries.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn fetch_identity(&self) -> Result<Identity, IdentityError> {
        let mut request = self
            .http
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout);

        request = match &self.auth {
            IdentityAuth::Anonymous => request,
            IdentityAuth::Bearer(credential) => request.header(AUTHORIZATION, credential.bearer()),
            IdentityAuth::Cookie(cookie) => request.header(COOKIE, cookie.expose_secret()),
        };

        let response = request
            .send()
            .await
            .map_err(|error| IdentityError::Transport(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(IdentityError::Unauthenticated);
        }
        if !status.is_success() {
            return Err(IdentityError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| IdentityError::Transport(error.to_string()))?;
        serde_json::from_slice(&body).map_err(|error| IdentityError::Decode(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;

    use super::*;

    async fn identity_handler(headers: HeaderMap) -> (AxumStatus, String) {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if bearer == "Bearer good" || cookie == "auth_token=good" {
            (
                AxumStatus::OK,
                r#"{"permissions":["stock:create"],"user":{"name":"ana"}}"#.to_string(),
            )
        } else if bearer == "Bearer broken" {
            (AxumStatus::OK, "not json".to_string())
        } else if bearer == "Bearer flaky" {
            (AxumStatus::BAD_GATEWAY, String::new())
        } else {
            (AxumStatus::UNAUTHORIZED, r#"{"error":"expired"}"#.to_string())
        }
    }

    async fn spawn_identity_server() -> SocketAddr {
        let app = Router::new().route("/auth/me", get(identity_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> HttpIdentityClient {
        HttpIdentityClient::new(reqwest::Client::new(), format!("http://{addr}/auth/me"))
    }

    fn credential(token: &str) -> SessionCredential {
        SessionCredential::new(token).unwrap()
    }

    #[tokio::test]
    async fn bearer_success_preserves_profile() {
        let addr = spawn_identity_server().await;
        let identity = client(addr)
            .with_bearer(credential("good"))
            .fetch_identity()
            .await
            .unwrap();
        assert_eq!(identity.permissions, vec!["stock:create".to_string()]);
        assert_eq!(identity.profile["user"]["name"], "ana");
    }

    #[tokio::test]
    async fn cookie_success() {
        let addr = spawn_identity_server().await;
        let identity = client(addr)
            .with_cookie("auth_token", &credential("good"))
            .fetch_identity()
            .await
            .unwrap();
        assert_eq!(identity.permissions.len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_unauthenticated() {
        let addr = spawn_identity_server().await;
        let result = client(addr).fetch_identity().await;
        assert_eq!(result, Err(IdentityError::Unauthenticated));
    }

    #[tokio::test]
    async fn other_status_and_bad_body_are_errors() {
        let addr = spawn_identity_server().await;
        let status = client(addr)
            .with_bearer(credential("flaky"))
            .fetch_identity()
            .await;
        assert_eq!(status, Err(IdentityError::Status { status: 502 }));

        let decode = client(addr)
            .with_bearer(credential("broken"))
            .fetch_identity()
            .await;
        assert!(matches!(decode, Err(IdentityError::Decode(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = client(addr).fetch_identity().await;
        assert!(matches!(result, Err(IdentityError::Transport(_))));
    }
}
