//! CLI command implementations.

pub mod permissions;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use cmdrelay_core::{HttpIdentityClient, PermissionCache, SessionCredential};

/// Timeout for establishing a connection to the relay.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A relay endpoint plus the session presented to it.
pub struct RelayTarget {
    http: reqwest::Client,
    base_url: String,
    cookie_name: String,
    credential: Option<SessionCredential>,
}

impl RelayTarget {
    /// Creates a target for the relay at `base_url`.
    pub fn new(
        base_url: &str,
        cookie_name: &str,
        credential: Option<SessionCredential>,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookie_name: cookie_name.to_string(),
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `Cookie` header value for the session, if there is one.
    fn cookie(&self) -> Option<String> {
        self.credential
            .as_ref()
            .map(|credential| format!("{}={}", self.cookie_name, credential.expose()))
    }

    /// A permission cache reading identity through the relay.
    fn permission_cache(&self) -> PermissionCache {
        let client = HttpIdentityClient::new(self.http.clone(), self.url("/api/auth/me"));
        let client = match &self.credential {
            Some(credential) => client.with_cookie(&self.cookie_name, credential),
            None => client,
        };
        PermissionCache::new(Arc::new(client))
    }
}

#[cfg(test)]
pub(crate) mod test_relay {
    //! Loopback stand-in for the relay's client-facing routes.

    use std::convert::Infallible;
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use futures::stream;

    use super::RelayTarget;

    pub const STREAM: [&str; 2] = ["data: {\"order\":1}\n\n", "data: {\"order\":2}\n\n"];

    fn session(headers: &HeaderMap) -> &str {
        headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("auth_token="))
            .unwrap_or_default()
    }

    async fn me(headers: HeaderMap) -> Response {
        match session(&headers) {
            "good" => (
                StatusCode::OK,
                [("content-type", "application/json")],
                r#"{"permissions":["stock:create","orders:read"],"user":{"name":"ana"}}"#,
            )
                .into_response(),
            "broken" => StatusCode::BAD_GATEWAY.into_response(),
            _ => (StatusCode::UNAUTHORIZED, r#"{"error":"Unauthorized"}"#).into_response(),
        }
    }

    async fn commands(Path(area): Path<String>, headers: HeaderMap) -> Response {
        if session(&headers) != "good" {
            return (StatusCode::UNAUTHORIZED, r#"{"error":"Unauthorized"}"#).into_response();
        }
        if area != "grill" {
            return (StatusCode::NOT_FOUND, r#"{"error":"Unknown area"}"#).into_response();
        }
        let chunks = stream::iter(STREAM.map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))));
        (
            [("content-type", "text/event-stream")],
            Body::from_stream(chunks),
        )
            .into_response()
    }

    pub async fn spawn() -> SocketAddr {
        let app = Router::new()
            .route("/api/auth/me", get(me))
            .route("/sse/commands/{area}", get(commands));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    pub fn target(addr: SocketAddr, token: Option<&str>) -> RelayTarget {
        RelayTarget::new(
            &format!("http://{addr}/"),
            "auth_token",
            token.and_then(cmdrelay_core::SessionCredential::new),
        )
        .unwrap()
    }
}
