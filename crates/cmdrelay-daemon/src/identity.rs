//! Backend identity lookups on behalf of a session.

use std::time::Duration;

use async_trait::async_trait;
use cmdrelay_core::{HttpIdentityClient, Identity, IdentityClient, IdentityError, SessionCredential};

/// Fetches the identity document for a given credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Looks up the identity behind `credential`.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Unauthenticated`] when the backend rejects the
    /// credential; other variants on any other failure.
    async fn identity(&self, credential: &SessionCredential) -> Result<Identity, IdentityError>;
}

/// [`IdentityProvider`] that calls the backend identity endpoint with the
/// session's bearer token.
#[derive(Clone)]
pub struct BackendIdentityProvider {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl BackendIdentityProvider {
    /// Creates a provider for the identity endpoint at `url`.
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl IdentityProvider for BackendIdentityProvider {
    async fn identity(&self, credential: &SessionCredential) -> Result<Identity, IdentityError> {
        HttpIdentityClient::new(self.http.clone(), self.url.clone())
            .with_bearer(credential.clone())
            .with_timeout(self.timeout)
            .fetch_identity()
            .await
    }
}
