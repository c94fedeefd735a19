//! Identity exchange: provider credential in, issued credentials out.
//!
//! Only sign-in flows call this; the refresh coordinator never does.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::session::{IssuedCredentials, Principal};
use crate::api::error::truncate_body;
use crate::error::{SessionError, SessionResult};

const DEV_ACCESS_TOKEN: &str = "dev-access-token";
const DEV_REFRESH_TOKEN: &str = "dev-refresh-token";

/// What the user presented to the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub enum ProviderCredential {
    /// ID token from a native provider sign-in.
    IdToken(String),
    /// Authorization code from a browser redirect.
    AuthorizationCode(String),
    /// Local development marker; no provider involved.
    DevBypass,
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderCredential::IdToken(_) => f.write_str("IdToken(<redacted>)"),
            ProviderCredential::AuthorizationCode(_) => f.write_str("AuthorizationCode(<redacted>)"),
            ProviderCredential::DevBypass => f.write_str("DevBypass"),
        }
    }
}

#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn exchange(&self, credential: ProviderCredential) -> SessionResult<IssuedCredentials>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdTokenRequest<'a> {
    id_token: &'a str,
}

#[derive(Serialize)]
struct CodeRequest<'a> {
    code: &'a str,
}

/// Exchanges credentials against the API server's sign-in endpoints.
pub struct HttpIdentityExchange {
    client: Client,
    id_token_url: String,
    code_url: String,
    allow_dev_bypass: bool,
}

impl HttpIdentityExchange {
    pub fn new(client: Client, base_url: &str, allow_dev_bypass: bool) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client,
            id_token_url: format!("{}/auth/mobile/google", base),
            code_url: format!("{}/jwt/exchange", base),
            allow_dev_bypass,
        }
    }

    async fn post<B: Serialize + Sync>(&self, url: &str, body: &B) -> SessionResult<IssuedCredentials> {
        debug!(url = url, "Exchanging provider credential");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| SessionError::IdentityExchange(format!("Failed to reach sign-in endpoint: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::IdentityExchange(format!(
                "Sign-in rejected (status {}): {}",
                status,
                truncate_body(&body)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SessionError::IdentityExchange(format!("Failed to parse sign-in response: {}", e)))
    }
}

/// Fixed credentials for local development against a dev server.
pub fn dev_credentials() -> IssuedCredentials {
    IssuedCredentials::new(DEV_ACCESS_TOKEN)
        .with_refresh_token(DEV_REFRESH_TOKEN)
        .with_principal(Principal {
            id: Some("dev-user-001".to_string()),
            email: Some("dev@denticheck.com".to_string()),
            name: Some("Dev User".to_string()),
            picture: Some("https://via.placeholder.com/150".to_string()),
            provider: Some("dev".to_string()),
        })
}

#[async_trait]
impl IdentityExchange for HttpIdentityExchange {
    async fn exchange(&self, credential: ProviderCredential) -> SessionResult<IssuedCredentials> {
        match credential {
            ProviderCredential::IdToken(id_token) => {
                let mut issued = self
                    .post(&self.id_token_url, &IdTokenRequest { id_token: &id_token })
                    .await?;
                if let Some(principal) = issued.principal.as_mut() {
                    principal.provider.get_or_insert_with(|| "google".to_string());
                }
                info!("Signed in with ID token");
                Ok(issued)
            }
            ProviderCredential::AuthorizationCode(code) => {
                let issued = self.post(&self.code_url, &CodeRequest { code: &code }).await?;
                info!("Signed in with authorization code");
                Ok(issued)
            }
            ProviderCredential::DevBypass if self.allow_dev_bypass => {
                warn!("Using developer bypass credentials");
                Ok(dev_credentials())
            }
            ProviderCredential::DevBypass => Err(SessionError::IdentityExchange(
                "developer bypass is disabled".to_string(),
            )),
        }
    }
}
