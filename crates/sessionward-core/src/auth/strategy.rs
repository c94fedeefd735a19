//! Interchangeable session policies behind one interface.
//!
//! - `RotatingStrategy`: short-lived access token plus a refresh token that
//!   the server rotates on every use.
//! - `StaticStrategy`: a single long-lived token that is never renewed.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::session::{IssuedCredentials, Session};
use crate::api::error::truncate_body;
use crate::error::{SessionError, SessionResult};

/// Which session policy the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Rotating,
    Static,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rotating" => Some(StrategyKind::Rotating),
            "static" => Some(StrategyKind::Static),
            _ => None,
        }
    }
}

#[async_trait]
pub trait SessionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Exchange the session's renewal credential for new credentials.
    async fn refresh(&self, session: &Session) -> SessionResult<IssuedCredentials>;

    /// Invalidate the session server-side. Callers treat failure as best-effort.
    async fn revoke(&self, session: &Session) -> SessionResult<()>;
}

/// Auth error codes the server attaches to credential failures.
const AUTH_ERROR_CODES: std::ops::RangeInclusive<i64> = 6000..=6004;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<i64>,
}

/// Classify a failed refresh response as a rejection (terminal) or a transient failure.
pub(crate) fn classify_refresh_failure(status: StatusCode, body: &str) -> SessionError {
    let auth_code = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.code)
        .filter(|code| AUTH_ERROR_CODES.contains(code));
    let truncated = truncate_body(body);

    if auth_code.is_some() {
        return SessionError::RefreshRejected(truncated);
    }
    match status.as_u16() {
        400 | 401 | 403 => SessionError::RefreshRejected(truncated),
        408 | 429 | 500..=599 => SessionError::ServerError(format!("Status {}: {}", status, truncated)),
        _ => SessionError::InvalidResponse(format!("Status {}: {}", status, truncated)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

pub struct RotatingStrategy {
    client: Client,
    refresh_url: String,
    logout_url: String,
}

impl RotatingStrategy {
    pub fn new(client: Client, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client,
            refresh_url: format!("{}/jwt/refresh", base),
            logout_url: format!("{}/jwt/logout", base),
        }
    }
}

#[async_trait]
impl SessionStrategy for RotatingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rotating
    }

    async fn refresh(&self, session: &Session) -> SessionResult<IssuedCredentials> {
        let refresh_token = session.refresh_token().ok_or(SessionError::NoRefreshToken)?;

        debug!(url = %self.refresh_url, "Requesting token rotation");
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_refresh_failure(status, &body));
        }

        let issued: IssuedCredentials = response
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;
        Ok(issued)
    }

    async fn revoke(&self, session: &Session) -> SessionResult<()> {
        let Some(refresh_token) = session.refresh_token() else {
            return Ok(());
        };

        let response = self
            .client
            .post(&self.logout_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::ServerError(format!(
                "Status {}: {}",
                status,
                truncate_body(&body)
            )));
        }
        info!("Refresh token revoked server-side");
        Ok(())
    }
}

/// Long-lived opaque token obtained once from the identity exchange.
#[derive(Debug, Default)]
pub struct StaticStrategy;

#[async_trait]
impl SessionStrategy for StaticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Static
    }

    async fn refresh(&self, _session: &Session) -> SessionResult<IssuedCredentials> {
        Err(SessionError::RefreshRejected(
            "static sessions cannot be renewed".to_string(),
        ))
    }

    async fn revoke(&self, _session: &Session) -> SessionResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_with_refresh(token: &str) -> Session {
        Session::awaiting_refresh(token.to_string(), None)
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!(StrategyKind::parse("Rotating"), Some(StrategyKind::Rotating));
        assert_eq!(StrategyKind::parse(" static "), Some(StrategyKind::Static));
        assert_eq!(StrategyKind::parse("cookie"), None);
    }

    #[test]
    fn test_classify_refresh_failure() {
        assert!(matches!(
            classify_refresh_failure(StatusCode::UNAUTHORIZED, ""),
            SessionError::RefreshRejected(_)
        ));
        assert!(matches!(
            classify_refresh_failure(StatusCode::BAD_GATEWAY, "upstream"),
            SessionError::ServerError(_)
        ));
        // Auth error code wins over a generic server status
        assert!(matches!(
            classify_refresh_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"code":6003,"message":"expired"}"#
            ),
            SessionError::RefreshRejected(_)
        ));
        assert!(matches!(
            classify_refresh_failure(StatusCode::IM_A_TEAPOT, ""),
            SessionError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_rotating_refresh_posts_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jwt/refresh"))
            .and(body_json(serde_json::json!({"refreshToken": "r-0"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "a-1",
                "refreshToken": "r-1",
                "user": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = RotatingStrategy::new(Client::new(), &format!("{}/", server.uri()));
        let issued = strategy.refresh(&session_with_refresh("r-0")).await.unwrap();

        assert_eq!(issued.access_token, "a-1");
        assert_eq!(issued.refresh_token.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_rotating_refresh_without_token_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let strategy = RotatingStrategy::new(Client::new(), &server.uri());
        let result = strategy.refresh(&Session::unauthenticated()).await;
        assert_eq!(result.unwrap_err(), SessionError::NoRefreshToken);
    }

    #[tokio::test]
    async fn test_rotating_revoke_posts_logout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jwt/logout"))
            .and(body_json(serde_json::json!({"refreshToken": "r-9"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = RotatingStrategy::new(Client::new(), &server.uri());
        strategy.revoke(&session_with_refresh("r-9")).await.unwrap();
    }

    #[tokio::test]
    async fn test_static_strategy_never_renews() {
        let strategy = StaticStrategy;
        let result = strategy.refresh(&session_with_refresh("ignored")).await;
        assert!(result.unwrap_err().is_terminal());
        assert!(strategy.revoke(&Session::unauthenticated()).await.is_ok());
    }
}
