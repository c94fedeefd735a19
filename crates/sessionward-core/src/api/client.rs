//! Authenticated request pipeline.
//!
//! Every protected call goes through [`AuthenticatedClient::send`]: the
//! current access token is attached, a 401 triggers one coordinated refresh,
//! and the request is replayed at most once with the renewed token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{RefreshCoordinator, SessionStore};
use crate::error::{SessionError, SessionResult};
use crate::navigation::SignInNavigator;

/// Maximum number of retries for rate-limited (429) requests in the JSON helpers.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap; all state is shared.
#[derive(Clone)]
pub struct AuthenticatedClient {
    client: Client,
    base_url: String,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    navigator: Arc<dyn SignInNavigator>,
}

impl AuthenticatedClient {
    pub fn new(
        client: Client,
        base_url: &str,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        navigator: Arc<dyn SignInNavigator>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            coordinator,
            navigator,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start building a request against the API base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Build and send a request through the pipeline.
    pub async fn execute(&self, builder: RequestBuilder) -> SessionResult<Response> {
        self.send(builder.build()?).await
    }

    /// Send a request with the session's credential, healing one 401.
    ///
    /// Any response other than a 401 is returned unmodified, error statuses
    /// included. A request rejected again after a successful refresh is not
    /// retried a second time; the session is cleared and
    /// [`SessionError::Unauthorized`] is returned.
    pub async fn send(&self, request: Request) -> SessionResult<Response> {
        let replay = request.try_clone();

        let token = match self.coordinator.current_access_token().await {
            Ok(token) => token,
            Err(e) => return Err(self.on_refresh_failure(e)),
        };
        let response = self.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(url = %response.url(), "Request unauthorized; renewing session");
        let renewed = match self.coordinator.renew_after_rejection(token.as_deref()).await {
            Ok(renewed) => renewed,
            Err(e) => return Err(self.on_refresh_failure(e)),
        };

        let Some(replay) = replay else {
            warn!("Session renewed but the request body cannot be replayed");
            return Err(SessionError::RequestNotReplayable);
        };

        let response = self.dispatch(replay, Some(&renewed)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %response.url(), "Request rejected after session renewal");
            self.expire_session();
            return Err(SessionError::Unauthorized);
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.json_with_backoff(Method::GET, path, None::<&()>).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.json_with_backoff(Method::POST, path, Some(body)).await
    }

    async fn json_with_backoff<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut builder = self
                .request(method.clone(), path)
                .header(header::ACCEPT, "application/json");
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = self.execute(builder).await?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", path, e)));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(path = path, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
    }

    async fn dispatch(&self, mut request: Request, token: Option<&str>) -> SessionResult<Response> {
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                SessionError::InvalidResponse("access token is not a valid header value".to_string())
            })?;
            value.set_sensitive(true);
            request.headers_mut().insert(header::AUTHORIZATION, value);
        } else {
            request.headers_mut().remove(header::AUTHORIZATION);
        }
        Ok(self.client.execute(request).await?)
    }

    /// Transient failures bubble up untouched; terminal ones end the session.
    fn on_refresh_failure(&self, error: SessionError) -> SessionError {
        if error.is_terminal() {
            self.expire_session();
        }
        error
    }

    fn expire_session(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }
        if !self.navigator.is_on_sign_in_surface() {
            self.navigator.redirect_to_sign_in();
        }
    }
}
