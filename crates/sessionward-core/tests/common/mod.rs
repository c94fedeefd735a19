#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use sessionward_core::auth::{DurableStore, MemoryStore, RotatingStrategy, StorageKey};
use sessionward_core::{RouteNavigator, SessionManager};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Token state of a fake API server that rotates refresh tokens on every use.
#[derive(Debug, Default)]
pub struct ServerState {
    tokens: Mutex<Tokens>,
    refresh_calls: AtomicUsize,
}

#[derive(Debug, Default)]
struct Tokens {
    generation: u32,
    access: Option<String>,
    refresh: Option<String>,
}

impl ServerState {
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Accept `refresh` as the only valid refresh token; no access token is valid.
    pub fn issue_refresh_token(&self, refresh: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.refresh = Some(refresh.to_string());
        tokens.access = None;
    }

    /// Make the current access token expire server-side.
    pub fn expire_access(&self) {
        self.tokens.lock().unwrap().access = None;
    }

    /// Revoke everything; the next refresh is rejected.
    pub fn revoke_all(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.access = None;
        tokens.refresh = None;
    }

    pub fn current_refresh(&self) -> Option<String> {
        self.tokens.lock().unwrap().refresh.clone()
    }
}

struct RefreshResponder(Arc<ServerState>);

impl Respond for RefreshResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.0.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let presented = serde_json::from_slice::<serde_json::Value>(&request.body)
            .ok()
            .and_then(|body| body["refreshToken"].as_str().map(str::to_string));

        let mut tokens = self.0.tokens.lock().unwrap();
        if presented.is_none() || presented != tokens.refresh {
            return ResponseTemplate::new(401)
                .set_body_json(json!({"code": 6003, "message": "refresh token not found"}));
        }

        tokens.generation += 1;
        let access = format!("access-{}", tokens.generation);
        let refresh = format!("refresh-{}", tokens.generation);
        tokens.access = Some(access.clone());
        tokens.refresh = Some(refresh.clone());

        ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": access,
            "refreshToken": refresh,
            "user": {"id": "u-1", "email": "kim@example.com", "name": "Kim"}
        }))
    }
}

struct ResourceResponder(Arc<ServerState>);

impl Respond for ResourceResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let bearer = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let tokens = self.0.tokens.lock().unwrap();
        if bearer.is_some() && bearer == tokens.access {
            ResponseTemplate::new(200).set_body_json(json!({"ok": true, "path": request.url.path()}))
        } else {
            ResponseTemplate::new(401).set_body_json(json!({"code": 6002, "message": "invalid token"}))
        }
    }
}

/// Start a rotating API server that accepts `refresh` as its initial refresh token.
pub async fn start_server(refresh: &str) -> (MockServer, Arc<ServerState>) {
    let server = MockServer::start().await;
    let state = Arc::new(ServerState::default());
    state.issue_refresh_token(refresh);

    Mock::given(method("POST"))
        .and(path("/jwt/refresh"))
        .respond_with(RefreshResponder(state.clone()))
        .mount(&server)
        .await;
    Mock::given(path_regex(r"^/api/"))
        .respond_with(ResourceResponder(state.clone()))
        .mount(&server)
        .await;

    (server, state)
}

pub struct Harness {
    pub manager: SessionManager,
    pub durable: Arc<MemoryStore>,
    pub navigator: Arc<RouteNavigator>,
}

/// A rotating-variant manager on `route` whose durable store already holds `stored_refresh`.
pub fn harness(server: &MockServer, route: &str, stored_refresh: Option<&str>) -> Harness {
    let durable = Arc::new(MemoryStore::new());
    if let Some(token) = stored_refresh {
        durable.set(StorageKey::RefreshToken, token).unwrap();
    }
    let navigator = Arc::new(RouteNavigator::new("/login"));
    navigator.navigate(route);

    let http = reqwest::Client::new();
    let strategy = Arc::new(RotatingStrategy::new(http.clone(), &server.uri()));
    let manager = SessionManager::with_parts(
        durable.clone(),
        strategy,
        navigator.clone(),
        http,
        &server.uri(),
    );
    Harness {
        manager,
        durable,
        navigator,
    }
}
