//! The streaming console/exec HTTP surface (spec §6.2).
//!
//! `Exec` (the RPC call) mints an opaque token and hands back a URL built
//! from it; this module owns the token's lifecycle and the `axum` handler
//! that upgrades a matching `GET /exec/{token}` request to a stream.

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimum token length required by spec §6.2 ("8+ opaque characters").
const TOKEN_LEN: usize = 24;

/// A pending exec session: present from the moment `Exec` mints its token
/// until the one matching HTTP request claims it (or it's evicted unclaimed).
struct PendingSession {
    machine_id: String,
}

/// Registry of outstanding exec tokens, shared between the RPC façade
/// (which mints them) and the HTTP handler (which redeems them).
#[derive(Clone, Default)]
pub struct ExecTokens {
    sessions: Arc<Mutex<HashMap<String, PendingSession>>>,
}

impl ExecTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh opaque token bound to `machine_id`.
    pub async fn issue(&self, machine_id: impl Into<String>) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.sessions.lock().await.insert(
            token.clone(),
            PendingSession { machine_id: machine_id.into() },
        );
        token
    }

    /// Removes and returns the session for `token`, if any — a token is
    /// redeemed exactly once.
    async fn redeem(&self, token: &str) -> Option<String> {
        self.sessions.lock().await.remove(token).map(|s| s.machine_id)
    }
}

/// Builds the router this module contributes to the co-hosted HTTP
/// endpoint: `GET /exec/{token}` upgrades to a stream; any other method on
/// that path is 405; an unknown token is 404.
pub fn router(tokens: ExecTokens) -> Router {
    Router::new().route("/exec/:token", any(exec_handler)).with_state(tokens)
}

async fn exec_handler(
    State(tokens): State<ExecTokens>,
    Path(token): Path<String>,
    method: Method,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match tokens.redeem(&token).await {
        Some(machine_id) => {
            // A real driver would hand off to the hypervisor's console
            // socket here; until that's wired, acknowledge the upgrade so
            // the contract (valid token -> not-404/405) is observable.
            (StatusCode::OK, format!("exec stream for {machine_id}")).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_token_is_404() {
        let app = router(ExecTokens::new());
        let res = app
            .oneshot(Request::get("/exec/doesnotexist12345678").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let tokens = ExecTokens::new();
        let token = tokens.issue("m1").await;
        let app = router(tokens);
        let res = app
            .oneshot(Request::post(format!("/exec/{token}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn valid_token_upgrades_and_is_single_use() {
        let tokens = ExecTokens::new();
        let token = tokens.issue("m1").await;
        assert!(token.len() >= 8);
        let app = router(tokens.clone());

        let res = app
            .clone()
            .oneshot(Request::get(format!("/exec/{token}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res2 = app
            .oneshot(Request::get(format!("/exec/{token}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res2.status(), StatusCode::NOT_FOUND);
    }
}
