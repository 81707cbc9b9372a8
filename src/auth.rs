use crate::server::ErrorResponse;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a token holder may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only dashboard access
    Web,
    /// Read-write access for the ingestion pipeline
    Production,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::Production)
    }
}

/// Static bearer tokens and the role each one grants
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Role>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, role: Role) -> Self {
        self.tokens.insert(token.into(), role);
        self
    }

    pub fn role_for(&self, token: &str) -> Option<Role> {
        self.tokens.get(token).copied()
    }

    /// Role for an `Authorization: Bearer <token>` header value
    pub fn authenticate(&self, header: &str) -> Option<Role> {
        let token = header.strip_prefix("Bearer ")?.trim();
        self.role_for(token)
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message)))
}

/// Middleware resolving the bearer token to a [`Role`] request extension
pub async fn require_token(
    State(tokens): State<Arc<TokenTable>>,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthorized("missing bearer token"))?;

    let role = tokens.authenticate(header).ok_or_else(|| {
        debug!("Rejected unknown token for {}", req.uri());
        unauthorized("unknown token")
    })?;

    req.extensions_mut().insert(role);
    Ok(next.run(req).await)
}

/// Refuse writes from roles without write access
pub fn ensure_writer(role: Role) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if role.can_write() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("role 'web' cannot write")),
        ))
    }
}
