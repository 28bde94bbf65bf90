//! Bearer token middleware.

use std::sync::Arc;

use axum::RequestExt as _;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::Endpoint;
use crate::error::RegistryError;
use crate::token::{Scope, TokenError, TokenValidator};

/// Rejects requests without a token granting pull on the addressed repository.
#[derive(Debug, Clone)]
pub struct AuthGate {
    validator: TokenValidator,
    realm: String,
    service: String,
}

impl AuthGate {
    /// Validate with `validator`, sending clients to `realm` for tokens for `service`.
    pub fn new(
        validator: TokenValidator,
        realm: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        AuthGate {
            validator,
            realm: realm.into(),
            service: service.into(),
        }
    }

    fn challenge(&self, scope: Option<&Scope>, error: Option<&str>) -> Option<HeaderValue> {
        let mut value = format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service);
        if let Some(scope) = scope {
            value.push_str(&format!(r#",scope="{scope}""#));
        }
        if let Some(error) = error {
            value.push_str(&format!(r#",error="{error}""#));
        }
        HeaderValue::try_from(value).ok()
    }

    fn reject(&self, error: TokenError, scope: Option<&Scope>) -> Response {
        let code = match &error {
            TokenError::Insufficient(_) => "insufficient_scope",
            _ => "invalid_token",
        };
        tracing::debug!(%error, "rejected token");
        let mut response = RegistryError::from(error).into_response();
        if let Some(value) = self.challenge(scope, Some(code)) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

fn bearer(request: &Request) -> Option<&str> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// The scope a request needs. The version check needs none beyond a valid token.
///
/// Read from the decoded route parameter, the same path the handler serves.
async fn scope_of(request: &mut Request) -> Option<Scope> {
    let Path(path) = request.extract_parts::<Path<String>>().await.ok()?;
    Endpoint::parse(&path).map(|endpoint| Scope::pull(endpoint.name()))
}

pub(super) async fn require_token(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let scope = scope_of(&mut request).await;

    let Some(token) = bearer(&request) else {
        let mut response =
            RegistryError::Unauthorized("authentication required".into()).into_response();
        if let Some(value) = gate.challenge(scope.as_ref(), None) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        return response;
    };

    let verdict = match &scope {
        Some(scope) => gate.validator.authorize(token, scope),
        None => gate.validator.validate(token),
    };
    match verdict {
        Ok(claims) => {
            tracing::trace!(subject = %claims.sub, "authorized request");
            next.run(request).await
        }
        Err(error) => gate.reject(error, scope.as_ref()),
    }
}
