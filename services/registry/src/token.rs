//! Bearer tokens for the served registry API.
//!
//! Tokens are JWTs signed with Ed25519 (`EdDSA`). Claims follow the Docker token format,
//! granting actions on named resources through `access` entries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ed25519_dalek::pkcs8::EncodePrivateKey as _;
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Actions granted on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// Resource type, `repository` for registry content.
    #[serde(rename = "type")]
    pub kind: String,

    /// Resource name.
    pub name: String,

    /// Granted actions, e.g. `pull`.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Access {
    /// Pull access to `repository`.
    pub fn pull(repository: impl Into<String>) -> Self {
        Access {
            kind: "repository".into(),
            name: repository.into(),
            actions: vec!["pull".into()],
        }
    }
}

/// The claims carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,

    /// Subject.
    #[serde(default)]
    pub sub: String,

    /// Audience, the registry service name.
    pub aud: String,

    /// Expiry, seconds since the epoch.
    pub exp: i64,

    /// Not valid before, seconds since the epoch.
    #[serde(default)]
    pub nbf: i64,

    /// Issued at, seconds since the epoch.
    #[serde(default)]
    pub iat: i64,

    /// Granted access.
    #[serde(default)]
    pub access: Vec<Access>,
}

impl Claims {
    /// Whether these claims grant every action `scope` asks for.
    ///
    /// A `*` in a granted name matches any repository name.
    pub fn grants(&self, scope: &Scope) -> bool {
        scope.actions.iter().all(|action| {
            self.access.iter().any(|access| {
                access.kind == scope.kind
                    && crate::filter::wildcard(&access.name, &scope.name)
                    && access.actions.iter().any(|granted| granted == action || granted == "*")
            })
        })
    }
}

/// A requested scope, as written in `WWW-Authenticate` challenges:
/// `repository:<name>:<action>[,<action>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Resource type.
    pub kind: String,

    /// Resource name.
    pub name: String,

    /// Requested actions.
    pub actions: Vec<String>,
}

impl Scope {
    /// The scope needed to read `repository`.
    pub fn pull(repository: impl Into<String>) -> Self {
        Scope {
            kind: "repository".into(),
            name: repository.into(),
            actions: vec!["pull".into()],
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.name, self.actions.join(","))
    }
}

impl FromStr for Scope {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TokenError::Malformed(format!("bad scope {s:?}"));
        let (kind, rest) = s.split_once(':').ok_or_else(malformed)?;
        // Names may carry a registry port, so the actions are split off the end.
        let (name, actions) = rest.rsplit_once(':').ok_or_else(malformed)?;
        if kind.is_empty() || name.is_empty() {
            return Err(malformed());
        }
        Ok(Scope {
            kind: kind.to_owned(),
            name: name.to_owned(),
            actions: actions
                .split(',')
                .filter(|action| !action.is_empty())
                .map(str::to_owned)
                .collect(),
        })
    }
}

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The token could not be decoded.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The token was signed with an algorithm other than EdDSA.
    #[error("unsupported token algorithm: {0}")]
    Algorithm(String),

    /// The signature does not verify.
    #[error("invalid token signature")]
    Signature,

    /// The token was issued by someone else.
    #[error("unexpected token issuer: {0}")]
    Issuer(String),

    /// The token is meant for another service.
    #[error("unexpected token audience: {0}")]
    Audience(String),

    /// The token could not be signed.
    #[error("unable to sign token: {0}")]
    Signing(String),

    /// The token has expired.
    #[error("token expired")]
    Expired,

    /// The token is not valid yet.
    #[error("token not yet valid")]
    NotYetValid,

    /// The token is valid but does not grant the scope.
    #[error("insufficient scope: {0}")]
    Insufficient(String),
}

impl From<TokenError> for RegistryError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::Insufficient(_) => RegistryError::Denied(error.to_string()),
            other => RegistryError::Unauthorized(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match error.kind() {
            ErrorKind::InvalidSignature => TokenError::Signature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            _ => TokenError::Malformed(error.to_string()),
        }
    }
}

/// Signs tokens.
pub struct TokenIssuer {
    key: SigningKey,
    issuer: String,
    audience: String,
    lifetime: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Issue tokens for `audience` as `issuer`, valid for five minutes.
    pub fn new(key: SigningKey, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        TokenIssuer {
            key,
            issuer: issuer.into(),
            audience: audience.into(),
            lifetime: Duration::from_secs(300),
        }
    }

    /// Change how long issued tokens stay valid.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// The key tokens verify against.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Claims for `subject` with `access`, starting now.
    pub fn claims(&self, subject: impl Into<String>, access: Vec<Access>) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            iss: self.issuer.clone(),
            sub: subject.into(),
            aud: self.audience.clone(),
            exp: now.saturating_add(i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX)),
            nbf: now,
            iat: now,
            access,
        }
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let der = self
            .key
            .to_pkcs8_der()
            .map_err(|error| TokenError::Signing(error.to_string()))?;
        let key = EncodingKey::from_ed_der(der.as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &key)
            .map_err(|error| TokenError::Signing(error.to_string()))
    }

    /// Issue a token for `subject` with `access`.
    pub fn issue(&self, subject: impl Into<String>, access: Vec<Access>) -> Result<String, TokenError> {
        self.sign(&self.claims(subject, access))
    }
}

/// Checks tokens presented to the registry.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    key: VerifyingKey,
    issuer: String,
    audience: String,
    leeway: Duration,
}

impl TokenValidator {
    /// Accept tokens signed by `key`, from `issuer`, for `audience`.
    pub fn new(key: VerifyingKey, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        TokenValidator {
            key,
            issuer: issuer.into(),
            audience: audience.into(),
            leeway: Duration::from_secs(30),
        }
    }

    /// Clock skew tolerated on `exp` and `nbf`.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Verify a token and return its claims.
    ///
    /// Expiry and not-before are checked with the configured leeway. Issuer and audience must
    /// match exactly.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let header = jsonwebtoken::decode_header(token)?;
        if header.alg != Algorithm::EdDSA {
            return Err(TokenError::Algorithm(format!("{:?}", header.alg)));
        }

        let key = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(self.key.as_bytes()))?;
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let claims = jsonwebtoken::decode::<Claims>(token, &key, &validation)?.claims;
        if claims.iss != self.issuer {
            return Err(TokenError::Issuer(claims.iss));
        }
        if claims.aud != self.audience {
            return Err(TokenError::Audience(claims.aud));
        }
        Ok(claims)
    }

    /// Verify a token and check that it grants `scope`.
    pub fn authorize(&self, token: &str, scope: &Scope) -> Result<Claims, TokenError> {
        let claims = self.validate(token)?;
        if !claims.grants(scope) {
            return Err(TokenError::Insufficient(scope.to_string()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(SigningKey::from_bytes(&[7; 32]), "auth.test", "registry.test")
    }

    fn validator(issuer: &TokenIssuer) -> TokenValidator {
        TokenValidator::new(issuer.verifying_key(), "auth.test", "registry.test")
    }

    #[test]
    fn issued_tokens_validate() {
        let issuer = issuer();
        let token = issuer
            .issue("alice", vec![Access::pull("library/alpine")])
            .unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = validator(&issuer)
            .authorize(&token, &Scope::pull("library/alpine"))
            .unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn insufficient_scope_is_denied() {
        let issuer = issuer();
        let token = issuer.issue("alice", vec![Access::pull("library/alpine")]).unwrap();
        let err = validator(&issuer)
            .authorize(&token, &Scope::pull("library/busybox"))
            .unwrap_err();
        assert!(matches!(err, TokenError::Insufficient(_)));
        assert!(matches!(RegistryError::from(err), RegistryError::Denied(_)));
    }

    #[test]
    fn wildcard_names_grant_everything_below() {
        let issuer = issuer();
        let token = issuer.issue("ci", vec![Access::pull("hub/*")]).unwrap();
        let validator = validator(&issuer);
        assert!(validator.authorize(&token, &Scope::pull("hub/library/alpine")).is_ok());
        assert!(validator.authorize(&token, &Scope::pull("private/app")).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let issuer = issuer();
        let mut claims = issuer.claims("alice", vec![Access::pull("app")]);
        claims.exp -= 3600;
        claims.nbf -= 3600;
        let token = issuer.sign(&claims).unwrap();
        assert_eq!(validator(&issuer).validate(&token), Err(TokenError::Expired));

        let mut claims = issuer.claims("alice", vec![Access::pull("app")]);
        claims.nbf += 3600;
        let token = issuer.sign(&claims).unwrap();
        assert_eq!(validator(&issuer).validate(&token), Err(TokenError::NotYetValid));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let issuer = issuer();
        let other = TokenIssuer::new(SigningKey::from_bytes(&[9; 32]), "auth.test", "registry.test");
        let token = other.issue("mallory", vec![Access::pull("app")]).unwrap();
        assert_eq!(validator(&issuer).validate(&token), Err(TokenError::Signature));

        let mut forged = issuer.issue("alice", vec![Access::pull("app")]).unwrap();
        forged.push('A');
        assert!(validator(&issuer).validate(&forged).is_err());
    }

    #[test]
    fn other_algorithms_are_rejected() {
        let issuer = issuer();
        let token = issuer.issue("alice", vec![Access::pull("app")]).unwrap();
        let (_, rest) = token.split_once('.').unwrap();

        let hmac = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let err = validator(&issuer).validate(&format!("{hmac}.{rest}")).unwrap_err();
        assert_eq!(err, TokenError::Algorithm("HS256".into()));

        let none = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let err = validator(&issuer).validate(&format!("{none}.{rest}")).unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    #[test]
    fn extreme_time_claims_do_not_overflow() {
        let issuer = issuer();
        let validator = validator(&issuer);

        let mut claims = issuer.claims("alice", vec![Access::pull("app")]);
        claims.exp = i64::MAX;
        let token = issuer.sign(&claims).unwrap();
        assert_eq!(validator.validate(&token).unwrap().exp, i64::MAX);

        let mut claims = issuer.claims("alice", vec![Access::pull("app")]);
        claims.nbf = i64::MIN;
        claims.exp = i64::MIN;
        let token = issuer.sign(&claims).unwrap();
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn wrong_audience_and_issuer() {
        let issuer = issuer();
        let token = issuer.issue("alice", vec![]).unwrap();
        let elsewhere = TokenValidator::new(issuer.verifying_key(), "auth.test", "other.test");
        assert!(matches!(elsewhere.validate(&token), Err(TokenError::Audience(_))));
        let impostor = TokenValidator::new(issuer.verifying_key(), "evil.test", "registry.test");
        assert!(matches!(impostor.validate(&token), Err(TokenError::Issuer(_))));
    }

    #[test]
    fn scopes_parse() {
        let scope: Scope = "repository:localhost:5000/app:pull,push".parse().unwrap();
        assert_eq!(scope.name, "localhost:5000/app");
        assert_eq!(scope.actions, vec!["pull", "push"]);
        assert_eq!(scope.to_string(), "repository:localhost:5000/app:pull,push");
        assert!("repository".parse::<Scope>().is_err());
    }
}
