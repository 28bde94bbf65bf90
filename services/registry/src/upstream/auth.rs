//! Credentials and `WWW-Authenticate` challenges for upstream registries.

use std::fmt;
use std::time::{Duration, Instant};

use http::HeaderValue;
use http::header::InvalidHeaderValue;
use serde::Deserialize;
use zeroize::Zeroize;

/// A secret value, such as an upstream password.
///
/// Never shown by `Debug`, and wiped from memory on drop.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Credentials(String);

impl Credentials {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        &self.0
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(****)")
    }
}

impl From<String> for Credentials {
    fn from(value: String) -> Self {
        Credentials(value)
    }
}

impl From<&str> for Credentials {
    fn from(value: &str) -> Self {
        Credentials(value.to_owned())
    }
}

/// A username and password for an upstream registry.
#[derive(Debug, Clone)]
pub struct Login {
    /// The username.
    pub username: String,

    /// The password or access token.
    pub password: Credentials,
}

impl Login {
    /// The `Authorization: Basic` header for this login.
    pub fn basic(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        basic_auth(&self.username, Some(self.password.revealed()))
    }
}

/// Create a basic authentication header value, with the password being optional.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
pub fn basic_auth<U, P>(username: U, password: Option<P>) -> Result<HeaderValue, InvalidHeaderValue>
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf)?;
    header.set_sensitive(true);
    Ok(header)
}

/// The authentication scheme requested by a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Exchange credentials for a token at the realm.
    Bearer,

    /// Send credentials directly.
    Basic,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The scheme.
    pub scheme: Scheme,

    /// Token endpoint, for bearer challenges.
    pub realm: Option<String>,

    /// The service to request a token for.
    pub service: Option<String>,

    /// The scope the server asked for.
    pub scope: Option<String>,
}

impl Challenge {
    /// Parse a challenge such as `Bearer realm="https://auth.example/token",service="registry"`.
    pub fn parse(header: &str) -> Option<Challenge> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            Scheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            Scheme::Basic
        } else {
            return None;
        };

        let mut challenge = Challenge {
            scheme,
            realm: None,
            service: None,
            scope: None,
        };
        for (key, value) in params_of(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }

        if scheme == Scheme::Bearer && challenge.realm.is_none() {
            return None;
        }
        Some(challenge)
    }
}

/// Split `key="value",key=value` pairs, allowing commas inside quotes.
pub(crate) fn params_of(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_owned();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.push((key, value.trim().to_owned()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// The JSON body returned by a token realm.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    access_token: Option<String>,

    #[serde(default)]
    expires_in: Option<u64>,
}

/// A bearer token ready to send, with its expiry.
#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) header: HeaderValue,
    pub(crate) expires: Instant,
}

impl Token {
    pub(crate) fn is_fresh(&self) -> bool {
        self.expires > Instant::now()
    }
}

impl TokenResponse {
    /// Tokens without `expires_in` are valid for 60 seconds.
    pub(crate) fn into_token(self) -> Option<Token> {
        let token = self.token.or(self.access_token).filter(|t| !t.is_empty())?;
        let mut header = HeaderValue::try_from(format!("Bearer {token}")).ok()?;
        header.set_sensitive(true);
        let lifetime = Duration::from_secs(self.expires_in.unwrap_or(60));
        let margin = Duration::from_secs(5).min(lifetime / 2);
        Some(Token {
            header,
            expires: Instant::now() + lifetime - margin,
        })
    }
}
