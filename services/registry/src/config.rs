//! Configuration for the registry server and its syncs.
//!
//! ```toml
//! bucket = "registry"
//! algorithms = ["sha256"]
//!
//! [storage]
//! driver = "local"
//! path = "/var/lib/registry"
//!
//! [server]
//! listen = "0.0.0.0:5000"
//!
//! [[upstream]]
//! name = "hub"
//! url = "https://registry-1.docker.io"
//! mirrors = ["https://mirror.gcr.io"]
//!
//! [[pull-through]]
//! prefix = "hub/"
//! upstream = "hub"
//! include = ["library/*"]
//!
//! [[repository]]
//! name = "alpine"
//! upstream = "hub"
//! upstream-name = "library/alpine"
//! include = ["3.*"]
//! exclude = ["*-rc*"]
//! mirror = true
//! policy = "on-demand"
//! ```

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;
use storage::StorageConfig;

use crate::catalog::Catalog;
use crate::digest::{AllowedAlgorithms, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::filter::Filter;
use crate::pull_through::PullThroughRule;
use crate::server::{AuthGate, RegistryBuilder};
use crate::sync::{DownloadPolicy, SyncOptions};
use crate::token::TokenValidator;
use crate::upstream::{Credentials, Login, Upstream, UpstreamOptions};

fn default_bucket() -> String {
    "registry".into()
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Where content is stored.
    pub storage: StorageConfig,

    /// Bucket within the storage backend.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Checksum algorithms content may be stored under.
    #[serde(default)]
    pub algorithms: AllowedAlgorithms,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Token validation. Without it the API is open.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Upstream registries.
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,

    /// Pull-through rules, tried in order.
    #[serde(default)]
    pub pull_through: Vec<PullThroughConfig>,

    /// Repositories kept in sync with an upstream.
    #[serde(default)]
    pub repository: Vec<RepositoryConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 5000)),
        }
    }
}

/// Bearer token validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    /// Where clients obtain tokens.
    pub realm: String,

    /// The service name sent in challenges.
    pub service: String,

    /// The token issuer.
    pub issuer: String,

    /// The audience tokens must carry. Defaults to the service name.
    #[serde(default)]
    pub audience: Option<String>,

    /// The Ed25519 public key tokens are signed with, hex encoded.
    pub public_key: String,

    /// Clock skew tolerated on expiry, in seconds.
    #[serde(default = "default_leeway")]
    pub leeway: u64,
}

fn default_leeway() -> u64 {
    30
}

impl AuthConfig {
    /// Build the token gate.
    pub fn gate(&self) -> RegistryResult<AuthGate> {
        let bytes = hex::decode(self.public_key.trim())
            .map_err(|error| RegistryError::Config(format!("auth public key: {error}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RegistryError::Config("auth public key must be 32 bytes".into()))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|error| RegistryError::Config(format!("auth public key: {error}")))?;

        let audience = self.audience.as_deref().unwrap_or(&self.service);
        let validator = TokenValidator::new(key, &self.issuer, audience)
            .with_leeway(Duration::from_secs(self.leeway));
        Ok(AuthGate::new(validator, &self.realm, &self.service))
    }
}

/// An upstream registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    /// Name other sections refer to this upstream by.
    pub name: String,

    /// Base url, e.g. `https://registry-1.docker.io`.
    pub url: String,

    /// Mirrors serving the same content, tried after `url`.
    #[serde(default)]
    pub mirrors: Vec<String>,

    /// Username for token requests.
    #[serde(default)]
    pub username: Option<String>,

    /// Password or access token.
    #[serde(default)]
    pub password: Option<Credentials>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Attempts per call.
    #[serde(default = "default_attempts")]
    pub attempts: usize,

    /// Concurrent calls allowed.
    #[serde(default = "default_upstream_concurrency")]
    pub concurrency: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_attempts() -> usize {
    3
}

fn default_upstream_concurrency() -> usize {
    8
}

impl UpstreamConfig {
    /// Connect to this upstream.
    pub fn connect(&self) -> RegistryResult<Upstream> {
        let endpoints = std::iter::once(&self.url)
            .chain(&self.mirrors)
            .map(|url| {
                url.parse::<Uri>().map_err(|error| {
                    RegistryError::Config(format!("upstream {} url {url:?}: {error}", self.name))
                })
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        let options = UpstreamOptions {
            timeout: Duration::from_secs(self.timeout),
            attempts: self.attempts,
            concurrency: self.concurrency,
            ..UpstreamOptions::default()
        };
        let upstream = Upstream::connect(&self.name, endpoints, options)?;

        if let Some(username) = &self.username {
            upstream.set_login(Some(Login {
                username: username.clone(),
                password: self.password.clone().unwrap_or_else(|| Credentials::from("")),
            }));
        }
        Ok(upstream)
    }
}

/// A pull-through rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PullThroughConfig {
    /// Local repository prefix, e.g. `hub/`.
    pub prefix: String,

    /// The upstream to pull from.
    pub upstream: String,

    /// Upstream repository names covered.
    #[serde(flatten)]
    pub repositories: Filter,
}

/// A repository kept in sync with an upstream repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryConfig {
    /// Local repository name.
    pub name: String,

    /// The upstream to sync from.
    pub upstream: String,

    /// Repository name on the upstream, when it differs.
    #[serde(default)]
    pub upstream_name: Option<String>,

    /// Tags to sync.
    #[serde(flatten)]
    pub tags: Filter,

    /// Manifests to sync by digest.
    #[serde(default)]
    pub digests: Vec<Digest>,

    /// Remove local tags the upstream no longer has.
    #[serde(default)]
    pub mirror: bool,

    /// Layer download policy.
    #[serde(default)]
    pub policy: DownloadPolicy,

    /// Download foreign layers too.
    #[serde(default)]
    pub include_foreign_layers: bool,

    /// Worklist items in flight at once.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Also pull tags through on read.
    #[serde(default)]
    pub pull_through: bool,
}

impl RepositoryConfig {
    /// The repository name on the upstream.
    pub fn upstream_name(&self) -> &str {
        self.upstream_name.as_deref().unwrap_or(&self.name)
    }

    /// Sync options for this repository.
    pub fn sync_options(&self) -> SyncOptions {
        let mut options = SyncOptions::new(&self.name, self.upstream_name());
        options.tags = self.tags.clone();
        options.digests = self.digests.clone();
        options.mirror = self.mirror;
        options.policy = self.policy;
        options.include_foreign_layers = self.include_foreign_layers;
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency;
        }
        options
    }
}

impl Config {
    /// Connect every configured upstream, by name.
    pub fn upstreams(&self) -> RegistryResult<BTreeMap<String, Upstream>> {
        let mut upstreams = BTreeMap::new();
        for config in &self.upstream {
            if upstreams.insert(config.name.clone(), config.connect()?).is_some() {
                return Err(RegistryError::Config(format!(
                    "upstream {} is defined twice",
                    config.name
                )));
            }
        }
        Ok(upstreams)
    }

    /// Pull-through rules: the explicit ones in order, then one per synced repository.
    ///
    /// Synced repositories with on-demand layers get a blobs-only rule, so pending layers
    /// can still be served.
    pub fn pull_through_rules(
        &self,
        upstreams: &BTreeMap<String, Upstream>,
    ) -> RegistryResult<Vec<PullThroughRule>> {
        let mut rules = Vec::new();
        for config in &self.pull_through {
            let upstream = lookup(upstreams, &config.upstream)?;
            rules.push(
                PullThroughRule::prefix(&config.prefix, upstream)
                    .repositories(config.repositories.clone()),
            );
        }

        for repository in &self.repository {
            let upstream = lookup(upstreams, &repository.upstream)?;
            let rule =
                PullThroughRule::exact(&repository.name, repository.upstream_name(), upstream);
            if repository.pull_through {
                rules.push(rule);
            } else if repository.policy == DownloadPolicy::OnDemand {
                rules.push(rule.blobs_only());
            }
        }
        Ok(rules)
    }

    /// A registry builder over `catalog` with the configured rules and auth.
    pub fn registry(
        &self,
        catalog: Catalog,
        upstreams: &BTreeMap<String, Upstream>,
    ) -> RegistryResult<RegistryBuilder> {
        let mut builder = RegistryBuilder::new().catalog(catalog);
        for rule in self.pull_through_rules(upstreams)? {
            builder = builder.pull_through(rule);
        }
        if let Some(auth) = &self.auth {
            builder = builder.auth(auth.gate()?);
        }
        Ok(builder)
    }
}

fn lookup(upstreams: &BTreeMap<String, Upstream>, name: &str) -> RegistryResult<Upstream> {
    upstreams
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::Config(format!("unknown upstream {name:?}")))
}
