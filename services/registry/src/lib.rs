//! # OCI Registry Mirror
//!
//! A read-only OCI registry which keeps local copies of repositories from upstream
//! registries, following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Content-addressed storage with verified writes and reference-checked deletion
//! - Scheduled repository syncs with tag filters, digest pins and mirroring
//! - Pull-through on read, with concurrent misses sharing one upstream fetch
//! - Upstream token auth, retries and mirror failover
//! - Bearer token validation on the serving side
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use registry_mirror::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let router = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build()?;
//!
//! // Use the registry service with axum or any tower-compatible server
//! # drop(router);
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod content;
pub mod digest;
mod error;
pub mod filter;
pub mod manifest;
pub mod pull_through;
pub mod reference;
mod server;
pub mod sync;
pub mod token;
pub mod upstream;

pub use catalog::Catalog;
pub use digest::Digest;
pub use error::{ErrorKind, Failure, RegistryError, RegistryResult};
pub use server::{API_VERSION_HEADER, AuthGate, Registry, RegistryBuilder};
