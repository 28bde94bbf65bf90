//! The object-store interface used as durable backing for registry content.
//!
//! A [`Driver`] stores opaque objects under `(bucket, key)` pairs. Drivers know nothing about
//! digests or manifests; content addressing is layered on top by callers.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
