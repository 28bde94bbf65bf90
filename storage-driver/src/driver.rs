use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides `put`, `get` and `delete` of opaque objects by key.
///
/// Implementations must make `upload` all-or-nothing from the point of view of readers: an
/// object is either absent or holds the full uploaded contents.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Delete an object by key. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object by key.
    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Store an object, reading its contents from `reader`.
    async fn upload(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Read an object into `writer`.
    async fn download(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the keys in a bucket, optionally filtered by a prefix.
    async fn list(&self, bucket: &str, prefix: Option<&Utf8Path>)
        -> Result<Vec<String>, StorageError>;

    /// Check whether an object exists.
    async fn exists(&self, bucket: &str, key: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, key: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, key).await
    }

    async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, key).await
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, key, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, key, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn exists(&self, bucket: &str, key: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[derive(Debug)]
    struct Missing;

    #[async_trait::async_trait]
    impl Driver for Missing {
        fn name(&self) -> &'static str {
            "missing"
        }

        async fn delete(&self, _bucket: &str, _key: &Utf8Path) -> Result<(), StorageError> {
            Ok(())
        }

        async fn metadata(&self, bucket: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
            Err(StorageError::not_found(self.name(), bucket, key))
        }

        async fn upload(
            &self,
            _bucket: &str,
            _key: &Utf8Path,
            _reader: &mut Reader<'_>,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn download(
            &self,
            bucket: &str,
            key: &Utf8Path,
            _writer: &mut Writer<'_>,
        ) -> Result<(), StorageError> {
            Err(StorageError::not_found(self.name(), bucket, key))
        }

        async fn list(
            &self,
            _bucket: &str,
            _prefix: Option<&Utf8Path>,
        ) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn exists_maps_not_found_to_false() {
        let driver = Arc::new(Missing);
        assert!(!driver.exists("bucket", Utf8Path::new("a/b")).await.unwrap());
    }
}
