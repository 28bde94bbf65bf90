//! Content addressed blob storage.
//!
//! Blobs stream in and out of the storage bucket through an in-memory pipe, so no blob is
//! ever held in memory whole. Incoming bytes are hashed on their way into the bucket, and
//! an upload whose content does not match its digest fails before it becomes visible.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use camino::Utf8PathBuf;
use storage::StorageBucket;
use tokio::io::{AsyncBufRead, AsyncRead, DuplexStream, ReadBuf};
use tracing::Instrument as _;

use crate::digest::{Algorithm, AllowedAlgorithms, Digest, EMPTY_LAYER, Hasher};
use crate::error::{RegistryError, RegistryResult};

/// Bytes buffered between a producer and storage.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A streamed blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Hashes what is read through it. At end of input, content that does not hash to
/// `expected` turns into a read error, which aborts the upload consuming it.
struct Verifying<R> {
    inner: R,
    expected: Digest,
    hasher: Option<Hasher>,
    hashed: usize,
    size: u64,
    mismatch: Option<Digest>,
}

impl<R> Verifying<R> {
    fn new(inner: R, expected: Digest) -> Self {
        Verifying {
            inner,
            hasher: Some(expected.algorithm().hasher()),
            expected,
            hashed: 0,
            size: 0,
            mismatch: None,
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncBufRead for Verifying<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        let buf = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;

        if buf.is_empty() {
            if let Some(hasher) = this.hasher.take() {
                let actual = hasher.finish();
                if actual != this.expected {
                    this.mismatch = Some(actual);
                }
            }
            if this.mismatch.is_some() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("content does not match {}", this.expected),
                )));
            }
            return Poll::Ready(Ok(buf));
        }

        // Bytes seen by an earlier fill but not yet consumed are already hashed.
        if let Some(hasher) = this.hasher.as_mut() {
            hasher.update(&buf[this.hashed.min(buf.len())..]);
        }
        this.hashed = buf.len();
        Poll::Ready(Ok(buf))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.hashed = this.hashed.saturating_sub(amt);
        this.size += amt as u64;
        Pin::new(&mut this.inner).consume(amt);
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for Verifying<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let available = ready!(Pin::new(&mut *this).poll_fill_buf(cx))?;
        let n = available.len().min(out.remaining());
        out.put_slice(&available[..n]);
        Pin::new(this).consume(n);
        Poll::Ready(Ok(()))
    }
}

/// Blob and manifest bytes, keyed by digest.
///
/// Writes are idempotent: the key is derived from the verified content, so racing writers of the
/// same digest converge on one object and never need a lock.
#[derive(Debug, Clone)]
pub struct ContentStore {
    bucket: StorageBucket,
    algorithms: AllowedAlgorithms,
}

impl ContentStore {
    /// Create a content store in `bucket`.
    pub fn new(bucket: StorageBucket, algorithms: AllowedAlgorithms) -> Self {
        Self { bucket, algorithms }
    }

    /// The checksum allow-list.
    pub fn algorithms(&self) -> &AllowedAlgorithms {
        &self.algorithms
    }

    fn blob_path(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("blobs/{}/{}", digest.algorithm(), digest.hex()))
    }

    /// Hash and store `content`, returning its digest.
    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    pub async fn put(&self, algorithm: Algorithm, content: &[u8]) -> RegistryResult<Digest> {
        self.algorithms.check(algorithm)?;
        let digest = algorithm.digest(content);
        self.store(&digest, content).await?;
        Ok(digest)
    }

    /// Store a blob written by `produce` under `claimed`, hashing it on its way into storage.
    ///
    /// `produce` writes the blob into the pipe it is given and drops it when done. The object
    /// only becomes visible if everything written hashes to `claimed`. When `produce` fails,
    /// its error is returned and nothing is stored. Content that is already stored is kept
    /// and `produce` never runs. Returns the stored size.
    #[tracing::instrument(skip(self, produce), fields(%claimed))]
    pub async fn put_stream<F, Fut>(&self, claimed: &Digest, produce: F) -> RegistryResult<u64>
    where
        F: FnOnce(DuplexStream) -> Fut,
        Fut: Future<Output = RegistryResult<()>>,
    {
        self.algorithms.check(claimed.algorithm())?;
        let path = Self::blob_path(claimed);
        if self.bucket.exists(&path).await? {
            tracing::trace!("content already stored");
            return self.size(claimed).await;
        }

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let mut source = Verifying::new(tokio::io::BufReader::new(reader), claimed.clone());
        // The upload owns the reading end, so a failed upload unblocks the producer.
        let upload = async move {
            let stored = self.bucket.upload(&path, &mut source).await;
            (stored, source.mismatch, source.size)
        };

        match tokio::join!(produce(writer), upload) {
            (_, (Ok(()), _, size)) => {
                tracing::debug!(size, "stored content");
                Ok(size)
            }
            (Err(error), (Err(_), Some(_), _)) => Err(error),
            (Ok(()), (Err(_), Some(actual), _)) => Err(RegistryError::DigestMismatch {
                expected: claimed.to_string(),
                actual: actual.to_string(),
            }),
            (_, (Err(error), None, _)) => Err(error.into()),
        }
    }

    /// Store manifest bytes whose digest was checked by the manifest parser.
    ///
    /// Signed schema 1 manifests are identified by the digest of their unsigned payload, so
    /// the caller passes the verified identity rather than a plain hash of `content`.
    pub(crate) async fn put_manifest(&self, digest: &Digest, content: &[u8]) -> RegistryResult<()> {
        self.algorithms.check(digest.algorithm())?;
        self.store(digest, content).await
    }

    async fn store(&self, digest: &Digest, content: &[u8]) -> RegistryResult<()> {
        let path = Self::blob_path(digest);
        if self.bucket.exists(&path).await? {
            tracing::trace!(%digest, "content already stored");
            return Ok(());
        }

        self.bucket.put(&path, content).await?;
        tracing::debug!(%digest, size = content.len(), "stored content");
        Ok(())
    }

    /// Stream stored bytes.
    ///
    /// A background task copies the object out of storage as the reader is drained. Dropping
    /// the reader stops the copy; a copy that fails ends the stream early.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn reader(&self, digest: &Digest) -> RegistryResult<BlobReader> {
        let path = Self::blob_path(digest);
        if !self.bucket.exists(&path).await? {
            if digest.is_empty_layer() {
                return Ok(Box::new(EMPTY_LAYER));
            }
            return Err(RegistryError::BlobNotFound(digest.to_string()));
        }

        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bucket = self.bucket.clone();
        tokio::spawn(
            async move {
                if let Err(error) = bucket.download(&path, &mut writer).await {
                    tracing::debug!(%error, "blob stream ended early");
                }
            }
            .in_current_span(),
        );
        Ok(Box::new(reader))
    }

    /// Read stored bytes into memory. Meant for manifests and configs.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        match self.bucket.get(&Self::blob_path(digest)).await {
            Ok(data) => Ok(data),
            Err(error) if error.is_not_found() && digest.is_empty_layer() => {
                Ok(Bytes::from_static(EMPTY_LAYER))
            }
            Err(error) if error.is_not_found() => {
                Err(RegistryError::BlobNotFound(digest.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Whether `digest` is stored.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        if digest.is_empty_layer() {
            return Ok(true);
        }
        Ok(self.bucket.exists(&Self::blob_path(digest)).await?)
    }

    /// Size in bytes of the stored object.
    pub async fn size(&self, digest: &Digest) -> RegistryResult<u64> {
        match self.bucket.metadata(&Self::blob_path(digest)).await {
            Ok(meta) => Ok(meta.size),
            Err(error) if error.is_not_found() && digest.is_empty_layer() => {
                Ok(EMPTY_LAYER.len() as u64)
            }
            Err(error) if error.is_not_found() => {
                Err(RegistryError::BlobNotFound(digest.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Every digest with stored bytes.
    pub async fn list(&self) -> RegistryResult<Vec<Digest>> {
        let keys = self.bucket.list(Some(camino::Utf8Path::new("blobs"))).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                let mut parts = key.strip_prefix("blobs/")?.splitn(2, '/');
                let algorithm = parts.next()?;
                let hex = parts.next()?;
                format!("{algorithm}:{hex}").parse().ok()
            })
            .collect())
    }

    /// Remove stored bytes. Reference checks are the caller's responsibility.
    pub(crate) async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        self.bucket.delete(&Self::blob_path(digest)).await?;
        tracing::debug!(%digest, "deleted content");
        Ok(())
    }
}
