use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const STAGING: &str = ".staging";

/// Storage driver backed by a directory tree.
///
/// Objects live at `<root>/<bucket>/<key>`. Uploads are written to a staging file under
/// `<root>/.staging` and renamed into place once complete.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,

    /// Owns `root` when it is temporary, deleting the tree on drop.
    #[cfg(feature = "tmp")]
    scratch: Option<tempfile::TempDir>,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            #[cfg(feature = "tmp")]
            scratch: None,
        }
    }

    /// Create a driver rooted at a fresh temporary directory, removed with the driver.
    ///
    /// The staging directory is created up-front, so a temporary root that cannot take
    /// uploads fails here rather than on first write.
    #[cfg(feature = "tmp")]
    pub fn temporary() -> std::io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("registry-").tempdir()?;
        let root = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "non utf-8 temp path"))?
            .to_owned();
        std::fs::create_dir_all(root.join(STAGING))?;
        tracing::debug!(%root, "created temporary storage root");

        Ok(Self {
            root,
            scratch: Some(scratch),
        })
    }

    /// The directory objects are stored under.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push(remote);
        path
    }

    fn io_error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::builder(self.name(), StorageErrorKind::from_io(&err), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.io_error(bucket, remote, err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(bucket, remote, err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let target = self.path(bucket, remote);
        let staging = self.root.join(STAGING);
        let partial = staging.join(uuid::Uuid::new_v4().to_string());

        let parent = target.parent().unwrap_or(&self.root);
        for dir in [parent, staging.as_path()] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| self.io_error(bucket, remote, err))?;
        }

        let written: std::io::Result<()> = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy(local, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&partial, &target).await
        }
        .await;

        if let Err(err) = written {
            tracing::debug!(%partial, "discarding partial upload");
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.io_error(bucket, remote, err));
        }

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.io_error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        local
            .flush()
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(bucket);
        let start = match prefix {
            Some(part) => base.join(part),
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| {
                StorageError::builder(self.name(), StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

#[tracing::instrument(level = "trace")]
fn collect_list(base: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files).wrap_err_with(|| format!("walk {start}"))?;
    }

    files.sort();
    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
