use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BackendError;

/// Open/read/write/rename/delete/exist/mkdir on paths. External collaborator;
/// the engine never touches `std::fs`/`tokio::fs` directly outside of this
/// trait, so tests can swap in an in-memory fake.
#[async_trait]
pub trait FileBackend: Send + Sync + 'static {
    async fn open_read(&self, path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>, BackendError>;
    async fn open_write(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Unpin + Send>, BackendError>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError>;
    async fn remove_file(&self, path: &Path) -> Result<(), BackendError>;
    async fn exists(&self, path: &Path) -> Result<bool, BackendError>;
    async fn create_dir_all(&self, path: &Path) -> Result<(), BackendError>;
    async fn is_dir(&self, path: &Path) -> Result<bool, BackendError>;
    /// Best-effort durability hook. The std backend calls this on the
    /// scratch file before rename; see DESIGN.md for the directory-fsync
    /// gap this does not close.
    async fn sync_all(&self, path: &Path) -> Result<(), BackendError>;
}

/// The real filesystem, via `tokio::fs`.
pub struct StdFileBackend;

impl StdFileBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdFileBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileBackend for StdFileBackend {
    async fn open_read(&self, path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>, BackendError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn AsyncWrite + Unpin + Send>, BackendError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), BackendError> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, BackendError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn is_dir(&self, path: &Path) -> Result<bool, BackendError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn sync_all(&self, path: &Path) -> Result<(), BackendError> {
        // FIXME (inherited, see DESIGN.md "Open Questions"): this fsyncs the
        // file's own contents but not the containing directory entry, so a
        // crash immediately after rename can still lose the rename itself on
        // some filesystems. Closing that gap needs a platform-specific
        // directory-fsync that isn't in this crate's dependency stack.
        let file = tokio::fs::File::open(path).await?;
        file.sync_all().await?;
        debug!("synced {:?}", path);
        Ok(())
    }
}

/// Path to the scratch file used while writing a new value for `target`.
pub fn scratch_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Wraps a writer so that `shutdown` (the async analogue of `close`) is
/// swallowed instead of forwarded. The serializer is handed this wrapper so
/// it cannot release the underlying file handle before the engine decides
/// it is done with it.
pub struct NonClosingWriter<W> {
    inner: W,
}

impl<W> NonClosingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Recover the wrapped writer so the engine can close it on its own
    /// schedule.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for NonClosingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Deliberately does not forward to `self.inner`: the serializer
        // must not be able to close the file out from under the engine.
        Poll::Ready(Ok(()))
    }
}
