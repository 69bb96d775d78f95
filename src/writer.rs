use std::path::Path;

use log::{debug, error};

use crate::backend::{self, FileBackend, NonClosingWriter};
use crate::error::StoreError;
use crate::serializer::Serializer;

/// Persist `value` to `path` via scratch-file-then-rename:
///
/// 1. ensure the parent directory exists;
/// 2. encode into a close-guarded sink over the scratch file;
/// 3. close the sink ourselves, then rename scratch -> target;
/// 4. on any failure past step 2, best-effort delete the scratch file.
pub async fn write<T>(
    backend: &dyn FileBackend,
    serializer: &dyn Serializer<T>,
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if backend.is_dir(parent).await? {
            // already there
        } else if backend.exists(parent).await? {
            return Err(crate::error::BackendError::NotSupported(format!(
                "{:?} exists and is not a directory",
                parent
            ))
            .into());
        } else {
            backend.create_dir_all(parent).await?;
        }
    }

    let scratch = backend::scratch_path(path);

    let result = async {
        let raw = backend.open_write(&scratch).await?;
        let mut guarded = NonClosingWriter::new(raw);
        serializer
            .encode(value, &mut guarded)
            .await
            .map_err(|e| StoreError::from(crate::error::BackendError::from(e)))?;
        // The serializer's `shutdown()` (if it called one) was swallowed by
        // `NonClosingWriter`; the underlying handle is still open here, and
        // drops when `guarded` goes out of scope. Sync before handing it
        // back to the backend for rename (directory fsync is not
        // attempted, see StdFileBackend::sync_all).
        backend.sync_all(&scratch).await?;
        Ok::<(), StoreError>(())
    }
    .await;

    if let Err(err) = result {
        if let Err(cleanup_err) = backend.remove_file(&scratch).await {
            debug!("failed to remove scratch file {:?}: {:?}", scratch, cleanup_err);
        }
        return Err(err);
    }

    if let Err(source) = backend.rename(&scratch, path).await {
        error!("rename {:?} -> {:?} failed: {:?}", scratch, path, source);
        if let Err(cleanup_err) = backend.remove_file(&scratch).await {
            debug!("failed to remove scratch file {:?}: {:?}", scratch, cleanup_err);
        }
        return Err(StoreError::RenameConflict {
            scratch,
            target: path.to_path_buf(),
            source,
        });
    }

    debug!("wrote {:?}", path);
    Ok(())
}
