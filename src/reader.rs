use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::AsyncReadExt;

use crate::backend::FileBackend;
use crate::error::StoreError;
use crate::serializer::{CorruptionHandler, Serializer};
use crate::writer;

/// Decode the value at `path` from `backend`, falling back to the
/// serializer's default when the file is absent. Corruption is rethrown as
/// `StoreError::Corruption` with no recovery attempted yet; that is
/// [`read_or_handle_corruption`]'s job.
pub async fn read<T>(
    backend: &dyn FileBackend,
    serializer: &dyn Serializer<T>,
    path: &Path,
) -> Result<T, StoreError> {
    let mut reader = match backend.open_read(path).await {
        Ok(r) => r,
        Err(e) if e.is_not_found() => {
            debug!("{:?} does not exist, using default value", path);
            return Ok(serializer.default_value());
        }
        Err(e) => return Err(e.into()),
    };

    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| StoreError::from(crate::error::BackendError::from(e)))?;

    match serializer.decode(&bytes) {
        Ok(value) => Ok(value),
        Err(decode) => Err(StoreError::Corruption {
            decode,
            recovery_write: None,
        }),
    }
}

/// Wraps [`read`]: on corruption, asks the corruption handler for a
/// replacement and persists it via the atomic writer. If the recovery
/// write itself fails, the original corruption is still the primary
/// error, with the write failure attached as secondary cause.
pub async fn read_or_handle_corruption<T>(
    backend: &dyn FileBackend,
    serializer: &dyn Serializer<T>,
    corruption_handler: &Arc<dyn CorruptionHandler<T>>,
    path: &Path,
) -> Result<T, StoreError>
where
    T: Send + Sync + 'static,
{
    match read(backend, serializer, path).await {
        Ok(value) => Ok(value),
        Err(StoreError::Corruption { decode, .. }) => {
            warn!("{:?} is corrupt, invoking corruption handler", path);
            let replacement = corruption_handler.handle(decode.clone()).await?;
            if let Err(write_err) = writer::write(backend, serializer, path, &replacement).await {
                return Err(StoreError::Corruption {
                    decode,
                    recovery_write: Some(Box::new(write_err)),
                });
            }
            Ok(replacement)
        }
        Err(other) => Err(other),
    }
}
