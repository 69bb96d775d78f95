use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::{CodecError, StoreError};

/// Encodes and decodes a value to/from a byte stream, and supplies the
/// default value used when the target file does not exist yet.
///
/// `encode` is handed a non-closing sink (see [`crate::backend::NonClosingWriter`]):
/// the engine, not the serializer, owns when the underlying file handle is
/// closed, so implementations must not assume ownership of the writer.
#[async_trait]
pub trait Serializer<T>: Send + Sync + 'static {
    /// The value used when the target file is absent.
    fn default_value(&self) -> T;

    /// Decode a complete buffer into a value, or report corruption.
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Encode `value` into `writer`. Implementations should not call
    /// `shutdown`/`flush` expecting it to close anything — the sink ignores
    /// `shutdown` by design.
    async fn encode(
        &self,
        value: &T,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> std::io::Result<()>;
}

/// Produces a replacement value when the decoder reports corruption.
/// Called at most once per cache-miss cycle.
#[async_trait]
pub trait CorruptionHandler<T>: Send + Sync + 'static {
    async fn handle(&self, corruption: CodecError) -> Result<T, StoreError>;
}

/// A corruption handler that always resets to a fixed replacement value.
/// The common case for stores whose "default" and "recovery" values
/// coincide; named explicitly so callers don't need to write it themselves.
pub struct ResetTo<T>(pub T);

#[async_trait]
impl<T> CorruptionHandler<T> for ResetTo<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, _corruption: CodecError) -> Result<T, StoreError> {
        Ok(self.0.clone())
    }
}

/// A minimal [`Serializer`] for `i32`, shared by this crate's own unit
/// tests so each module doesn't need to invent its own. Encodes as plain
/// decimal ASCII; a byte string that doesn't parse is reported as
/// corruption rather than an `expect`/`unwrap` panic.
#[cfg(test)]
pub(crate) mod fake {
    use tokio::io::AsyncWriteExt;

    use super::*;

    pub(crate) struct PlainIntSerializer;

    #[async_trait]
    impl Serializer<i32> for PlainIntSerializer {
        fn default_value(&self) -> i32 {
            0
        }

        fn decode(&self, bytes: &[u8]) -> Result<i32, CodecError> {
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| CodecError::new(format!("not a valid i32: {:?}", bytes)))
        }

        async fn encode(&self, value: &i32, writer: &mut (dyn AsyncWrite + Unpin + Send)) -> std::io::Result<()> {
            writer.write_all(value.to_string().as_bytes()).await
        }
    }
}
