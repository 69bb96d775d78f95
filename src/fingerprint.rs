use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use crate::error::StoreError;
use crate::serializer::Serializer;

/// An in-memory `AsyncWrite` sink, used only to capture the serializer's
/// canonical byte representation of a value for fingerprinting.
struct MemSink(Vec<u8>);

impl AsyncWrite for MemSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A deterministic hash of a value, captured at the moment a cache entry is
/// created. Computed by encoding the value through the serializer and
/// hashing the resulting bytes with BLAKE3.
pub type Fingerprint = [u8; 32];

pub async fn compute<T>(
    serializer: &dyn Serializer<T>,
    value: &T,
) -> Result<Fingerprint, StoreError> {
    let mut sink = MemSink(Vec::new());
    serializer
        .encode(value, &mut sink)
        .await
        .map_err(|e| StoreError::Io(e.into()))?;
    Ok(blake3::hash(&sink.0).into())
}
