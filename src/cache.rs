use crate::error::StoreError;
use crate::fingerprint::{self, Fingerprint};
use crate::serializer::Serializer;

/// The last durably observed value together with the fingerprint captured
/// when it was cached. Invariant: whenever this entry is consulted,
/// `fingerprint` must still match `value`'s current hash — a mismatch
/// means the caller mutated a value we handed out.
#[derive(Clone)]
pub struct CachedEntry<T> {
    pub value: T,
    pub fingerprint: Fingerprint,
}

impl<T> CachedEntry<T> {
    pub async fn new(
        serializer: &dyn Serializer<T>,
        value: T,
    ) -> Result<Self, StoreError> {
        let fingerprint = fingerprint::compute(serializer, &value).await?;
        Ok(Self { value, fingerprint })
    }

    /// Re-derive the fingerprint of the held value and compare against the
    /// one captured at creation time. `Err(MutationDetected)` is a fatal
    /// programming error, never an I/O failure.
    pub async fn verify(&self, serializer: &dyn Serializer<T>) -> Result<(), StoreError> {
        let current = fingerprint::compute(serializer, &self.value).await?;
        if current == self.fingerprint {
            Ok(())
        } else {
            Err(StoreError::MutationDetected)
        }
    }
}
