//! `docstore` is a single-process, typed, on-disk key-value *document*
//! store: it holds exactly one logical value of an application-chosen
//! type, persists it durably to a regular file, serves a live stream of
//! the current value to any number of concurrent observers, and applies
//! read-modify-write transforms with strict serialization.
//!
//! It is meant to be embedded inside a larger async application rather
//! than used as a standalone binary.
//!
//! The moving parts:
//!
//! - [`Serializer`] encodes/decodes the value and supplies a default.
//! - [`CorruptionHandler`] produces a replacement value when decoding
//!   reports corruption.
//! - [`FileBackend`] is the filesystem collaborator; [`StdFileBackend`]
//!   is the real one, but tests can swap in an in-memory fake.
//! - [`StoreBuilder`] assembles the above (plus optional init tasks and a
//!   `CancellationToken`) into a running [`Store`].
//! - [`Store::observe`] and [`Store::update`] are the two ways callers
//!   touch the value: a live stream, and a serialized read-modify-write.
//!
//! Multi-process safety is out of scope — external exclusion over the
//! target file is the caller's responsibility. This engine is
//! per-file-per-type: keyed or multi-file storage, schema evolution,
//! encryption, compression, and indexing are likewise out of scope.

mod backend;
mod cache;
mod engine;
mod error;
mod fingerprint;
mod init;
mod reader;
mod serializer;
mod slot;
mod store;
mod writer;

pub use backend::{FileBackend, StdFileBackend};
pub use error::{BackendError, CodecError, StoreError, UpdateError};
pub use init::{InitCapability, InitTask};
pub use serializer::{CorruptionHandler, ResetTo, Serializer};
pub use store::{Store, StoreBuilder};
