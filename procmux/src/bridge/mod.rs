//! Wire format for controller-worker communication.
//!
//! # Architecture
//!
//! - **kvvec**: Ordered key/value vectors and their separator-based encoding
//! - **protocol**: Reserved sequences and the typed `Job`/`JobResult` views
//! - **codec**: Delimiter framing codec for AsyncRead/AsyncWrite (worker side)
//!
//! The controller side does its own framing with [`crate::iocache::ByteCache`]
//! because it reads from non-blocking descriptors outside any runtime.

pub mod codec;
pub mod kvvec;
pub mod protocol;

pub use kvvec::{KeyValue, KvVec, Ownership};
pub use protocol::{Job, JobResult, KEY_SEP, MSG_DELIM, PAIR_SEP};
