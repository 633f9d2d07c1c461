//! Core building blocks for the taskplane control plane.
//!
//! The hub and the unit speak a single-connection request/reply protocol:
//! protobuf messages, COBS-stuffed and delimited by a zero byte on the
//! wire. This crate holds everything both sides share:
//!
//! - [`cobs`]: the byte-stuffing codec and the [`cobs::CobsCodec`] framing
//!   layer for `tokio_util::codec::Framed`
//! - [`wire`]: the protobuf message types (hand-written prost derives kept
//!   in sync with `proto/taskplane.proto`)
//! - [`error`]: the closed protocol error set
//! - [`hash`]: the FNV-1a integrity hash used by file transfers
//! - [`arena`]: bounded per-request scratch memory
//! - [`clock`]: the monotonic clock that stamps replies
//! - [`sync`]: single-threaded async primitives (queue, once-cell,
//!   per-resource FIFO, refcounted map with deferred async destruction)
//! - [`task`]: per-connection request task group with graceful drain
//!
//! Everything here assumes a current-thread tokio runtime driving a
//! `LocalSet`; none of the types are `Send` and none need to be.

pub mod arena;
pub mod clock;
pub mod cobs;
pub mod error;
pub mod hash;
pub mod sync;
pub mod task;
pub mod wire;

pub use arena::{ScratchArena, Span};
pub use clock::MonotonicClock;
pub use cobs::{CobsCodec, CobsError, DEFAULT_MAX_FRAME_SIZE};
pub use error::{ErrorKind, Result};
pub use hash::Fnv1a;
