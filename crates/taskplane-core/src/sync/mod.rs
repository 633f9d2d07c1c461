//! Single-threaded async primitives.
//!
//! Everything in here is built for one current-thread runtime driving a
//! `LocalSet`: interior mutability is `RefCell`/`Cell`, sharing is `Rc`,
//! and nothing is `Send`. The primitives encode the concurrency contracts
//! the subsystems rely on:
//!
//! - [`AsyncQueue`]: FIFO event stream with a terminal value every
//!   current and future consumer observes
//! - [`OnceValue`]: single-shot broadcast cell
//! - [`SenderFifo`]: serialises operations on a shared resource in
//!   arrival order
//! - [`AsyncMap`] / [`AsyncPtr`]: refcounted storage whose cells are
//!   destroyed by an asynchronous `destroy` task after the last handle
//!   drops, never while one is live

mod async_map;
mod fifo;
mod once_value;
mod queue;

pub use async_map::{AsyncDestroy, AsyncMap, AsyncPtr};
pub use fifo::SenderFifo;
pub use once_value::OnceValue;
pub use queue::AsyncQueue;
