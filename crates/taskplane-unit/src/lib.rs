//! taskplane unit daemon library.
//!
//! A unit connects to its hub once at startup and serves requests over
//! that single connection: it keeps per-folder workspaces under a work
//! directory, accepts multi-part file transfers into them, runs child
//! processes there, and streams their output and exit status back.
//!
//! The binary in `main.rs` is a thin shell; the pieces live here so the
//! integration suite can drive a real unit in-process:
//!
//! - [`client`]: the framed TCP transport towards the hub
//! - [`dispatch`]: the request loop and per-variant handlers
//! - [`folder`]: the folder registry and its dependent tracking
//! - [`fsops`]: bounded recursive tree removal
//! - [`transfer`]: the multi-part file-transfer engine
//! - [`process`]: the child-process engine
//! - [`state`]: wiring and cross-subsystem orchestration

pub mod client;
pub mod dispatch;
pub mod folder;
pub mod fsops;
pub mod process;
pub mod state;
pub mod transfer;
