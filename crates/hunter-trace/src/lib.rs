//! Replay engine for historical transactions: builds a call-tree trace
//! annotated with exactly the account state (balances, nonces, code, storage
//! slots) each call frame read or wrote, before and after execution.
//!
//! The virtual machine itself is an external collaborator. It drives the
//! [`TraceHooks`] callback surface and exposes its account state through the
//! [`ChainState`] capability. Everything else lives here: lazy state
//! materialization, per-field touch tracking, call-boundary snapshots, and
//! per-frame pre/post-state reconstruction.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod account;
pub use account::*;

mod chain;
pub use chain::*;

mod diff;
pub use diff::*;

mod engine;
pub use engine::*;

mod error;
pub use error::*;

mod frame;
pub use frame::*;

mod hooks;
pub use hooks::*;

mod opcode;
pub use opcode::*;

mod provider;
pub use provider::*;

mod session;
pub use session::*;

mod token;
pub use token::*;

mod touch;
pub use touch::*;

mod tracer;
pub use tracer::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;
