//! The seam to the virtual machine executing replayed messages.

use alloy_primitives::{Address, Bytes, U256};

use crate::{ChainState, EvmError, ReplayError, TraceHooks};

/// A message to execute: either a call to `to` or a contract creation when
/// `to` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallMessage {
    /// Sender of the message.
    pub from: Address,
    /// Destination, `None` for contract creation.
    pub to: Option<Address>,
    /// Transferred value in wei.
    pub value: U256,
    /// Call data or init code.
    pub input: Bytes,
    /// Gas limit for the whole message.
    pub gas_limit: u64,
}

impl CallMessage {
    /// A plain call message with no value.
    pub fn call(from: Address, to: Address, input: Bytes, gas_limit: u64) -> Self {
        Self { from, to: Some(to), value: U256::ZERO, input, gas_limit }
    }
}

/// The result of executing one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Return or revert data of the top-level frame.
    pub output: Bytes,
    /// Gas consumed by the message.
    pub gas_used: u64,
    /// Execution error of the top-level frame, if any. Frame-level failures
    /// land here rather than in `Err`: the trace is still finalized.
    pub error: Option<EvmError>,
}

/// An execution engine able to run one message against a [`ChainState`]
/// while driving the [`TraceHooks`] surface.
///
/// The engine owns instruction dispatch, gas accounting, and its own state
/// journal; on frame failure it must roll its journal back *before* firing
/// the matching exit hook. `Err` is reserved for fatal engine conditions
/// (malformed message, inconsistent substate) that abort the transaction.
pub trait ExecutionEngine {
    /// Executes `msg`, firing hooks as execution proceeds.
    fn execute(
        &mut self,
        chain: &mut dyn ChainState,
        hooks: &mut dyn TraceHooks,
        msg: &CallMessage,
    ) -> Result<ExecutionOutcome, ReplayError>;
}
