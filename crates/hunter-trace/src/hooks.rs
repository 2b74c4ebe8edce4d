//! The fixed callback surface the execution engine drives.
//!
//! The engine owns instruction dispatch and gas accounting; the tracer only
//! observes. Hooks run synchronously on the execution thread, in the order
//! the engine encounters the corresponding events. The engine fires
//! `capture_start`/`capture_enter` *after* it has applied the intrinsic
//! nonce increment and value transfer for the call, so the live state a hook
//! observes already reflects the incoming transfer.

use alloy_primitives::{Address, U256};
use thiserror::Error;

use crate::{CallKind, ChainState, Op};

/// An error produced by the execution engine for a single frame.
///
/// Execution errors never abort diff recording: the frame is finalized with
/// the error attached and the tree is still persisted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvmError {
    /// `REVERT` was executed; the output carries the revert data.
    #[error("execution reverted")]
    Reverted,
    /// The frame ran out of gas.
    #[error("out of gas")]
    OutOfGas,
    /// The call stack limit was exceeded.
    #[error("max call depth exceeded")]
    DepthExceeded,
    /// The caller could not cover the transferred value.
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    /// Any other engine-reported failure.
    #[error("{0}")]
    Other(String),
}

impl EvmError {
    /// Whether this is a deliberate revert (output data is meaningful).
    pub const fn is_revert(&self) -> bool {
        matches!(self, Self::Reverted)
    }
}

/// Per-opcode context handed to [`TraceHooks::capture_state`].
///
/// Stack and memory are borrowed views into the interpreter scope; the stack
/// is ordered bottom to top.
#[derive(Debug)]
pub struct OpContext<'a> {
    /// Program counter of the instruction.
    pub pc: u64,
    /// The opcode about to execute.
    pub op: Op,
    /// Gas remaining before the instruction.
    pub gas: u64,
    /// Total gas cost of the instruction.
    pub cost: u64,
    /// Call depth, 0 for the top-level frame.
    pub depth: usize,
    /// Address of the executing contract.
    pub address: Address,
    /// Interpreter stack, bottom to top.
    pub stack: &'a [U256],
    /// Interpreter memory.
    pub memory: &'a [u8],
}

impl OpContext<'_> {
    /// Returns the `n`-th stack item from the top, if present.
    pub fn stack_back(&self, n: usize) -> Option<U256> {
        self.stack.len().checked_sub(n + 1).map(|i| self.stack[i])
    }

    /// Copies `size` bytes of memory starting at `offset`, zero-padded past
    /// the end of live memory. Returns `None` for unrealistically large
    /// reads, which indicate a garbage stack rather than a real access.
    pub fn memory_copy_padded(&self, offset: U256, size: U256) -> Option<Vec<u8>> {
        const MAX_COPY: u64 = 1 << 32;
        let size = u64::try_from(size).ok().filter(|s| *s < MAX_COPY)? as usize;
        if size == 0 {
            return Some(Vec::new());
        }
        let offset = u64::try_from(offset).ok().filter(|o| *o < MAX_COPY)? as usize;

        let mut out = vec![0u8; size];
        if offset < self.memory.len() {
            let available = self.memory.len() - offset;
            let n = available.min(size);
            out[..n].copy_from_slice(&self.memory[offset..offset + n]);
        }
        Some(out)
    }
}

/// Execution hooks consumed by the tracing core.
///
/// Mirrors the classic logger surface of EVM implementations: paired
/// start/end for the top-level call, paired enter/exit for every nested
/// scope (fired even when the scope executes no code), a per-opcode hook,
/// and a fault hook for instructions that fail after being logged.
///
/// All methods default to no-ops so partial observers stay small.
pub trait TraceHooks {
    /// A transaction is about to execute with the given gas limit.
    fn capture_tx_start(&mut self, _gas_limit: u64) {}

    /// The transaction finished with `rest_gas` unconsumed.
    fn capture_tx_end(&mut self, _rest_gas: u64) {}

    /// The top-level call begins.
    #[allow(clippy::too_many_arguments)]
    fn capture_start(
        &mut self,
        _chain: &mut dyn ChainState,
        _from: Address,
        _to: Address,
        _create: bool,
        _input: &[u8],
        _gas: u64,
        _value: U256,
    ) {
    }

    /// The top-level call finished.
    fn capture_end(
        &mut self,
        _chain: &mut dyn ChainState,
        _output: &[u8],
        _gas_used: u64,
        _err: Option<&EvmError>,
    ) {
    }

    /// A nested scope is entered (call, create, or selfdestruct).
    #[allow(clippy::too_many_arguments)]
    fn capture_enter(
        &mut self,
        _chain: &mut dyn ChainState,
        _kind: CallKind,
        _from: Address,
        _to: Address,
        _input: &[u8],
        _gas: u64,
        _value: U256,
    ) {
    }

    /// The innermost open scope exited. When `err` is set, the engine has
    /// already rolled its own journal back to the pre-call state.
    fn capture_exit(
        &mut self,
        _chain: &mut dyn ChainState,
        _output: &[u8],
        _gas_used: u64,
        _err: Option<&EvmError>,
    ) {
    }

    /// A single instruction is about to execute.
    fn capture_state(&mut self, _chain: &mut dyn ChainState, _ctx: &OpContext<'_>) {}

    /// An instruction failed after `capture_state` already ran for it.
    fn capture_fault(&mut self, _chain: &mut dyn ChainState, _ctx: &OpContext<'_>, _err: &EvmError) {
    }
}

/// A hooks implementation that observes nothing.
///
/// Used where the engine surface requires hooks but the caller only wants
/// the execution result, e.g. the read-only token balance probes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl TraceHooks for NoopHooks {}
