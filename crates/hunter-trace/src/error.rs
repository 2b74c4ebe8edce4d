//! Error types for the replay engine.

use thiserror::Error;

use crate::{EvmError, ProviderError, ReplayPosition};

/// Top-level error of a transaction replay.
///
/// Programming invariants (reverting into a snapshot that was never taken,
/// frame-stack underflow) are *not* represented here: they indicate
/// call-stack bookkeeping bugs and panic instead.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The historical data provider failed while strict mode was enabled.
    /// With strict mode off, provider errors degrade to zero-value
    /// fallbacks and never surface here.
    #[error("historical provider: {0}")]
    Provider(#[from] ProviderError),

    /// The engine reported a fatal condition outside any frame.
    #[error("execution: {0}")]
    Execution(#[from] EvmError),

    /// Serializing or deserializing a trace tree failed.
    #[error("trace serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading or writing a trace dump failed.
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),

    /// Transactions of a block must replay strictly in index order against
    /// one continuously evolving state.
    #[error("transaction replayed out of order: {next} after {prev}")]
    OutOfOrder {
        /// Position of the previously finalized transaction.
        prev: ReplayPosition,
        /// Position of the transaction that was submitted next.
        next: ReplayPosition,
    },
}
