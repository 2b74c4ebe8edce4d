//! The replay session: owns the touch cache across a block or batch and
//! turns engine executions into finished [`Transaction`] trees.

use std::sync::Arc;

use alloy_primitives::{map::AddressHashSet, Address, B256};

use crate::{
    CallMessage, ChainState, ChainStateExt, ExecutionEngine, HistoricalSource, LoadMode,
    ReplayError, ReplayPosition, RpcProvider, StateMap, TokenFlows, TouchedState, Transaction,
    TxTracer,
};

/// Configuration of a replay session.
#[derive(Clone, Debug, Default)]
pub struct ReplayConfig {
    /// Addresses whose frames get pre/post-state recording.
    pub watched: AddressHashSet,
    /// Master switch for state recording; enabled by [`watch`](Self::watch).
    pub record_state: bool,
    /// Historical RPC endpoint for lazy fetches.
    pub rpc_endpoint: Option<String>,
    /// Where ground truth comes from.
    pub mode: LoadMode,
    /// Turn soft provider errors into hard replay failures.
    pub fail_fast: bool,
}

impl ReplayConfig {
    /// Creates an empty configuration: no watched addresses, provided
    /// prestate only, best-effort provider errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `address` to the watch list and enables state recording.
    pub fn watch(mut self, address: Address) -> Self {
        self.watched.insert(address);
        self.record_state = true;
        self
    }

    /// Configures a historical RPC endpoint and switches to lazy fetching.
    pub fn with_rpc_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rpc_endpoint = Some(endpoint.into());
        self.mode = LoadMode::LazyFetch;
        self
    }

    /// Makes provider errors abort the replay instead of degrading to
    /// zero-value fallbacks.
    pub fn with_fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// Position and metadata of one transaction to replay.
#[derive(Clone, Copy, Debug)]
pub struct TxContext {
    /// Number of the containing block.
    pub block_number: u64,
    /// Timestamp of the containing block.
    pub timestamp: u64,
    /// Index of the transaction inside its block.
    pub tx_index: u64,
    /// Hash of the transaction, when known.
    pub tx_hash: Option<B256>,
}

impl TxContext {
    /// The replay position of this transaction.
    pub fn position(&self) -> ReplayPosition {
        ReplayPosition { block: self.block_number, index: self.tx_index }
    }
}

/// One replay session: a touch cache, its committed baseline, and the
/// configuration they operate under.
///
/// A session replays transactions strictly in position order against one
/// continuously evolving chain state; the post-state of transaction `i` is
/// the pre-state of transaction `i + 1`. Parallel workers each own their
/// own session; only the historical source is shared.
#[derive(Debug)]
pub struct ReplaySession {
    touched: TouchedState,
    config: ReplayConfig,
    last_position: Option<ReplayPosition>,
}

impl ReplaySession {
    /// Creates a session, connecting to the configured RPC endpoint if one
    /// is set.
    pub fn new(config: ReplayConfig) -> Result<Self, ReplayError> {
        let source = match &config.rpc_endpoint {
            Some(endpoint) => {
                Some(Arc::new(RpcProvider::connect(endpoint)?) as Arc<dyn HistoricalSource>)
            }
            None => None,
        };
        Ok(Self::with_source(config, source))
    }

    /// Creates a session over an explicit historical source.
    pub fn with_source(
        config: ReplayConfig,
        source: Option<Arc<dyn HistoricalSource>>,
    ) -> Self {
        let mut touched = TouchedState::new();
        if let Some(source) = source {
            touched.set_source(source);
        }
        touched.set_mode(config.mode);
        touched.set_strict(config.fail_fast);
        Self { touched, config, last_position: None }
    }

    /// The session configuration.
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// The touch cache, e.g. for dumping its maps after a batch.
    pub fn touched(&self) -> &TouchedState {
        &self.touched
    }

    /// Seeds the execution backend and the committed baseline from
    /// pre-supplied allocation data, the provided-prestate way of starting
    /// a replay.
    pub fn seed_prestate(&mut self, chain: &mut dyn ChainState, alloc: &StateMap) {
        chain.apply_alloc(alloc);
        self.touched.seed_committed(alloc);
    }

    /// Replays one transaction and returns its finished trace tree.
    ///
    /// Frame-level execution errors (revert, out of gas) do not abort the
    /// replay: the tree is finalized with the error attached to the failing
    /// frame and can still be persisted. `Err` means the engine failed
    /// fatally or a strict-mode provider error fired; callers replaying a
    /// batch stop at the first such error.
    pub fn replay_transaction(
        &mut self,
        engine: &mut dyn ExecutionEngine,
        chain: &mut dyn ChainState,
        ctx: &TxContext,
        msg: &CallMessage,
    ) -> Result<Transaction, ReplayError> {
        let position = ctx.position();
        if let Some(prev) = self.last_position {
            if position <= prev {
                return Err(ReplayError::OutOfOrder { prev, next: position });
            }
        }

        let mut tracer = TxTracer::new(
            &mut self.touched,
            &self.config.watched,
            self.config.record_state,
            ctx.block_number,
        );
        engine.execute(chain, &mut tracer, msg)?;
        let mut root = tracer.into_root()?;

        if self.config.record_state {
            let flows = TokenFlows::collect(&root);
            flows.attach_balance_tables(&mut root, engine)?;
        }

        // checkpoint: refresh the touched values from the backend and make
        // them the new committed baseline for the next transaction
        self.touched.sync_chain_state(chain);
        self.touched.commit();
        self.last_position = Some(position);

        Ok(Transaction {
            tx_hash: ctx.tx_hash,
            block_number: ctx.block_number,
            timestamp: ctx.timestamp,
            tx_index: ctx.tx_index,
            initial_gas: msg.gas_limit,
            call: root,
        })
    }
}
