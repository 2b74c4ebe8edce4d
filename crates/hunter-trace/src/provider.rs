//! Historical chain data lookups.
//!
//! The lazy loader asks for account fields "as of one block before" the
//! block being replayed: replaying a transaction must never observe effects
//! of the same block's later execution. The subtraction happens inside the
//! provider so every caller gets the same semantics.

use std::{future::Future, thread};

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::{Block, Header, TransactionReceipt};
use auto_impl::auto_impl;
use thiserror::Error;
use url::Url;

/// Errors reported by a historical data source.
///
/// Callers treat these as "value unknown" and proceed with a zero-valued
/// fallback unless strict mode is enabled.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The configured endpoint URL could not be parsed.
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    /// The underlying transport failed.
    #[error("transport: {0}")]
    Transport(String),
    /// The blocking bridge onto the async client failed.
    #[error("rpc bridge: {0}")]
    Bridge(String),
}

/// Result alias for provider lookups.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A source of historical account state.
///
/// All lookups answer "as of one block before `block`". Implementations are
/// stateless request/response clients and must be safe for concurrent use
/// by parallel replay workers.
#[auto_impl(&, Arc)]
pub trait HistoricalSource: Send + Sync {
    /// Value of `slot` of `address` before `block` executed.
    fn storage_at(&self, address: Address, slot: B256, block: u64) -> ProviderResult<B256>;

    /// Code of `address` before `block` executed.
    fn code_at(&self, address: Address, block: u64) -> ProviderResult<Bytes>;

    /// Nonce of `address` before `block` executed.
    fn nonce_at(&self, address: Address, block: u64) -> ProviderResult<u64>;

    /// Balance of `address` before `block` executed.
    fn balance_at(&self, address: Address, block: u64) -> ProviderResult<U256>;
}

/// A [`HistoricalSource`] backed by an Ethereum JSON-RPC endpoint.
///
/// The replay hooks run synchronously on the execution thread, so lookups
/// bridge onto a dedicated tokio runtime. Each lookup blocks until the
/// endpoint answers; no timeout is enforced beyond the transport's own.
#[derive(Debug)]
pub struct RpcProvider {
    inner: RootProvider,
    runtime: tokio::runtime::Runtime,
}

impl RpcProvider {
    /// Connects to the given JSON-RPC endpoint.
    pub fn connect(endpoint: &str) -> ProviderResult<Self> {
        let url: Url =
            endpoint.parse().map_err(|_| ProviderError::InvalidEndpoint(endpoint.to_owned()))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|err| ProviderError::Bridge(err.to_string()))?;
        Ok(Self { inner: RootProvider::new_http(url), runtime })
    }

    /// Runs a future to completion on the bridge runtime.
    ///
    /// The future is driven from a fresh thread so the bridge also works
    /// when the caller itself sits inside an async runtime.
    fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        thread::scope(|scope| {
            scope
                .spawn(|| self.runtime.block_on(fut))
                .join()
                .expect("rpc bridge thread panicked")
        })
    }

    fn transport<T>(result: Result<T, impl std::fmt::Display>) -> ProviderResult<T> {
        result.map_err(|err| ProviderError::Transport(err.to_string()))
    }

    /// Fetches a block by number, with transaction hashes only.
    pub fn block_by_number(&self, number: u64) -> ProviderResult<Option<Block>> {
        Self::transport(self.block_on(
            self.inner.raw_request("eth_getBlockByNumber".into(), (format!("0x{number:x}"), false)),
        ))
    }

    /// Fetches a block header by number.
    pub fn header_by_number(&self, number: u64) -> ProviderResult<Option<Header>> {
        let block = self.block_by_number(number)?;
        Ok(block.map(|block| block.header))
    }

    /// Fetches the receipt of a transaction, used to locate its block and
    /// index when replaying by hash.
    pub fn transaction_receipt(&self, hash: B256) -> ProviderResult<Option<TransactionReceipt>> {
        Self::transport(
            self.block_on(self.inner.raw_request("eth_getTransactionReceipt".into(), (hash,))),
        )
    }
}

impl HistoricalSource for RpcProvider {
    fn storage_at(&self, address: Address, slot: B256, block: u64) -> ProviderResult<B256> {
        let value = Self::transport(self.block_on(
            self.inner
                .get_storage_at(address, slot.into())
                .block_id(block.saturating_sub(1).into()),
        ))?;
        Ok(B256::from(value))
    }

    fn code_at(&self, address: Address, block: u64) -> ProviderResult<Bytes> {
        Self::transport(
            self.block_on(
                self.inner.get_code_at(address).block_id(block.saturating_sub(1).into()),
            ),
        )
    }

    fn nonce_at(&self, address: Address, block: u64) -> ProviderResult<u64> {
        Self::transport(self.block_on(
            self.inner.get_transaction_count(address).block_id(block.saturating_sub(1).into()),
        ))
    }

    fn balance_at(&self, address: Address, block: u64) -> ProviderResult<U256> {
        Self::transport(
            self.block_on(self.inner.get_balance(address).block_id(block.saturating_sub(1).into())),
        )
    }
}
