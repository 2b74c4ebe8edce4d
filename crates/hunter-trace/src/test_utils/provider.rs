//! A canned historical source with fetch counters.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloy_primitives::{Address, Bytes, B256, U256};

use crate::{HistoricalSource, ProviderError, ProviderResult};

/// A [`HistoricalSource`] answering from fixed maps, counting every fetch.
///
/// Unset values answer as zero/empty, like an archive node would for an
/// untouched account. [`failing`](Self::failing) builds a source whose every
/// lookup errors, for exercising the soft-failure and strict paths.
#[derive(Debug, Default)]
pub struct StaticSource {
    storage: HashMap<(Address, B256), B256>,
    code: HashMap<Address, Bytes>,
    nonce: HashMap<Address, u64>,
    balance: HashMap<Address, U256>,
    fail: bool,
    storage_fetches: AtomicUsize,
    code_fetches: AtomicUsize,
    nonce_fetches: AtomicUsize,
    balance_fetches: AtomicUsize,
}

impl StaticSource {
    /// A source whose every lookup fails.
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    /// Seeds a storage slot.
    pub fn with_storage(mut self, address: Address, slot: B256, value: B256) -> Self {
        self.storage.insert((address, slot), value);
        self
    }

    /// Seeds an account's code.
    pub fn with_code(mut self, address: Address, code: Bytes) -> Self {
        self.code.insert(address, code);
        self
    }

    /// Seeds an account's nonce.
    pub fn with_nonce(mut self, address: Address, nonce: u64) -> Self {
        self.nonce.insert(address, nonce);
        self
    }

    /// Seeds an account's balance.
    pub fn with_balance(mut self, address: Address, balance: U256) -> Self {
        self.balance.insert(address, balance);
        self
    }

    /// Number of storage lookups served so far.
    pub fn storage_fetches(&self) -> usize {
        self.storage_fetches.load(Ordering::Relaxed)
    }

    /// Number of code lookups served so far.
    pub fn code_fetches(&self) -> usize {
        self.code_fetches.load(Ordering::Relaxed)
    }

    /// Number of nonce lookups served so far.
    pub fn nonce_fetches(&self) -> usize {
        self.nonce_fetches.load(Ordering::Relaxed)
    }

    /// Number of balance lookups served so far.
    pub fn balance_fetches(&self) -> usize {
        self.balance_fetches.load(Ordering::Relaxed)
    }

    fn answer<T>(&self, value: T) -> ProviderResult<T> {
        if self.fail {
            return Err(ProviderError::Transport("injected failure".into()));
        }
        Ok(value)
    }
}

impl HistoricalSource for StaticSource {
    fn storage_at(&self, address: Address, slot: B256, _block: u64) -> ProviderResult<B256> {
        self.storage_fetches.fetch_add(1, Ordering::Relaxed);
        self.answer(self.storage.get(&(address, slot)).copied().unwrap_or_default())
    }

    fn code_at(&self, address: Address, _block: u64) -> ProviderResult<Bytes> {
        self.code_fetches.fetch_add(1, Ordering::Relaxed);
        self.answer(self.code.get(&address).cloned().unwrap_or_default())
    }

    fn nonce_at(&self, address: Address, _block: u64) -> ProviderResult<u64> {
        self.nonce_fetches.fetch_add(1, Ordering::Relaxed);
        self.answer(self.nonce.get(&address).copied().unwrap_or_default())
    }

    fn balance_at(&self, address: Address, _block: u64) -> ProviderResult<U256> {
        self.balance_fetches.fetch_add(1, Ordering::Relaxed);
        self.answer(self.balance.get(&address).copied().unwrap_or_default())
    }
}
