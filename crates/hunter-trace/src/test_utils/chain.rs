//! In-memory chain state for tests.

use alloy_primitives::{
    map::{AddressHashMap, B256HashMap},
    Address, Bytes, B256, U256,
};

use crate::ChainState;

#[derive(Clone, Debug, Default)]
struct MemAccount {
    balance: U256,
    nonce: u64,
    code: Bytes,
    storage: B256HashMap<B256>,
}

/// A [`ChainState`] backed by plain maps, with builder-style seeding.
#[derive(Clone, Debug, Default)]
pub struct MemoryChainState {
    accounts: AddressHashMap<MemAccount>,
}

impl MemoryChainState {
    /// Seeds the balance of `address`.
    pub fn with_balance(mut self, address: Address, balance: U256) -> Self {
        self.accounts.entry(address).or_default().balance = balance;
        self
    }

    /// Seeds the nonce of `address`.
    pub fn with_nonce(mut self, address: Address, nonce: u64) -> Self {
        self.accounts.entry(address).or_default().nonce = nonce;
        self
    }

    /// Seeds the code of `address`.
    pub fn with_code(mut self, address: Address, code: Bytes) -> Self {
        self.accounts.entry(address).or_default().code = code;
        self
    }

    /// Seeds one storage slot of `address`.
    pub fn with_storage(mut self, address: Address, slot: B256, value: B256) -> Self {
        self.accounts.entry(address).or_default().storage.insert(slot, value);
        self
    }
}

impl ChainState for MemoryChainState {
    fn balance(&mut self, address: Address) -> U256 {
        self.accounts.get(&address).map(|account| account.balance).unwrap_or_default()
    }

    fn set_balance(&mut self, address: Address, balance: U256) {
        self.accounts.entry(address).or_default().balance = balance;
    }

    fn nonce(&mut self, address: Address) -> u64 {
        self.accounts.get(&address).map(|account| account.nonce).unwrap_or_default()
    }

    fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.accounts.entry(address).or_default().nonce = nonce;
    }

    fn code(&mut self, address: Address) -> Bytes {
        self.accounts.get(&address).map(|account| account.code.clone()).unwrap_or_default()
    }

    fn set_code(&mut self, address: Address, code: Bytes) {
        self.accounts.entry(address).or_default().code = code;
    }

    fn storage(&mut self, address: Address, slot: B256) -> B256 {
        self.accounts
            .get(&address)
            .and_then(|account| account.storage.get(&slot))
            .copied()
            .unwrap_or_default()
    }

    fn set_storage(&mut self, address: Address, slot: B256, value: B256) {
        self.accounts.entry(address).or_default().storage.insert(slot, value);
    }
}
