//! The capability seam between the tracing engine and the execution backend.

use alloy_primitives::{Address, Bytes, B256, U256};
use auto_impl::auto_impl;

use crate::{Account, StateMap};

/// Read/write access to the live account state of the execution backend.
///
/// The diffing engine never talks to a concrete VM: the backend exposes its
/// journaled state through this trait, and the lazy loader writes
/// historically fetched values back through it so the VM observes the same
/// ground truth the cache recorded.
///
/// Accounts that were never written read as zero/empty. Getters take
/// `&mut self` because most backends populate internal caches on first
/// access.
#[auto_impl(&mut, Box)]
pub trait ChainState {
    /// Returns the balance of `address`.
    fn balance(&mut self, address: Address) -> U256;

    /// Sets the balance of `address`.
    fn set_balance(&mut self, address: Address, balance: U256);

    /// Returns the nonce of `address`.
    fn nonce(&mut self, address: Address) -> u64;

    /// Sets the nonce of `address`.
    fn set_nonce(&mut self, address: Address, nonce: u64);

    /// Returns the code of `address`, empty if none.
    fn code(&mut self, address: Address) -> Bytes;

    /// Sets the code of `address`.
    fn set_code(&mut self, address: Address, code: Bytes);

    /// Returns the value of `slot` of `address`.
    fn storage(&mut self, address: Address, slot: B256) -> B256;

    /// Sets the value of `slot` of `address`.
    fn set_storage(&mut self, address: Address, slot: B256, value: B256);
}

/// Extension helpers over [`ChainState`].
pub trait ChainStateExt: ChainState {
    /// Reads the full observed state of `address` (balance, nonce, code; no
    /// storage slots).
    fn read_account(&mut self, address: Address) -> Account {
        Account {
            balance: Some(self.balance(address)),
            nonce: self.nonce(address),
            code: self.code(address),
            storage: Default::default(),
        }
    }

    /// Writes an allocation table into the backend, the way a replay harness
    /// seeds provided prestate before execution.
    fn apply_alloc(&mut self, alloc: &StateMap) {
        for (address, account) in alloc {
            if let Some(balance) = account.balance {
                self.set_balance(*address, balance);
            }
            self.set_nonce(*address, account.nonce);
            if !account.code.is_empty() {
                self.set_code(*address, account.code.clone());
            }
            for (slot, value) in &account.storage {
                self.set_storage(*address, *slot, *value);
            }
        }
    }
}

impl<T: ChainState + ?Sized> ChainStateExt for T {}
