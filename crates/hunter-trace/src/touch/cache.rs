//! The touch cache: which account fields this session has established
//! ground truth for, and what that truth is.

use std::{fmt, fs, path::Path, sync::Arc};

use alloy_primitives::{
    map::{AddressHashMap, B256HashMap},
    Address, Bytes, B256, U256,
};
use serde::{Deserialize, Serialize};

use crate::{ChainState, HistoricalSource, LoadMode, ReplayError, StateMap};

/// Four independent touched-field maps, one per account field kind.
///
/// Presence of a key means "this session has established ground truth for
/// this field"; absence means the field must be lazily loaded before use.
/// `Clone` performs a full deep copy: snapshots taken from these maps never
/// share backing storage with the live cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTouches {
    /// Touched storage slots per account.
    #[serde(rename = "touchedStorageMap")]
    storage: AddressHashMap<B256HashMap<B256>>,
    /// Touched code per account.
    #[serde(rename = "touchedCodeMap")]
    code: AddressHashMap<Bytes>,
    /// Touched nonces per account.
    #[serde(rename = "touchedNonceMap")]
    nonce: AddressHashMap<u64>,
    /// Touched balances per account.
    #[serde(rename = "touchedBalanceMap")]
    balance: AddressHashMap<U256>,
}

impl AccountTouches {
    /// Whether `slot` of `account` has been touched.
    pub fn is_storage_touched(&self, account: Address, slot: B256) -> bool {
        self.storage.get(&account).is_some_and(|slots| slots.contains_key(&slot))
    }

    /// Records the ground-truth value of `slot` of `account`.
    pub fn record_storage(&mut self, account: Address, slot: B256, value: B256) {
        self.storage.entry(account).or_default().insert(slot, value);
    }

    /// Returns the recorded value of `slot` of `account`, zero if untouched.
    pub fn storage(&self, account: Address, slot: B256) -> B256 {
        self.storage
            .get(&account)
            .and_then(|slots| slots.get(&slot))
            .copied()
            .unwrap_or_default()
    }

    /// Returns the touched slots of `account`, if any.
    pub fn storage_slots(&self, account: Address) -> Option<&B256HashMap<B256>> {
        self.storage.get(&account)
    }

    /// Whether the code of `account` has been touched.
    pub fn is_code_touched(&self, account: Address) -> bool {
        self.code.contains_key(&account)
    }

    /// Records the ground-truth code of `account`.
    pub fn record_code(&mut self, account: Address, code: Bytes) {
        self.code.insert(account, code);
    }

    /// Returns the recorded code of `account`, empty if untouched.
    pub fn code(&self, account: Address) -> Bytes {
        self.code.get(&account).cloned().unwrap_or_default()
    }

    /// Whether the nonce of `account` has been touched.
    pub fn is_nonce_touched(&self, account: Address) -> bool {
        self.nonce.contains_key(&account)
    }

    /// Records the ground-truth nonce of `account`.
    pub fn record_nonce(&mut self, account: Address, nonce: u64) {
        self.nonce.insert(account, nonce);
    }

    /// Returns the recorded nonce of `account`, zero if untouched.
    pub fn nonce(&self, account: Address) -> u64 {
        self.nonce.get(&account).copied().unwrap_or_default()
    }

    /// Whether the balance of `account` has been touched.
    pub fn is_balance_touched(&self, account: Address) -> bool {
        self.balance.contains_key(&account)
    }

    /// Records the ground-truth balance of `account`.
    pub fn record_balance(&mut self, account: Address, balance: U256) {
        self.balance.insert(account, balance);
    }

    /// Returns the recorded balance of `account`, zero if untouched.
    pub fn balance(&self, account: Address) -> U256 {
        self.balance.get(&account).copied().unwrap_or_default()
    }

    /// Whether nothing has been touched yet.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
            && self.code.is_empty()
            && self.nonce.is_empty()
            && self.balance.is_empty()
    }

    pub(crate) fn storage_mut(
        &mut self,
    ) -> &mut AddressHashMap<B256HashMap<B256>> {
        &mut self.storage
    }

    pub(crate) fn code_mut(&mut self) -> &mut AddressHashMap<Bytes> {
        &mut self.code
    }

    pub(crate) fn nonce_mut(&mut self) -> &mut AddressHashMap<u64> {
        &mut self.nonce
    }

    pub(crate) fn balance_mut(&mut self) -> &mut AddressHashMap<U256> {
        &mut self.balance
    }
}

/// The touch cache of one replay session: the live touched maps plus the
/// committed baseline they fall back to across reverts.
///
/// Owned by a single replay session for the duration of one block or batch.
/// Parallel workers each own an independent instance; nothing here is
/// shared across threads.
pub struct TouchedState {
    pub(crate) live: AccountTouches,
    pub(crate) committed: AccountTouches,
    pub(crate) source: Option<Arc<dyn HistoricalSource>>,
    pub(crate) mode: LoadMode,
    pub(crate) strict: bool,
}

impl fmt::Debug for TouchedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TouchedState")
            .field("live", &self.live)
            .field("committed", &self.committed)
            .field("has_source", &self.source.is_some())
            .field("mode", &self.mode)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Default for TouchedState {
    fn default() -> Self {
        Self::new()
    }
}

impl TouchedState {
    /// Creates an empty touch cache with no historical source.
    pub fn new() -> Self {
        Self {
            live: AccountTouches::default(),
            committed: AccountTouches::default(),
            source: None,
            mode: LoadMode::PrestateOnly,
            strict: false,
        }
    }

    /// Configures the historical source used for lazy fetches.
    pub fn set_source(&mut self, source: Arc<dyn HistoricalSource>) {
        self.source = Some(source);
    }

    /// Selects between provided-prestate-only and lazy-fetch operation.
    pub fn set_mode(&mut self, mode: LoadMode) {
        self.mode = mode;
    }

    /// When set, provider errors abort the replay instead of degrading to
    /// zero-valued fallbacks.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// The live touched maps.
    pub fn live(&self) -> &AccountTouches {
        &self.live
    }

    /// The committed baseline.
    pub fn committed(&self) -> &AccountTouches {
        &self.committed
    }

    /// Replaces the committed baseline with a deep copy of the live maps.
    ///
    /// Called after a transaction is finalized: from that point on, reverts
    /// that discover fields newer than any call-scoped snapshot fall back to
    /// these values.
    pub fn commit(&mut self) {
        self.committed = self.live.clone();
    }

    /// Seeds the committed baseline from pre-supplied allocation data.
    ///
    /// In provided-prestate mode this is the only source of fallback values.
    pub fn seed_committed(&mut self, alloc: &StateMap) {
        for (address, account) in alloc {
            if let Some(balance) = account.balance {
                self.committed.record_balance(*address, balance);
            }
            self.committed.record_nonce(*address, account.nonce);
            self.committed.record_code(*address, account.code.clone());
            for (slot, value) in &account.storage {
                self.committed.record_storage(*address, *slot, *value);
            }
        }
    }

    /// Refreshes every touched live value from the execution backend.
    ///
    /// Used between transactions of a block: the post-state of transaction
    /// `i` becomes the pre-state of transaction `i + 1`.
    pub fn sync_chain_state(&mut self, chain: &mut dyn ChainState) {
        for (account, slots) in self.live.storage_mut().iter_mut() {
            for (slot, value) in slots.iter_mut() {
                *value = chain.storage(*account, *slot);
            }
        }
        for (account, code) in self.live.code_mut().iter_mut() {
            *code = chain.code(*account);
        }
        for (account, balance) in self.live.balance_mut().iter_mut() {
            *balance = chain.balance(*account);
        }
        for (account, nonce) in self.live.nonce_mut().iter_mut() {
            *nonce = chain.nonce(*account);
        }
    }

    /// Serializes the live touched maps to a JSON file for offline
    /// inspection.
    pub fn dump_snapshot(&self, path: &Path) -> Result<(), ReplayError> {
        let json = serde_json::to_vec(&self.live)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryChainState;
    use alloy_primitives::address;

    const ACCOUNT: Address = address!("0x00000000000000000000000000000000000000aa");

    #[test]
    fn untouched_fields_read_as_zero() {
        let touches = AccountTouches::default();
        assert!(!touches.is_balance_touched(ACCOUNT));
        assert_eq!(touches.balance(ACCOUNT), U256::ZERO);
        assert_eq!(touches.storage(ACCOUNT, B256::ZERO), B256::ZERO);
        assert!(touches.code(ACCOUNT).is_empty());
    }

    #[test]
    fn commit_takes_an_independent_copy() {
        let mut state = TouchedState::new();
        state.live.record_balance(ACCOUNT, U256::from(7));
        state.commit();
        state.live.record_balance(ACCOUNT, U256::from(9));
        assert_eq!(state.committed().balance(ACCOUNT), U256::from(7));
        assert_eq!(state.live().balance(ACCOUNT), U256::from(9));
    }

    #[test]
    fn sync_refreshes_touched_values_only() {
        let slot = B256::with_last_byte(1);
        let mut chain = MemoryChainState::default()
            .with_balance(ACCOUNT, U256::from(100))
            .with_storage(ACCOUNT, slot, B256::with_last_byte(5));

        let mut state = TouchedState::new();
        state.live.record_balance(ACCOUNT, U256::ZERO);
        state.live.record_storage(ACCOUNT, slot, B256::ZERO);
        state.sync_chain_state(&mut chain);

        assert_eq!(state.live().balance(ACCOUNT), U256::from(100));
        assert_eq!(state.live().storage(ACCOUNT, slot), B256::with_last_byte(5));
        // untouched fields stay untouched
        assert!(!state.live().is_nonce_touched(ACCOUNT));
    }
}
