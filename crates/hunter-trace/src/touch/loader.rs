//! Lazy materialization of account state on first touch.
//!
//! Every access path seeds the committed baseline alongside the live map,
//! so later reverts always have a consistent fallback for keys discovered
//! inside the reverted scope.

use alloy_primitives::{Address, B256};
use bitflags::bitflags;
use tracing::warn;

use crate::{ChainState, ProviderError, ReplayError, TouchedState};

/// Selects where ground truth comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Rely solely on pre-supplied allocation data; never fetch.
    #[default]
    PrestateOnly,
    /// Fetch untouched fields from the historical source on first access.
    LazyFetch,
}

bitflags! {
    /// Bitmap of account fields for grouped load/refresh operations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccountFields: u8 {
        /// The account balance.
        const BALANCE = 1 << 0;
        /// The account nonce.
        const NONCE = 1 << 1;
        /// The account code.
        const CODE = 1 << 2;
    }
}

impl TouchedState {
    fn lazy_fetch_enabled(&self) -> bool {
        self.mode == LoadMode::LazyFetch && self.source.is_some()
    }

    /// Whether reverts must also write restored values back into the
    /// execution backend. Required whenever lazy fetches seeded the backend
    /// directly.
    pub fn resync_on_revert(&self) -> bool {
        self.lazy_fetch_enabled()
    }

    /// Soft-failure policy for provider errors: log and fall back to the
    /// zero value, or abort when strict mode is on. The zero fallback is a
    /// deliberate best-effort tradeoff and a documented source of
    /// silently-incorrect traces with a flaky provider.
    fn provider_miss(
        &self,
        field: &'static str,
        account: Address,
        err: ProviderError,
    ) -> Result<(), ReplayError> {
        if self.strict {
            return Err(err.into());
        }
        warn!(%account, field, %err, "historical lookup failed, proceeding with zero value");
        Ok(())
    }

    /// Materializes `slot` of `account` for a read.
    ///
    /// No-op when already touched. Otherwise the historical value as of the
    /// block preceding `block` is written into both the execution backend
    /// and the touched maps.
    pub fn ensure_storage_loaded(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        slot: B256,
        block: u64,
    ) -> Result<(), ReplayError> {
        if self.live.is_storage_touched(account, slot) {
            return Ok(());
        }
        if self.lazy_fetch_enabled() {
            let source = self.source.as_ref().expect("lazy fetch without source");
            match source.storage_at(account, slot, block) {
                Ok(value) => chain.set_storage(account, slot, value),
                Err(err) => self.provider_miss("storage", account, err)?,
            }
        }
        let value = chain.storage(account, slot);
        self.live.record_storage(account, slot, value);
        self.committed.record_storage(account, slot, value);
        Ok(())
    }

    /// Materializes the prior value of `slot` of `account` before a store
    /// overwrites it.
    ///
    /// Only the committed baseline learns the prior value here; the live
    /// map is updated with the written value via [`record_storage_write`]
    /// once the store is known to execute.
    ///
    /// [`record_storage_write`]: Self::record_storage_write
    pub fn prepare_storage_store(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        slot: B256,
        block: u64,
    ) -> Result<(), ReplayError> {
        if self.live.is_storage_touched(account, slot) {
            return Ok(());
        }
        if self.lazy_fetch_enabled() {
            let source = self.source.as_ref().expect("lazy fetch without source");
            match source.storage_at(account, slot, block) {
                Ok(value) => chain.set_storage(account, slot, value),
                Err(err) => self.provider_miss("storage", account, err)?,
            }
        }
        let prior = chain.storage(account, slot);
        self.committed.record_storage(account, slot, prior);
        Ok(())
    }

    /// Records the value a store writes into `slot` of `account`.
    pub fn record_storage_write(&mut self, account: Address, slot: B256, value: B256) {
        self.live.record_storage(account, slot, value);
    }

    /// Materializes the balance of `account`.
    ///
    /// Balance is special-cased: the live map is refreshed from the
    /// execution backend on *every* access, not only the first, because
    /// balance mutates implicitly through value transfers that fire no
    /// opcode hook of their own.
    pub fn ensure_balance_loaded(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        block: u64,
    ) -> Result<(), ReplayError> {
        if !self.live.is_balance_touched(account) {
            if self.lazy_fetch_enabled() {
                let source = self.source.as_ref().expect("lazy fetch without source");
                match source.balance_at(account, block) {
                    Ok(balance) => chain.set_balance(account, balance),
                    Err(err) => self.provider_miss("balance", account, err)?,
                }
            }
            self.committed.record_balance(account, chain.balance(account));
        }
        self.live.record_balance(account, chain.balance(account));
        Ok(())
    }

    /// Materializes the nonce of `account`. Touch-once.
    pub fn ensure_nonce_loaded(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        block: u64,
    ) -> Result<(), ReplayError> {
        if self.live.is_nonce_touched(account) {
            return Ok(());
        }
        if self.lazy_fetch_enabled() {
            let source = self.source.as_ref().expect("lazy fetch without source");
            match source.nonce_at(account, block) {
                Ok(nonce) => chain.set_nonce(account, nonce),
                Err(err) => self.provider_miss("nonce", account, err)?,
            }
        }
        let nonce = chain.nonce(account);
        self.live.record_nonce(account, nonce);
        self.committed.record_nonce(account, nonce);
        Ok(())
    }

    /// Materializes the code of `account`. Touch-once, with one twist: when
    /// the backend lost its copy (a creation was reverted under it) while
    /// the cache still holds recorded code, the recorded code is written
    /// back so later executions see it again.
    pub fn ensure_code_loaded(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        block: u64,
    ) -> Result<(), ReplayError> {
        if !self.live.is_code_touched(account) {
            if self.lazy_fetch_enabled() {
                let source = self.source.as_ref().expect("lazy fetch without source");
                match source.code_at(account, block) {
                    Ok(code) => chain.set_code(account, code),
                    Err(err) => self.provider_miss("code", account, err)?,
                }
            }
            let code = chain.code(account);
            self.live.record_code(account, code.clone());
            self.committed.record_code(account, code);
        } else if chain.code(account).is_empty() && !self.live.code(account).is_empty() {
            chain.set_code(account, self.live.code(account));
        }
        Ok(())
    }

    /// Materializes a group of fields of `account` in one step, as the call
    /// opcodes do for their destination.
    pub fn ensure_account_loaded(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        fields: AccountFields,
        block: u64,
    ) -> Result<(), ReplayError> {
        if fields.contains(AccountFields::CODE) {
            self.ensure_code_loaded(chain, account, block)?;
        }
        if fields.contains(AccountFields::BALANCE) {
            self.ensure_balance_loaded(chain, account, block)?;
        }
        if fields.contains(AccountFields::NONCE) {
            self.ensure_nonce_loaded(chain, account, block)?;
        }
        Ok(())
    }

    /// Re-reads a group of fields of `account` from the execution backend
    /// into the live maps, bypassing the historical source.
    ///
    /// Used after a call succeeds: the backend's post-call values become
    /// authoritative for the caller, the callee, and any created contract.
    pub fn refresh_account(
        &mut self,
        chain: &mut dyn ChainState,
        account: Address,
        fields: AccountFields,
    ) {
        if fields.contains(AccountFields::BALANCE) {
            self.live.record_balance(account, chain.balance(account));
        }
        if fields.contains(AccountFields::NONCE) {
            self.live.record_nonce(account, chain.nonce(account));
        }
        if fields.contains(AccountFields::CODE) {
            self.live.record_code(account, chain.code(account));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryChainState, StaticSource};
    use alloy_primitives::{address, U256};
    use std::sync::Arc;

    const ACCOUNT: Address = address!("0x00000000000000000000000000000000000000aa");
    const BLOCK: u64 = 1_000;

    fn lazy_state(source: StaticSource) -> (TouchedState, Arc<StaticSource>) {
        let source = Arc::new(source);
        let mut state = TouchedState::new();
        state.set_source(source.clone());
        state.set_mode(LoadMode::LazyFetch);
        (state, source)
    }

    #[test]
    fn touch_is_idempotent_and_fetches_at_most_once() {
        let slot = B256::with_last_byte(1);
        let source = StaticSource::default().with_storage(ACCOUNT, slot, B256::with_last_byte(9));
        let (mut state, source) = lazy_state(source);
        let mut chain = MemoryChainState::default();

        state.ensure_storage_loaded(&mut chain, ACCOUNT, slot, BLOCK).unwrap();
        state.ensure_storage_loaded(&mut chain, ACCOUNT, slot, BLOCK).unwrap();

        assert_eq!(source.storage_fetches(), 1);
        assert_eq!(state.live().storage(ACCOUNT, slot), B256::with_last_byte(9));
        assert_eq!(state.committed().storage(ACCOUNT, slot), B256::with_last_byte(9));
        // the fetch also seeded the execution backend
        assert_eq!(chain.storage(ACCOUNT, slot), B256::with_last_byte(9));
    }

    #[test]
    fn balance_rereads_live_state_on_every_access() {
        let source = StaticSource::default().with_balance(ACCOUNT, U256::from(50));
        let (mut state, source) = lazy_state(source);
        let mut chain = MemoryChainState::default();

        state.ensure_balance_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();
        assert_eq!(state.live().balance(ACCOUNT), U256::from(50));

        // an implicit value transfer mutates the backend without any hook
        chain.set_balance(ACCOUNT, U256::from(45));
        state.ensure_balance_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();

        assert_eq!(state.live().balance(ACCOUNT), U256::from(45));
        // but the historical source was only consulted once
        assert_eq!(source.balance_fetches(), 1);
        // and the baseline still holds the first observed value
        assert_eq!(state.committed().balance(ACCOUNT), U256::from(50));
    }

    #[test]
    fn nonce_is_touch_once() {
        let source = StaticSource::default().with_nonce(ACCOUNT, 4);
        let (mut state, _source) = lazy_state(source);
        let mut chain = MemoryChainState::default();

        state.ensure_nonce_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();
        chain.set_nonce(ACCOUNT, 9);
        state.ensure_nonce_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();

        assert_eq!(state.live().nonce(ACCOUNT), 4);
    }

    #[test]
    fn provider_errors_degrade_to_zero_by_default() {
        let (mut state, _source) = lazy_state(StaticSource::failing());
        let mut chain = MemoryChainState::default();

        state.ensure_balance_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();
        assert!(state.live().is_balance_touched(ACCOUNT));
        assert_eq!(state.live().balance(ACCOUNT), U256::ZERO);
    }

    #[test]
    fn provider_errors_abort_in_strict_mode() {
        let (mut state, _source) = lazy_state(StaticSource::failing());
        state.set_strict(true);
        let mut chain = MemoryChainState::default();

        let err = state.ensure_balance_loaded(&mut chain, ACCOUNT, BLOCK).unwrap_err();
        assert!(matches!(err, ReplayError::Provider(_)));
    }

    #[test]
    fn prestate_only_mode_never_consults_the_source() {
        let source = Arc::new(StaticSource::default().with_balance(ACCOUNT, U256::from(50)));
        let mut state = TouchedState::new();
        state.set_source(source.clone());
        // mode stays PrestateOnly
        let mut chain = MemoryChainState::default().with_balance(ACCOUNT, U256::from(3));

        state.ensure_balance_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();
        assert_eq!(source.balance_fetches(), 0);
        assert_eq!(state.live().balance(ACCOUNT), U256::from(3));
    }

    #[test]
    fn code_restored_into_backend_after_backend_lost_it() {
        let mut state = TouchedState::new();
        let mut chain = MemoryChainState::default();
        let code = alloy_primitives::Bytes::from_static(&[0x60, 0x00]);

        chain.set_code(ACCOUNT, code.clone());
        state.ensure_code_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();

        // backend loses the code, e.g. through an engine-level revert
        chain.set_code(ACCOUNT, alloy_primitives::Bytes::new());
        state.ensure_code_loaded(&mut chain, ACCOUNT, BLOCK).unwrap();
        assert_eq!(chain.code(ACCOUNT), code);
    }
}
