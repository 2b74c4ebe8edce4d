//! Call-boundary checkpointing of the touch cache.

use crate::{AccountTouches, ChainState, TouchedState};

/// An immutable point-in-time deep copy of the touched maps.
///
/// Produced on entry to any state-affecting call and consumed by exactly one
/// matching revert; on call success it is simply dropped and the live
/// cache's newly touched entries become authoritative.
#[derive(Clone, Debug, derive_more::Deref)]
pub struct StateSnapshot {
    #[deref]
    maps: AccountTouches,
}

impl TouchedState {
    /// Exports a deep copy of all four touched maps.
    ///
    /// Mutating the live cache afterwards must not affect the snapshot.
    pub fn export_snapshot(&self) -> StateSnapshot {
        StateSnapshot { maps: self.live.clone() }
    }

    /// Rolls the live cache back to `snapshot`.
    ///
    /// Every key currently touched is restored: from the snapshot when it
    /// holds that exact key, otherwise from the committed baseline (the key
    /// was newly discovered inside the reverted scope, so the baseline is
    /// the only consistent fallback). Touched keys are never dropped; a
    /// fact learned stays learned, only its value rolls back.
    ///
    /// With `resync_live` set, restored values are also written back into
    /// the execution backend so the VM's own storage reflects the rollback.
    pub fn revert_to(
        &mut self,
        snapshot: &StateSnapshot,
        chain: &mut dyn ChainState,
        resync_live: bool,
    ) {
        let committed = &self.committed;

        for (account, slots) in self.live.storage_mut().iter_mut() {
            for (slot, value) in slots.iter_mut() {
                *value = snapshot
                    .maps
                    .storage_slots(*account)
                    .and_then(|slots| slots.get(slot))
                    .copied()
                    .unwrap_or_else(|| committed.storage(*account, *slot));
                if resync_live {
                    chain.set_storage(*account, *slot, *value);
                }
            }
        }

        for (account, balance) in self.live.balance_mut().iter_mut() {
            *balance = if snapshot.maps.is_balance_touched(*account) {
                snapshot.maps.balance(*account)
            } else {
                committed.balance(*account)
            };
            if resync_live {
                chain.set_balance(*account, *balance);
            }
        }

        for (account, nonce) in self.live.nonce_mut().iter_mut() {
            *nonce = if snapshot.maps.is_nonce_touched(*account) {
                snapshot.maps.nonce(*account)
            } else {
                committed.nonce(*account)
            };
            if resync_live {
                chain.set_nonce(*account, *nonce);
            }
        }

        for (account, code) in self.live.code_mut().iter_mut() {
            *code = if snapshot.maps.is_code_touched(*account) {
                snapshot.maps.code(*account)
            } else {
                committed.code(*account)
            };
            if resync_live {
                chain.set_code(*account, code.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryChainState;
    use alloy_primitives::{address, Address, B256, U256};

    const A: Address = address!("0x00000000000000000000000000000000000000aa");
    const B: Address = address!("0x00000000000000000000000000000000000000bb");

    fn slot(n: u8) -> B256 {
        B256::with_last_byte(n)
    }

    #[test]
    fn export_then_revert_is_observationally_identity() {
        let mut chain = MemoryChainState::default();
        let mut state = TouchedState::new();
        state.live.record_balance(A, U256::from(10));
        state.live.record_storage(A, slot(1), slot(9));
        state.live.record_nonce(A, 3);
        state.commit();

        let snapshot = state.export_snapshot();
        state.revert_to(&snapshot, &mut chain, false);

        assert_eq!(state.live().balance(A), U256::from(10));
        assert_eq!(state.live().storage(A, slot(1)), slot(9));
        assert_eq!(state.live().nonce(A), 3);
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutation() {
        let mut chain = MemoryChainState::default();
        let mut state = TouchedState::new();
        state.live.record_storage(A, slot(1), slot(1));
        let snapshot = state.export_snapshot();

        state.live.record_storage(A, slot(1), slot(2));
        assert_eq!(snapshot.storage(A, slot(1)), slot(1));

        state.revert_to(&snapshot, &mut chain, false);
        assert_eq!(state.live().storage(A, slot(1)), slot(1));
    }

    #[test]
    fn newly_discovered_keys_fall_back_to_committed_baseline() {
        let mut chain = MemoryChainState::default();
        let mut state = TouchedState::new();
        state.committed.record_balance(B, U256::from(42));
        state.committed.record_storage(B, slot(7), slot(5));

        let snapshot = state.export_snapshot();
        // discovered only inside the reverted scope
        state.live.record_balance(B, U256::from(1000));
        state.live.record_storage(B, slot(7), slot(6));
        state.revert_to(&snapshot, &mut chain, false);

        assert_eq!(state.live().balance(B), U256::from(42));
        assert_eq!(state.live().storage(B, slot(7)), slot(5));
    }

    #[test]
    fn resync_writes_restored_values_into_the_backend() {
        let mut chain = MemoryChainState::default();
        let mut state = TouchedState::new();
        state.live.record_balance(A, U256::from(10));
        let snapshot = state.export_snapshot();

        state.live.record_balance(A, U256::from(99));
        chain.set_balance(A, U256::from(99));
        state.revert_to(&snapshot, &mut chain, true);

        assert_eq!(chain.balance(A), U256::from(10));
    }
}
