//! Post-state reconciliation for closed call frames.

use alloy_primitives::Address;

use crate::{Account, CallFrame, ChainState};

/// Builds the post-state of a closed frame and prunes synthetic prestate.
///
/// For every address in the frame's pre-state the current live values are
/// re-read in full rather than diffed, so partially touched accounts still
/// come out complete. Addresses destroyed inside the frame stay in the pre-state
/// but are excluded from the post-state. Created contracts whose pre-state
/// shows no prior identity lose their pre-state entry: a fresh contract has
/// no meaningful "before" to report.
///
/// For a failed frame the engine has already rolled its journal back, so
/// the re-read naturally reproduces the pre-call values.
pub fn reconcile_frame(frame: &mut CallFrame, chain: &mut dyn ChainState) {
    let addresses: Vec<Address> = frame.pre_state.keys().copied().collect();
    for address in addresses {
        if frame.deleted.contains(&address) {
            continue;
        }
        let mut post = Account {
            balance: Some(chain.balance(address)),
            nonce: chain.nonce(address),
            code: chain.code(address),
            storage: Default::default(),
        };
        if let Some(pre) = frame.pre_state.get(&address) {
            for slot in pre.storage.keys() {
                post.storage.insert(*slot, chain.storage(address, *slot));
            }
        }
        frame.post_state.insert(address, post);
    }

    let created: Vec<Address> = frame.created.iter().copied().collect();
    for address in created {
        // the created contract may have existed before the creating tx
        if frame.pre_state.get(&address).is_some_and(|account| !account.exists()) {
            frame.pre_state.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::MemoryChainState, CallKind};
    use alloy_primitives::{address, B256, U256};

    const A: Address = address!("0x00000000000000000000000000000000000000aa");
    const C: Address = address!("0x00000000000000000000000000000000000000cc");

    #[test]
    fn deleted_accounts_stay_in_pre_but_not_post() {
        let mut chain = MemoryChainState::default().with_balance(A, U256::from(5));
        let mut frame = CallFrame::new(CallKind::Call, A, C, U256::ZERO, &[], 0, false);
        frame.pre_state.insert(A, Account::default());
        frame.pre_state.insert(C, Account { nonce: 1, ..Default::default() });
        frame.deleted.insert(C);

        reconcile_frame(&mut frame, &mut chain);

        assert!(frame.pre_state.contains_key(&C));
        assert!(!frame.post_state.contains_key(&C));
        assert_eq!(frame.post_state[&A].balance, Some(U256::from(5)));
    }

    #[test]
    fn created_account_without_identity_is_pruned_from_pre() {
        let code = alloy_primitives::Bytes::from_static(&[0xfe]);
        let mut chain = MemoryChainState::default().with_code(C, code.clone());
        let mut frame = CallFrame::new(CallKind::Call, A, C, U256::ZERO, &[], 0, false);
        frame.pre_state.insert(C, Account::default());
        frame.created.insert(C);

        reconcile_frame(&mut frame, &mut chain);

        assert!(!frame.pre_state.contains_key(&C));
        assert_eq!(frame.post_state[&C].code, code);
    }

    #[test]
    fn preexisting_created_account_keeps_its_prestate() {
        let mut chain = MemoryChainState::default();
        let mut frame = CallFrame::new(CallKind::Call, A, C, U256::ZERO, &[], 0, false);
        // the address had a balance before the creating transaction
        frame.pre_state.insert(C, Account { balance: Some(U256::from(1)), ..Default::default() });
        frame.created.insert(C);

        reconcile_frame(&mut frame, &mut chain);

        assert!(frame.pre_state.contains_key(&C));
    }

    #[test]
    fn touched_slots_are_reread_in_full() {
        let slot = B256::with_last_byte(1);
        let mut chain = MemoryChainState::default().with_storage(C, slot, B256::with_last_byte(9));
        let mut frame = CallFrame::new(CallKind::Call, A, C, U256::ZERO, &[], 0, false);
        let mut pre = Account::default();
        pre.storage.insert(slot, B256::ZERO);
        frame.pre_state.insert(C, pre);

        reconcile_frame(&mut frame, &mut chain);

        assert_eq!(frame.post_state[&C].storage[&slot], B256::with_last_byte(9));
    }
}
