use std::sync::Arc;

use alloy_primitives::{address, Address, B256, U256};

use crate::{
    test_utils::{MemoryChainState, ScriptCall, ScriptCreate, ScriptEngine, StaticSource, Step},
    BranchRecord, CallKind, CallMessage, ChainState, EvmError, LoadMode, ReplayConfig,
    ReplayError, ReplaySession, TxContext,
};

const SENDER: Address = address!("0x00000000000000000000000000000000000000aa");
const WATCHED: Address = address!("0x00000000000000000000000000000000000000bb");
const OTHER: Address = address!("0x00000000000000000000000000000000000000cc");
const THIRD: Address = address!("0x00000000000000000000000000000000000000dd");

fn slot(n: u8) -> B256 {
    B256::with_last_byte(n)
}

fn session() -> ReplaySession {
    ReplaySession::with_source(ReplayConfig::new().watch(WATCHED), None)
}

fn tx_ctx(block: u64, index: u64) -> TxContext {
    TxContext { block_number: block, timestamp: 1_700_000_000, tx_index: index, tx_hash: None }
}

fn value_call(value: U256) -> CallMessage {
    CallMessage {
        from: SENDER,
        to: Some(WATCHED),
        value,
        input: Default::default(),
        gas_limit: 100_000,
    }
}

fn quiet_engine(body: Vec<Step>) -> ScriptEngine {
    ScriptEngine { body, output: Default::default(), error: None, gas_used: 21_000 }
}

#[test]
fn prestate_rewinds_the_already_applied_transfer() {
    let value = U256::from(10);
    let mut chain = MemoryChainState::default().with_balance(SENDER, U256::from(100));
    let mut session = session();
    let mut engine = quiet_engine(vec![]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(value))
        .unwrap();

    let root = &tx.call;
    assert!(root.is_state);
    // the recipient's prestate balance excludes the incoming value
    assert_eq!(root.pre_state[&WATCHED].balance, Some(U256::ZERO));
    // the sender's prestate balance and nonce predate the debit
    assert_eq!(root.pre_state[&SENDER].balance, Some(U256::from(100)));
    assert_eq!(root.pre_state[&SENDER].nonce, 0);

    assert_eq!(root.post_state[&WATCHED].balance, Some(value));
    assert_eq!(root.post_state[&SENDER].balance, Some(U256::from(90)));
    assert_eq!(root.post_state[&SENDER].nonce, 1);

    // the balance pre-adjustment invariant, stated directly
    assert_eq!(
        root.pre_state[&WATCHED].balance.unwrap(),
        root.post_state[&WATCHED].balance.unwrap() - value
    );
    assert_eq!(
        root.pre_state[&SENDER].balance.unwrap(),
        root.post_state[&SENDER].balance.unwrap() + value
    );
}

#[test]
fn nested_call_from_watched_address_records_state() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let mut engine = quiet_engine(vec![Step::Call(Box::new(ScriptCall {
        to: OTHER,
        body: vec![Step::SStore { slot: slot(1), value: slot(9) }],
        ..Default::default()
    }))]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let child = &tx.call.calls[0];
    assert_eq!(child.kind, CallKind::Call);
    assert!(child.is_state, "a watched caller propagates recording to its sub-calls");
    assert!(child.pre_state.contains_key(&WATCHED));
    assert!(child.pre_state.contains_key(&OTHER));
    // the touched slot shows up with its before and after values
    assert_eq!(child.pre_state[&OTHER].storage[&slot(1)], B256::ZERO);
    assert_eq!(child.post_state[&OTHER].storage[&slot(1)], slot(9));
}

#[test]
fn reverted_subcall_rolls_back_only_its_own_touches() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let mut engine = quiet_engine(vec![
        Step::SStore { slot: slot(1), value: slot(7) },
        Step::Call(Box::new(ScriptCall {
            to: OTHER,
            body: vec![Step::SStore { slot: slot(2), value: slot(8) }],
            error: Some(EvmError::Reverted),
            ..Default::default()
        })),
    ]);

    session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let live = session.touched().live();
    // the write before the failed call survives
    assert_eq!(live.storage(WATCHED, slot(1)), slot(7));
    // the write inside the failed call rolled back to the baseline
    assert_eq!(live.storage(OTHER, slot(2)), B256::ZERO);
    // the engine's own journal agrees
    assert_eq!(chain.storage(OTHER, slot(2)), B256::ZERO);
}

#[test]
fn reverting_outer_call_discards_effects_of_successful_inner_call() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let mut engine = quiet_engine(vec![
        Step::SStore { slot: slot(1), value: slot(7) },
        Step::Call(Box::new(ScriptCall {
            to: OTHER,
            body: vec![
                Step::SStore { slot: slot(2), value: slot(8) },
                Step::Call(Box::new(ScriptCall {
                    to: THIRD,
                    body: vec![Step::SStore { slot: slot(3), value: slot(9) }],
                    ..Default::default()
                })),
            ],
            error: Some(EvmError::Reverted),
            ..Default::default()
        })),
    ]);

    session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let live = session.touched().live();
    assert_eq!(live.storage(WATCHED, slot(1)), slot(7));
    // both the outer call's own write and the already-committed inner
    // call's write are gone
    assert_eq!(live.storage(OTHER, slot(2)), B256::ZERO);
    assert_eq!(live.storage(THIRD, slot(3)), B256::ZERO);
}

#[test]
fn fresh_create2_is_pruned_from_prestate_but_present_in_poststate() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let create = ScriptCreate::default();
    let deployed = create.predicted_address(WATCHED);
    let deployed_code = create.deployed_code.clone();
    let mut engine = quiet_engine(vec![Step::Create2(Box::new(create))]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let root = &tx.call;
    assert!(
        !root.pre_state.contains_key(&deployed),
        "a freshly created contract has no meaningful prestate"
    );
    assert_eq!(root.post_state[&deployed].code, deployed_code);
    assert_eq!(root.post_state[&deployed].nonce, 1);

    // the creation frame itself is in the tree
    let child = &tx.call.calls[0];
    assert_eq!(child.kind, CallKind::Create2);
    assert_eq!(child.to, Some(deployed));
}

#[test]
fn failed_create2_loses_its_destination() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let create = ScriptCreate { error: Some(EvmError::OutOfGas), ..Default::default() };
    let deployed = create.predicted_address(WATCHED);
    let mut engine = quiet_engine(vec![Step::Create2(Box::new(create))]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let child = &tx.call.calls[0];
    assert_eq!(child.to, None);
    assert!(child.failed());
    assert!(chain.code(deployed).is_empty());
}

#[test]
fn selfdestructed_account_is_excluded_from_poststate() {
    let mut chain = MemoryChainState::default().with_balance(OTHER, U256::from(33));
    let mut session = session();
    let mut engine = quiet_engine(vec![Step::Call(Box::new(ScriptCall {
        to: OTHER,
        body: vec![Step::SelfDestruct { beneficiary: THIRD }],
        ..Default::default()
    }))]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let child = &tx.call.calls[0];
    assert!(child.is_state);
    assert!(child.pre_state.contains_key(&OTHER));
    assert!(!child.post_state.contains_key(&OTHER));
    // the beneficiary is part of the footprint and keeps its diff
    assert_eq!(child.pre_state[&THIRD].balance, Some(U256::ZERO));
    assert_eq!(child.post_state[&THIRD].balance, Some(U256::from(33)));
}

#[test]
fn branch_outcomes_are_recorded_for_watched_contracts_only() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let mut engine = quiet_engine(vec![
        Step::Jumpi { pc: 5, target: 42, taken: true },
        Step::Jumpi { pc: 11, target: 60, taken: false },
        Step::Call(Box::new(ScriptCall {
            to: OTHER,
            body: vec![Step::Jumpi { pc: 3, target: 9, taken: true }],
            ..Default::default()
        })),
    ]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let root = &tx.call;
    assert_eq!(
        root.branch,
        vec![
            BranchRecord { pc: 5, destination: 42, taken: true },
            BranchRecord { pc: 11, destination: 12, taken: false },
        ]
    );
    // the sub-call executes an unwatched contract, so its branches are not
    // traced even though the frame itself records state
    assert!(root.calls[0].is_state);
    assert!(root.calls[0].branch.is_empty());
}

#[test]
fn logs_attach_to_the_innermost_frame_in_order() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let topic = B256::with_last_byte(0xee);
    let mut engine = quiet_engine(vec![
        Step::Emit { topics: vec![topic], data: Default::default() },
        Step::Call(Box::new(ScriptCall {
            to: OTHER,
            body: vec![Step::Emit { topics: vec![topic, topic], data: Default::default() }],
            ..Default::default()
        })),
        Step::Emit { topics: vec![topic], data: Default::default() },
    ]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let root = &tx.call;
    assert_eq!(root.logs.len(), 2);
    assert_eq!(root.logs[0].position, 0);
    // the second root log was emitted after one sub-call
    assert_eq!(root.logs[1].position, 1);
    assert_eq!(root.calls[0].logs.len(), 1);
    assert_eq!(root.calls[0].logs[0].topics.len(), 2);
}

#[test]
fn watched_frame_inherits_parent_addresses_into_subcall_prestate() {
    let mut chain = MemoryChainState::default().with_balance(THIRD, U256::from(77));
    let mut session = session();
    let mut engine = quiet_engine(vec![
        // pulls THIRD into the root watched frame's footprint
        Step::BalanceOf { address: THIRD },
        Step::Call(Box::new(ScriptCall { to: OTHER, ..Default::default() })),
    ]);

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap();

    let child = &tx.call.calls[0];
    assert!(child.is_state);
    // intermediary balances stay comparable across the sub-call
    assert_eq!(child.pre_state[&THIRD].balance, Some(U256::from(77)));
}

#[test]
fn post_state_of_one_transaction_is_pre_state_of_the_next() {
    let mut chain = MemoryChainState::default().with_balance(SENDER, U256::from(100));
    let mut session = session();
    let mut engine = quiet_engine(vec![]);

    let tx0 = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::from(10)))
        .unwrap();
    let tx1 = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 1), &value_call(U256::from(5)))
        .unwrap();

    for address in [SENDER, WATCHED] {
        let post = &tx0.call.post_state[&address];
        let pre = &tx1.call.pre_state[&address];
        assert_eq!(post.balance, pre.balance, "{address} balance drifted between transactions");
        assert_eq!(post.nonce, pre.nonce, "{address} nonce drifted between transactions");
    }
}

#[test]
fn out_of_order_replay_is_rejected() {
    let mut chain = MemoryChainState::default();
    let mut session = session();
    let mut engine = quiet_engine(vec![]);

    session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 1), &value_call(U256::ZERO))
        .unwrap();
    let err = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap_err();
    assert!(matches!(err, ReplayError::OutOfOrder { .. }));
}

#[test]
fn strict_mode_surfaces_provider_failures() {
    let mut config = ReplayConfig::new().watch(WATCHED).with_fail_fast();
    config.mode = LoadMode::LazyFetch;
    let mut session = ReplaySession::with_source(config, Some(Arc::new(StaticSource::failing())));
    let mut chain = MemoryChainState::default();
    let mut engine = quiet_engine(vec![Step::SLoad { slot: slot(1) }]);

    let err = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::ZERO))
        .unwrap_err();
    assert!(matches!(err, ReplayError::Provider(_)));
}

#[test]
fn failed_root_still_produces_a_finalized_tree() {
    let mut chain = MemoryChainState::default().with_balance(SENDER, U256::from(100));
    let mut session = session();
    let mut engine = ScriptEngine {
        body: vec![Step::SStore { slot: slot(1), value: slot(7) }],
        output: Default::default(),
        error: Some(EvmError::OutOfGas),
        gas_used: 100_000,
    };

    let tx = session
        .replay_transaction(&mut engine, &mut chain, &tx_ctx(1, 0), &value_call(U256::from(10)))
        .unwrap();

    let root = &tx.call;
    assert_eq!(root.error.as_deref(), Some("out of gas"));
    assert!(root.is_state);
    // the engine rolled its journal back before the end hook, so the
    // poststate matches the prestate for everything but the burned gas
    assert_eq!(root.post_state[&WATCHED].balance, Some(U256::ZERO));
    assert_eq!(root.post_state[&SENDER].balance, Some(U256::from(100)));
    assert_eq!(chain.storage(WATCHED, slot(1)), B256::ZERO);
}
