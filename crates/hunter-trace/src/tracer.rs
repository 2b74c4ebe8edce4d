//! The call-frame recorder: builds the call tree in lock-step with the
//! engine's hook surface and attaches call-scoped state diffs.

use alloy_primitives::{keccak256, map::AddressHashSet, Address, B256, U256};
use tracing::warn;

use crate::{
    reconcile_frame, AccountFields, BranchRecord, CallFrame, CallKind, CallLog, ChainState,
    EvmError, HookKind, OpContext, ReplayError, StateSnapshot, TouchedState, TraceHooks,
};

/// A snapshot waiting for its call to finish.
#[derive(Debug)]
struct PendingCall {
    snapshot: StateSnapshot,
    kind: CallKind,
    from: Address,
    to: Address,
}

/// The per-opcode recording action, resolved once per instruction and then
/// applied to every open watched frame.
enum StepAction {
    Storage { slot: B256 },
    AccountRef { address: Address },
    SelfDestruct { beneficiary: Address },
    CallTarget { address: Address },
    Created { address: Address },
    Branch { record: BranchRecord },
}

/// Records one transaction's call tree, driving the lazy loader and the
/// snapshot manager from the hook surface.
///
/// A tracer borrows the session's touch cache for the duration of one
/// transaction; frames touching a watched address additionally get
/// pre/post-state capture. The engine must fire `capture_tx_start` before
/// `capture_start`, and must pair `capture_enter`/`capture_exit` for every
/// nested call attempt, even those that fail before executing code.
#[derive(Debug)]
pub struct TxTracer<'a> {
    touched: &'a mut TouchedState,
    watched: &'a AddressHashSet,
    record_state: bool,
    block_number: u64,
    gas_limit: u64,
    callstack: Vec<CallFrame>,
    /// Indices into `callstack` of the open frames with state recording.
    stated: Vec<usize>,
    /// Snapshot stack, one entry per open state-mutating call.
    pending: Vec<PendingCall>,
    /// Program counter of the most recent call site.
    call_location: u64,
    fatal: Option<ReplayError>,
}

impl<'a> TxTracer<'a> {
    /// Creates a tracer for one transaction of `block_number`.
    pub fn new(
        touched: &'a mut TouchedState,
        watched: &'a AddressHashSet,
        record_state: bool,
        block_number: u64,
    ) -> Self {
        Self {
            touched,
            watched,
            record_state,
            block_number,
            gas_limit: 0,
            callstack: Vec::new(),
            stated: Vec::new(),
            pending: Vec::new(),
            call_location: 0,
            fatal: None,
        }
    }

    /// Consumes the tracer and returns the finished root frame.
    ///
    /// Fails with the first fatal error noted during tracing (strict-mode
    /// provider failures); panics on an unbalanced call stack, which means
    /// the engine violated the hook pairing contract.
    pub fn into_root(mut self) -> Result<CallFrame, ReplayError> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        assert_eq!(self.callstack.len(), 1, "unbalanced call stack at end of replay");
        Ok(self.callstack.pop().expect("checked length"))
    }

    fn note(&mut self, result: Result<(), ReplayError>) {
        note_fatal(&mut self.fatal, result);
    }

    /// Seeds `address` into the frame's pre-state, materializing all of its
    /// fields through the lazy loader first.
    fn lookup_account(
        touched: &mut TouchedState,
        frame: &mut CallFrame,
        chain: &mut dyn ChainState,
        address: Address,
        block: u64,
    ) -> Result<(), ReplayError> {
        if frame.pre_state.contains_key(&address) {
            return Ok(());
        }
        touched.ensure_account_loaded(chain, address, AccountFields::all(), block)?;
        frame.pre_state.insert(
            address,
            crate::Account {
                balance: Some(chain.balance(address)),
                nonce: chain.nonce(address),
                code: chain.code(address),
                storage: Default::default(),
            },
        );
        Ok(())
    }

    /// Seeds a storage slot into the frame's pre-state.
    fn lookup_storage(
        frame: &mut CallFrame,
        chain: &mut dyn ChainState,
        address: Address,
        slot: B256,
    ) {
        let account = frame.pre_state.entry(address).or_default();
        if !account.storage.contains_key(&slot) {
            account.storage.insert(slot, chain.storage(address, slot));
        }
    }

    /// Undoes the effects the engine already applied for an incoming call,
    /// so the pre-state reads as *before the call*: the recipient balance
    /// already includes the transferred value and the sender balance (and,
    /// at the transaction level, nonce) already reflect the debit.
    fn rewind_transfer(
        frame: &mut CallFrame,
        from: Address,
        to: Address,
        value: U256,
        rewind_nonce: bool,
    ) {
        if let Some(account) = frame.pre_state.get_mut(&to) {
            if let Some(balance) = account.balance {
                account.balance = Some(balance.saturating_sub(value));
            }
        }
        if let Some(account) = frame.pre_state.get_mut(&from) {
            if let Some(balance) = account.balance {
                account.balance = Some(balance.saturating_add(value));
            }
            if rewind_nonce {
                account.nonce = account.nonce.saturating_sub(1);
            }
        }
    }

    fn record_log(&mut self, ctx: &OpContext<'_>, topic_count: u8) {
        let (Some(m_start), Some(m_size)) = (ctx.stack_back(0), ctx.stack_back(1)) else {
            return;
        };
        let mut topics = Vec::with_capacity(topic_count as usize);
        for i in 0..topic_count as usize {
            let Some(topic) = ctx.stack_back(2 + i) else { return };
            topics.push(B256::from(topic));
        }
        let Some(data) = ctx.memory_copy_padded(m_start, m_size) else {
            warn!(pc = ctx.pc, "failed to copy log data, skipping event");
            return;
        };
        let frame = self.callstack.last_mut().expect("log emitted outside any frame");
        frame.logs.push(CallLog {
            address: ctx.address,
            topics,
            data: data.into(),
            position: frame.calls.len() as u64,
        });
    }

    /// Lazily materializes whatever the instruction is about to touch.
    fn materialize(&mut self, chain: &mut dyn ChainState, kind: HookKind, ctx: &OpContext<'_>) {
        let block = self.block_number;
        match kind {
            HookKind::StorageLoad => {
                if let Some(slot) = ctx.stack_back(0) {
                    let result = self.touched.ensure_storage_loaded(
                        chain,
                        ctx.address,
                        B256::from(slot),
                        block,
                    );
                    self.note(result);
                }
            }
            HookKind::StorageStore => {
                if let (Some(slot), Some(value)) = (ctx.stack_back(0), ctx.stack_back(1)) {
                    let slot = B256::from(slot);
                    let result = self.touched.prepare_storage_store(chain, ctx.address, slot, block);
                    self.note(result);
                    self.touched.record_storage_write(ctx.address, slot, B256::from(value));
                }
            }
            HookKind::BalanceRef => {
                if let Some(word) = ctx.stack_back(0) {
                    let address = Address::from_word(B256::from(word));
                    let result = self.touched.ensure_balance_loaded(chain, address, block);
                    self.note(result);
                }
            }
            HookKind::CodeRef => {
                if let Some(word) = ctx.stack_back(0) {
                    let address = Address::from_word(B256::from(word));
                    let result = self.touched.ensure_code_loaded(chain, address, block);
                    self.note(result);
                }
            }
            HookKind::Call(_) => {
                if let Some(word) = ctx.stack_back(1) {
                    let address = Address::from_word(B256::from(word));
                    let result = self.touched.ensure_account_loaded(
                        chain,
                        address,
                        AccountFields::all(),
                        block,
                    );
                    self.note(result);
                }
            }
            _ => {}
        }
    }

    /// Resolves what the open watched frames must record for this
    /// instruction. Returns `None` when the instruction records nothing.
    fn resolve_action(
        &self,
        chain: &mut dyn ChainState,
        kind: HookKind,
        ctx: &OpContext<'_>,
    ) -> Option<StepAction> {
        match kind {
            HookKind::StorageLoad | HookKind::StorageStore => {
                ctx.stack_back(0).map(|slot| StepAction::Storage { slot: B256::from(slot) })
            }
            HookKind::BalanceRef | HookKind::CodeRef => ctx.stack_back(0).map(|word| {
                StepAction::AccountRef { address: Address::from_word(B256::from(word)) }
            }),
            HookKind::SelfDestruct => ctx.stack_back(0).map(|word| StepAction::SelfDestruct {
                beneficiary: Address::from_word(B256::from(word)),
            }),
            HookKind::Call(_) => ctx.stack_back(1).map(|word| {
                StepAction::CallTarget { address: Address::from_word(B256::from(word)) }
            }),
            HookKind::Create => {
                let nonce = chain.nonce(ctx.address);
                Some(StepAction::Created { address: ctx.address.create(nonce) })
            }
            HookKind::Create2 => {
                let offset = ctx.stack_back(1)?;
                let size = ctx.stack_back(2)?;
                let salt = ctx.stack_back(3)?;
                let Some(init_code) = ctx.memory_copy_padded(offset, size) else {
                    warn!(pc = ctx.pc, "failed to copy create2 init code, skipping prediction");
                    return None;
                };
                let address = ctx.address.create2(B256::from(salt), keccak256(&init_code));
                Some(StepAction::Created { address })
            }
            HookKind::Branch => {
                // branch tracing is expensive, so it is scoped to watched
                // contracts only
                if !self.watched.contains(&ctx.address) {
                    return None;
                }
                let pos = ctx.stack_back(0)?;
                let cond = ctx.stack_back(1)?;
                let taken = !cond.is_zero();
                let destination = if taken { pos.saturating_to::<u64>() } else { ctx.pc + 1 };
                Some(StepAction::Branch { record: BranchRecord { pc: ctx.pc, destination, taken } })
            }
            HookKind::Log(_) => None,
        }
    }
}

impl TraceHooks for TxTracer<'_> {
    fn capture_tx_start(&mut self, gas_limit: u64) {
        self.gas_limit = gas_limit;
    }

    fn capture_tx_end(&mut self, rest_gas: u64) {
        if let Some(root) = self.callstack.first_mut() {
            root.gas_used = self.gas_limit - rest_gas;
        }
    }

    fn capture_start(
        &mut self,
        chain: &mut dyn ChainState,
        from: Address,
        to: Address,
        create: bool,
        input: &[u8],
        _gas: u64,
        value: U256,
    ) {
        assert!(self.callstack.is_empty(), "capture_start fired twice for one transaction");
        let kind = if create { CallKind::Create } else { CallKind::Call };
        let is_contract = !chain.code(to).is_empty();
        self.callstack.push(CallFrame::new(
            kind,
            from,
            to,
            value,
            input,
            self.gas_limit,
            is_contract,
        ));

        // the top-level frame is of interest when either end of the
        // transaction is watched
        if !(self.record_state && (self.watched.contains(&to) || self.watched.contains(&from))) {
            return;
        }
        let frame = &mut self.callstack[0];
        frame.is_state = true;
        self.stated.push(0);

        let block = self.block_number;
        let Self { touched, callstack, fatal, .. } = self;
        let frame = &mut callstack[0];
        note_fatal(fatal, Self::lookup_account(touched, frame, chain, from, block));
        note_fatal(fatal, Self::lookup_account(touched, frame, chain, to, block));
        // gas consumption is deliberately ignored here; only the value
        // transfer and the nonce bump are rewound
        Self::rewind_transfer(frame, from, to, value, true);
        if create {
            frame.created.insert(to);
        }
    }

    fn capture_end(
        &mut self,
        chain: &mut dyn ChainState,
        output: &[u8],
        _gas_used: u64,
        err: Option<&EvmError>,
    ) {
        let root = self.callstack.first_mut().expect("capture_end before capture_start");
        root.finish(output, err);
        if root.is_state {
            reconcile_frame(root, chain);
            self.stated.pop();
        }
    }

    fn capture_enter(
        &mut self,
        chain: &mut dyn ChainState,
        kind: CallKind,
        from: Address,
        to: Address,
        input: &[u8],
        gas: u64,
        value: U256,
    ) {
        assert!(!self.callstack.is_empty(), "capture_enter before capture_start");
        let is_contract = !chain.code(to).is_empty();
        let mut frame = CallFrame::new(kind, from, to, value, input, gas, is_contract);
        frame.call_location = self.call_location;
        self.callstack.push(frame);

        if kind.needs_snapshot() {
            self.pending.push(PendingCall {
                snapshot: self.touched.export_snapshot(),
                kind,
                from,
                to,
            });
        }

        // a frame records state when it calls a watched address, or when a
        // watched address (already under recording) calls out
        let watched_to = self.watched.contains(&to);
        let watched_from = !self.stated.is_empty() && self.watched.contains(&from);
        if !(self.record_state && kind == CallKind::Call && (watched_to || watched_from)) {
            return;
        }

        let idx = self.callstack.len() - 1;
        self.callstack[idx].is_state = true;

        let block = self.block_number;
        let parent = self.stated.last().copied();
        let Self { touched, callstack, fatal, .. } = self;
        {
            let frame = &mut callstack[idx];
            note_fatal(fatal, Self::lookup_account(touched, frame, chain, from, block));
            note_fatal(fatal, Self::lookup_account(touched, frame, chain, to, block));
        }
        if watched_from {
            // inherit the parent watched frame's addresses so balance deltas
            // of intermediaries stay self-consistent across the sub-call
            let parent = parent.expect("watched_from implies an open stated frame");
            let inherited: Vec<Address> = callstack[parent]
                .pre_state
                .keys()
                .filter(|address| **address != from && **address != to)
                .copied()
                .collect();
            let frame = &mut callstack[idx];
            for address in inherited {
                note_fatal(fatal, Self::lookup_account(touched, frame, chain, address, block));
            }
        }
        let frame = &mut callstack[idx];
        Self::rewind_transfer(frame, from, to, value, false);
        if kind.is_create() {
            frame.created.insert(to);
        }
        self.stated.push(idx);
    }

    fn capture_exit(
        &mut self,
        chain: &mut dyn ChainState,
        output: &[u8],
        gas_used: u64,
        err: Option<&EvmError>,
    ) {
        assert!(self.callstack.len() > 1, "capture_exit without a matching capture_enter");
        let mut frame = self.callstack.pop().expect("checked length");
        frame.gas_used = gas_used;
        frame.finish(output, err);

        // reconcile before touching the cache: the post-state of a failed
        // frame must read the engine's already-rolled-back journal, not the
        // resynced cache values
        if frame.is_state {
            reconcile_frame(&mut frame, chain);
        }

        if frame.kind.needs_snapshot() {
            let pending = self
                .pending
                .pop()
                .unwrap_or_else(|| panic!("exiting {} without a snapshot", frame.kind));
            if err.is_some() {
                let resync = self.touched.resync_on_revert();
                self.touched.revert_to(&pending.snapshot, chain, resync);
            } else {
                // the call went through: the backend's post-call values for
                // the caller, the callee, and any created contract are now
                // authoritative
                match pending.kind {
                    CallKind::Call | CallKind::CallCode => {
                        let fields = AccountFields::BALANCE | AccountFields::NONCE;
                        self.touched.refresh_account(chain, pending.from, fields);
                        self.touched.refresh_account(chain, pending.to, fields);
                    }
                    CallKind::Create => {
                        let fields = AccountFields::BALANCE | AccountFields::NONCE;
                        self.touched.refresh_account(chain, pending.from, fields);
                        self.touched.refresh_account(
                            chain,
                            pending.to,
                            fields | AccountFields::CODE,
                        );
                    }
                    CallKind::Create2 => {
                        self.touched.refresh_account(chain, pending.from, AccountFields::NONCE);
                        self.touched.refresh_account(
                            chain,
                            pending.to,
                            AccountFields::NONCE | AccountFields::CODE,
                        );
                    }
                    CallKind::DelegateCall | CallKind::StaticCall => {}
                    CallKind::SelfDestruct => unreachable!("selfdestruct takes no snapshot"),
                }
            }
        }

        if frame.is_state {
            let popped = self.stated.pop();
            debug_assert_eq!(popped, Some(self.callstack.len()));
        }
        self.callstack.last_mut().expect("parent frame").calls.push(frame);
    }

    fn capture_state(&mut self, chain: &mut dyn ChainState, ctx: &OpContext<'_>) {
        let Some(kind) = ctx.op.hook_kind() else { return };

        if let HookKind::Log(topic_count) = kind {
            self.record_log(ctx, topic_count);
            return;
        }

        self.materialize(chain, kind, ctx);

        if self.stated.is_empty() {
            return;
        }
        if matches!(kind, HookKind::Call(_)) {
            self.call_location = ctx.pc;
        }
        let Some(action) = self.resolve_action(chain, kind, ctx) else { return };

        let block = self.block_number;
        let executing = ctx.address;
        let Self { touched, callstack, stated, fatal, .. } = self;
        for idx in stated.iter().copied() {
            let frame = &mut callstack[idx];
            match &action {
                StepAction::Storage { slot } => {
                    Self::lookup_storage(frame, chain, executing, *slot);
                }
                StepAction::AccountRef { address } | StepAction::CallTarget { address } => {
                    note_fatal(fatal, Self::lookup_account(touched, frame, chain, *address, block));
                }
                StepAction::SelfDestruct { beneficiary } => {
                    note_fatal(
                        fatal,
                        Self::lookup_account(touched, frame, chain, *beneficiary, block),
                    );
                    frame.deleted.insert(executing);
                }
                StepAction::Created { address } => {
                    note_fatal(fatal, Self::lookup_account(touched, frame, chain, *address, block));
                    frame.created.insert(*address);
                }
                StepAction::Branch { record } => frame.branch.push(*record),
            }
        }
    }
}

fn note_fatal(slot: &mut Option<ReplayError>, result: Result<(), ReplayError>) {
    if let Err(err) = result {
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}
