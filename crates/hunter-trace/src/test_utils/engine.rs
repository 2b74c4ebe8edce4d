//! A scripted execution engine.
//!
//! Interprets a list of high-level steps, firing the same hook sequence and
//! applying the same state effects a real VM would: intrinsic nonce bump and
//! value transfer before `capture_start`, journaled writes rolled back
//! before a failing frame's `capture_exit`, enter/exit pairs even for
//! frames that execute nothing.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

use crate::{
    CallKind, CallMessage, ChainState, EvmError, ExecutionEngine, ExecutionOutcome, IERC20, Op,
    OpContext, ReplayError, TraceHooks,
};
use alloy_sol_types::{SolCall, SolEvent};

/// One scripted action inside a call body.
#[derive(Clone, Debug)]
pub enum Step {
    /// Read a storage slot of the executing contract.
    SLoad {
        /// The slot to read.
        slot: B256,
    },
    /// Write a storage slot of the executing contract.
    SStore {
        /// The slot to write.
        slot: B256,
        /// The value to write.
        value: B256,
    },
    /// Query the balance of an account.
    BalanceOf {
        /// The queried account.
        address: Address,
    },
    /// Query the code size of an account.
    ExtCodeSize {
        /// The queried account.
        address: Address,
    },
    /// Emit a log with the given topics and data.
    Emit {
        /// Indexed topics, including the signature hash.
        topics: Vec<B256>,
        /// Unindexed payload.
        data: Bytes,
    },
    /// Take a conditional jump.
    Jumpi {
        /// Program counter of the jump instruction.
        pc: u64,
        /// Jump target.
        target: u64,
        /// Whether the condition held.
        taken: bool,
    },
    /// Destroy the executing contract, crediting `beneficiary`.
    SelfDestruct {
        /// The balance beneficiary.
        beneficiary: Address,
    },
    /// Perform a nested call.
    Call(Box<ScriptCall>),
    /// Perform a `CREATE2` deployment.
    Create2(Box<ScriptCreate>),
}

/// A scripted nested call.
#[derive(Clone, Debug)]
pub struct ScriptCall {
    /// Callee.
    pub to: Address,
    /// Transferred value.
    pub value: U256,
    /// Call data.
    pub input: Bytes,
    /// Gas handed to the callee.
    pub gas: u64,
    /// Gas the callee reports as used.
    pub gas_used: u64,
    /// The callee's own steps.
    pub body: Vec<Step>,
    /// Return data on success, revert data on failure.
    pub output: Bytes,
    /// When set, the call fails and its state effects roll back.
    pub error: Option<EvmError>,
}

impl Default for ScriptCall {
    fn default() -> Self {
        Self {
            to: Address::ZERO,
            value: U256::ZERO,
            input: Bytes::new(),
            gas: 100_000,
            gas_used: 50_000,
            body: Vec::new(),
            output: Bytes::new(),
            error: None,
        }
    }
}

/// A scripted `CREATE2` deployment.
#[derive(Clone, Debug)]
pub struct ScriptCreate {
    /// Deployment salt.
    pub salt: B256,
    /// Init code placed in memory at the create site.
    pub init_code: Bytes,
    /// Runtime code installed on success.
    pub deployed_code: Bytes,
    /// Endowment transferred to the new contract.
    pub value: U256,
    /// Gas handed to the creation frame.
    pub gas: u64,
    /// When set, the creation fails and its state effects roll back.
    pub error: Option<EvmError>,
}

impl Default for ScriptCreate {
    fn default() -> Self {
        Self {
            salt: B256::ZERO,
            init_code: Bytes::from_static(&[0x60, 0x00]),
            deployed_code: Bytes::from_static(&[0xfe]),
            value: U256::ZERO,
            gas: 100_000,
            error: None,
        }
    }
}

impl ScriptCreate {
    /// The address this creation deploys to when executed by `creator`.
    pub fn predicted_address(&self, creator: Address) -> Address {
        creator.create2(self.salt, keccak256(&self.init_code))
    }
}

enum Undo {
    Storage(Address, B256, B256),
    Balance(Address, U256),
    Nonce(Address, u64),
    Code(Address, Bytes),
}

/// An [`ExecutionEngine`] that replays a fixed script of steps.
#[derive(Clone, Debug, Default)]
pub struct ScriptEngine {
    /// Steps of the top-level frame.
    pub body: Vec<Step>,
    /// Return data of the top-level frame.
    pub output: Bytes,
    /// Failure of the top-level frame, if any.
    pub error: Option<EvmError>,
    /// Gas the transaction reports as used.
    pub gas_used: u64,
}

impl ExecutionEngine for ScriptEngine {
    fn execute(
        &mut self,
        chain: &mut dyn ChainState,
        hooks: &mut dyn TraceHooks,
        msg: &CallMessage,
    ) -> Result<ExecutionOutcome, ReplayError> {
        let to = msg.to.expect("the script engine only executes calls");
        let body = self.body.clone();

        hooks.capture_tx_start(msg.gas_limit);

        // intrinsic effects: the nonce bump survives even a top-level
        // failure, the value transfer does not
        let nonce = chain.nonce(msg.from);
        chain.set_nonce(msg.from, nonce + 1);
        let mut journal = Vec::new();
        transfer(chain, &mut journal, msg.from, to, msg.value);

        hooks.capture_start(chain, msg.from, to, false, &msg.input, msg.gas_limit, msg.value);
        run_steps(chain, hooks, &body, to, 1, &mut journal);

        if self.error.is_some() {
            undo_to(chain, &mut journal, 0);
        }
        hooks.capture_end(chain, &self.output, self.gas_used, self.error.as_ref());
        hooks.capture_tx_end(msg.gas_limit - self.gas_used);

        Ok(ExecutionOutcome {
            output: self.output.clone(),
            gas_used: self.gas_used,
            error: self.error.clone(),
        })
    }
}

fn word(address: Address) -> U256 {
    U256::from_be_bytes(address.into_word().0)
}

fn u(value: B256) -> U256 {
    U256::from_be_bytes(value.0)
}

fn fire_step(
    hooks: &mut dyn TraceHooks,
    chain: &mut dyn ChainState,
    op: Op,
    pc: u64,
    depth: usize,
    address: Address,
    stack: &[U256],
    memory: &[u8],
) {
    let ctx = OpContext { pc, op, gas: 1_000_000, cost: 0, depth, address, stack, memory };
    hooks.capture_state(chain, &ctx);
}

fn transfer(
    chain: &mut dyn ChainState,
    journal: &mut Vec<Undo>,
    from: Address,
    to: Address,
    value: U256,
) {
    if value.is_zero() {
        return;
    }
    let from_balance = chain.balance(from);
    journal.push(Undo::Balance(from, from_balance));
    chain.set_balance(from, from_balance.saturating_sub(value));
    let to_balance = chain.balance(to);
    journal.push(Undo::Balance(to, to_balance));
    chain.set_balance(to, to_balance + value);
}

fn undo_to(chain: &mut dyn ChainState, journal: &mut Vec<Undo>, mark: usize) {
    while journal.len() > mark {
        match journal.pop().expect("checked length") {
            Undo::Storage(address, slot, value) => chain.set_storage(address, slot, value),
            Undo::Balance(address, balance) => chain.set_balance(address, balance),
            Undo::Nonce(address, nonce) => chain.set_nonce(address, nonce),
            Undo::Code(address, code) => chain.set_code(address, code),
        }
    }
}

fn run_steps(
    chain: &mut dyn ChainState,
    hooks: &mut dyn TraceHooks,
    steps: &[Step],
    address: Address,
    depth: usize,
    journal: &mut Vec<Undo>,
) {
    for (pc, step) in steps.iter().enumerate() {
        let pc = pc as u64;
        match step {
            Step::SLoad { slot } => {
                fire_step(hooks, chain, Op::SLOAD, pc, depth, address, &[u(*slot)], &[]);
                let _ = chain.storage(address, *slot);
            }
            Step::SStore { slot, value } => {
                let stack = [u(*value), u(*slot)];
                fire_step(hooks, chain, Op::SSTORE, pc, depth, address, &stack, &[]);
                journal.push(Undo::Storage(address, *slot, chain.storage(address, *slot)));
                chain.set_storage(address, *slot, *value);
            }
            Step::BalanceOf { address: target } => {
                fire_step(hooks, chain, Op::BALANCE, pc, depth, address, &[word(*target)], &[]);
                let _ = chain.balance(*target);
            }
            Step::ExtCodeSize { address: target } => {
                fire_step(hooks, chain, Op::EXTCODESIZE, pc, depth, address, &[word(*target)], &[]);
                let _ = chain.code(*target);
            }
            Step::Emit { topics, data } => {
                let op = Op(Op::LOG0.get() + topics.len() as u8);
                let mut stack: Vec<U256> = topics.iter().rev().map(|topic| u(*topic)).collect();
                stack.push(U256::from(data.len())); // size
                stack.push(U256::ZERO); // offset
                fire_step(hooks, chain, op, pc, depth, address, &stack, data);
            }
            Step::Jumpi { pc: jump_pc, target, taken } => {
                let stack = [U256::from(u64::from(*taken)), U256::from(*target)];
                fire_step(hooks, chain, Op::JUMPI, *jump_pc, depth, address, &stack, &[]);
            }
            Step::SelfDestruct { beneficiary } => {
                fire_step(
                    hooks,
                    chain,
                    Op::SELFDESTRUCT,
                    pc,
                    depth,
                    address,
                    &[word(*beneficiary)],
                    &[],
                );
                let balance = chain.balance(address);
                journal.push(Undo::Balance(address, balance));
                chain.set_balance(address, U256::ZERO);
                let beneficiary_balance = chain.balance(*beneficiary);
                journal.push(Undo::Balance(*beneficiary, beneficiary_balance));
                chain.set_balance(*beneficiary, beneficiary_balance + balance);
            }
            Step::Call(call) => {
                let stack = [
                    U256::ZERO, // ret size
                    U256::ZERO, // ret offset
                    U256::from(call.input.len()),
                    U256::ZERO, // args offset
                    call.value,
                    word(call.to),
                    U256::from(call.gas),
                ];
                fire_step(hooks, chain, Op::CALL, pc, depth, address, &stack, &call.input);

                let mark = journal.len();
                transfer(chain, journal, address, call.to, call.value);
                hooks.capture_enter(
                    chain,
                    CallKind::Call,
                    address,
                    call.to,
                    &call.input,
                    call.gas,
                    call.value,
                );
                run_steps(chain, hooks, &call.body, call.to, depth + 1, journal);
                if call.error.is_some() {
                    undo_to(chain, journal, mark);
                }
                hooks.capture_exit(chain, &call.output, call.gas_used, call.error.as_ref());
            }
            Step::Create2(create) => {
                let stack = [
                    u(create.salt),
                    U256::from(create.init_code.len()),
                    U256::ZERO, // init code offset
                    create.value,
                ];
                fire_step(hooks, chain, Op::CREATE2, pc, depth, address, &stack, &create.init_code);

                let deployed = create.predicted_address(address);
                // the creator's nonce bump survives even a failed creation
                chain.set_nonce(address, chain.nonce(address) + 1);
                let mark = journal.len();
                transfer(chain, journal, address, deployed, create.value);
                hooks.capture_enter(
                    chain,
                    CallKind::Create2,
                    address,
                    deployed,
                    &create.init_code,
                    create.gas,
                    create.value,
                );
                if create.error.is_some() {
                    undo_to(chain, journal, mark);
                    hooks.capture_exit(chain, &[], create.gas, create.error.as_ref());
                } else {
                    journal.push(Undo::Code(deployed, chain.code(deployed)));
                    chain.set_code(deployed, create.deployed_code.clone());
                    journal.push(Undo::Nonce(deployed, chain.nonce(deployed)));
                    chain.set_nonce(deployed, 1);
                    hooks.capture_exit(chain, &create.deployed_code, create.gas, None);
                }
            }
        }
    }
}

/// An engine emulating a minimal ERC-20 token with balances in a
/// `mapping(address => uint256)` at slot 0.
///
/// `transfer(to, amount)` fires the full hook sequence through a script;
/// `balanceOf(owner)` answers directly from storage, the way a read-only
/// probe would.
#[derive(Clone, Copy, Debug)]
pub struct Erc20Engine {
    /// Gas reported for a transfer.
    pub transfer_gas: u64,
}

impl Default for Erc20Engine {
    fn default() -> Self {
        Self { transfer_gas: 51_000 }
    }
}

impl Erc20Engine {
    /// Storage slot of `holder`'s balance.
    pub fn balance_slot(holder: Address) -> B256 {
        let mut preimage = [0u8; 64];
        preimage[12..32].copy_from_slice(holder.as_slice());
        keccak256(preimage)
    }
}

impl ExecutionEngine for Erc20Engine {
    fn execute(
        &mut self,
        chain: &mut dyn ChainState,
        hooks: &mut dyn TraceHooks,
        msg: &CallMessage,
    ) -> Result<ExecutionOutcome, ReplayError> {
        let Some(token) = msg.to else {
            return Err(EvmError::Other("token engine cannot create contracts".into()).into());
        };

        if let Ok(call) = IERC20::balanceOfCall::abi_decode(&msg.input, true) {
            let balance = chain.storage(token, Self::balance_slot(call.owner));
            return Ok(ExecutionOutcome {
                output: Bytes::copy_from_slice(balance.as_slice()),
                gas_used: 24_000,
                error: None,
            });
        }

        let call = IERC20::transferCall::abi_decode(&msg.input, true)
            .map_err(|err| EvmError::Other(format!("unrecognized calldata: {err}")))?;
        let from_slot = Self::balance_slot(msg.from);
        let to_slot = Self::balance_slot(call.to);
        let from_balance = u(chain.storage(token, from_slot));
        let to_balance = u(chain.storage(token, to_slot));

        let mut script = if from_balance < call.amount {
            ScriptEngine {
                body: vec![Step::SLoad { slot: from_slot }],
                output: Bytes::new(),
                error: Some(EvmError::Reverted),
                gas_used: self.transfer_gas,
            }
        } else {
            ScriptEngine {
                body: vec![
                    Step::SLoad { slot: from_slot },
                    Step::SStore { slot: from_slot, value: B256::from(from_balance - call.amount) },
                    Step::SLoad { slot: to_slot },
                    Step::SStore { slot: to_slot, value: B256::from(to_balance + call.amount) },
                    Step::Emit {
                        topics: vec![
                            IERC20::Transfer::SIGNATURE_HASH,
                            msg.from.into_word(),
                            call.to.into_word(),
                        ],
                        data: Bytes::copy_from_slice(&call.amount.to_be_bytes::<32>()),
                    },
                ],
                output: Bytes::copy_from_slice(B256::with_last_byte(1).as_slice()),
                error: None,
                gas_used: self.transfer_gas,
            }
        };
        script.execute(chain, hooks, msg)
    }
}
