//! Opcode identification for the tracing hooks.
//!
//! The tracer only distinguishes the state-affecting opcodes; everything else
//! passes through untouched. Classification goes through a 256-entry table
//! resolved once at construction instead of per-instruction comparisons.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A raw EVM opcode as delivered by the execution engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Op(pub u8);

impl Op {
    /// `BALANCE` opcode.
    pub const BALANCE: Self = Self(0x31);
    /// `EXTCODESIZE` opcode.
    pub const EXTCODESIZE: Self = Self(0x3b);
    /// `EXTCODECOPY` opcode.
    pub const EXTCODECOPY: Self = Self(0x3c);
    /// `EXTCODEHASH` opcode.
    pub const EXTCODEHASH: Self = Self(0x3f);
    /// `SLOAD` opcode.
    pub const SLOAD: Self = Self(0x54);
    /// `SSTORE` opcode.
    pub const SSTORE: Self = Self(0x55);
    /// `JUMPI` opcode.
    pub const JUMPI: Self = Self(0x57);
    /// `LOG0` opcode. `LOG1`..`LOG4` follow contiguously.
    pub const LOG0: Self = Self(0xa0);
    /// `LOG4` opcode.
    pub const LOG4: Self = Self(0xa4);
    /// `CREATE` opcode.
    pub const CREATE: Self = Self(0xf0);
    /// `CALL` opcode.
    pub const CALL: Self = Self(0xf1);
    /// `CALLCODE` opcode.
    pub const CALLCODE: Self = Self(0xf2);
    /// `DELEGATECALL` opcode.
    pub const DELEGATECALL: Self = Self(0xf4);
    /// `CREATE2` opcode.
    pub const CREATE2: Self = Self(0xf5);
    /// `STATICCALL` opcode.
    pub const STATICCALL: Self = Self(0xfa);
    /// `SELFDESTRUCT` opcode.
    pub const SELFDESTRUCT: Self = Self(0xff);

    /// The raw byte value.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Looks up what the tracer has to do for this opcode, if anything.
    pub fn hook_kind(self) -> Option<HookKind> {
        HOOK_TABLE[self.0 as usize]
    }
}

/// The kind of a call frame, i.e. the operation that opened the frame.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum CallKind {
    /// A plain message call.
    #[serde(rename = "CALL")]
    #[display("CALL")]
    Call,
    /// A call executing foreign code against the caller's storage.
    #[serde(rename = "CALLCODE")]
    #[display("CALLCODE")]
    CallCode,
    /// A call preserving caller context.
    #[serde(rename = "DELEGATECALL")]
    #[display("DELEGATECALL")]
    DelegateCall,
    /// A read-only call.
    #[serde(rename = "STATICCALL")]
    #[display("STATICCALL")]
    StaticCall,
    /// Contract creation with nonce-derived address.
    #[serde(rename = "CREATE")]
    #[display("CREATE")]
    Create,
    /// Contract creation with salt-derived address.
    #[serde(rename = "CREATE2")]
    #[display("CREATE2")]
    Create2,
    /// Account destruction transferring the remaining balance.
    #[serde(rename = "SELFDESTRUCT")]
    #[display("SELFDESTRUCT")]
    SelfDestruct,
}

impl CallKind {
    /// Whether this frame deploys a contract.
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Create | Self::Create2)
    }

    /// Whether entering this frame requires a touch-cache snapshot.
    ///
    /// Snapshot/revert wraps every call kind that can perturb state that the
    /// VM would roll back on failure; `SELFDESTRUCT` has no failure path of
    /// its own.
    pub const fn needs_snapshot(self) -> bool {
        !matches!(self, Self::SelfDestruct)
    }
}

/// What the tracer does when it observes a given opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// `SLOAD`: materialize and record the referenced slot.
    StorageLoad,
    /// `SSTORE`: materialize the slot's prior value, record the written one.
    StorageStore,
    /// `BALANCE`: materialize the referenced account's balance.
    BalanceRef,
    /// `EXTCODESIZE`/`EXTCODECOPY`/`EXTCODEHASH`: materialize the referenced
    /// account's code.
    CodeRef,
    /// `CALL`/`CALLCODE`/`DELEGATECALL`/`STATICCALL`: materialize the callee
    /// account and remember the call site.
    Call(CallKind),
    /// `CREATE`: predict the deployment address.
    Create,
    /// `CREATE2`: predict the deployment address from salt and init code.
    Create2,
    /// `SELFDESTRUCT`: record the beneficiary and mark the caller deleted.
    SelfDestruct,
    /// `JUMPI`: record the branch outcome for watched contracts.
    Branch,
    /// `LOG0`..`LOG4`: record an emitted event with n topics.
    Log(u8),
}

static HOOK_TABLE: Lazy<[Option<HookKind>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    table[Op::SLOAD.0 as usize] = Some(HookKind::StorageLoad);
    table[Op::SSTORE.0 as usize] = Some(HookKind::StorageStore);
    table[Op::BALANCE.0 as usize] = Some(HookKind::BalanceRef);
    table[Op::EXTCODESIZE.0 as usize] = Some(HookKind::CodeRef);
    table[Op::EXTCODECOPY.0 as usize] = Some(HookKind::CodeRef);
    table[Op::EXTCODEHASH.0 as usize] = Some(HookKind::CodeRef);
    table[Op::CALL.0 as usize] = Some(HookKind::Call(CallKind::Call));
    table[Op::CALLCODE.0 as usize] = Some(HookKind::Call(CallKind::CallCode));
    table[Op::DELEGATECALL.0 as usize] = Some(HookKind::Call(CallKind::DelegateCall));
    table[Op::STATICCALL.0 as usize] = Some(HookKind::Call(CallKind::StaticCall));
    table[Op::CREATE.0 as usize] = Some(HookKind::Create);
    table[Op::CREATE2.0 as usize] = Some(HookKind::Create2);
    table[Op::SELFDESTRUCT.0 as usize] = Some(HookKind::SelfDestruct);
    table[Op::JUMPI.0 as usize] = Some(HookKind::Branch);
    for n in 0..=4u8 {
        table[(Op::LOG0.0 + n) as usize] = Some(HookKind::Log(n));
    }
    table
});
