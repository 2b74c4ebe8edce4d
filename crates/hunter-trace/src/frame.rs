//! The call tree produced by a replay and its serialized form.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_primitives::{map::AddressHashSet, Address, Bytes, B256, U256};
use alloy_sol_types::{Revert, SolError};
use serde::{Deserialize, Serialize};

use crate::{CallKind, EvmError, ReplayError, StateMap, TokenBalanceMap};

/// An event emitted inside a call frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLog {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics, including the signature hash.
    pub topics: Vec<B256>,
    /// Unindexed payload.
    pub data: Bytes,
    /// Number of sub-calls the frame had made when the log was emitted,
    /// which orders logs relative to sub-calls.
    #[serde(rename = "index")]
    pub position: u64,
}

/// Outcome of one conditional jump, recorded for watched contracts only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Program counter of the `JUMPI`.
    pub pc: u64,
    /// Where control flow continued: the jump target when taken, the next
    /// instruction otherwise.
    pub destination: u64,
    /// Whether the branch was taken.
    #[serde(rename = "cond")]
    pub taken: bool,
}

/// One entry/exit pair of the execution call stack.
///
/// Child frames are exclusively owned by their parent; the whole tree is
/// owned by its [`Transaction`] and torn down with it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    /// The operation that opened this frame.
    #[serde(rename = "type")]
    pub kind: CallKind,
    /// Caller address.
    pub from: Address,
    /// Callee or created contract; `None` for a failed creation.
    pub to: Option<Address>,
    /// Transferred value, `None` where the kind transfers nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    /// Call data or init code.
    pub input: Bytes,
    /// Return or revert data.
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub output: Bytes,
    /// Whether the destination had code when the frame opened.
    pub is_contract: bool,
    /// Gas available to the frame.
    pub gas: u64,
    /// Gas consumed by the frame, including sub-calls.
    pub gas_used: u64,
    /// Execution error, if the frame failed.
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Decoded revert reason, when the revert data carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    /// Events emitted directly by this frame.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<CallLog>,
    /// Nested frames, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallFrame>,
    /// Program counter of the call site inside the parent frame.
    pub call_location: u64,
    /// Whether pre/post-state recording is enabled for this frame.
    pub is_state: bool,
    /// Accounts created inside this frame.
    #[serde(skip)]
    pub created: AddressHashSet,
    /// Accounts destroyed inside this frame.
    #[serde(skip)]
    pub deleted: AddressHashSet,
    /// State of every touched account as of frame entry.
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub pre_state: StateMap,
    /// State of the same accounts as of frame exit.
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub post_state: StateMap,
    /// Token balances per watched holder before the frame.
    #[serde(default, skip_serializing_if = "TokenBalanceMap::is_empty")]
    pub pre_token_balance: TokenBalanceMap,
    /// Token balances per watched holder after the frame.
    #[serde(default, skip_serializing_if = "TokenBalanceMap::is_empty")]
    pub post_token_balance: TokenBalanceMap,
    /// Conditional-jump outcomes, recorded for watched contracts only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch: Vec<BranchRecord>,
}

impl CallFrame {
    /// Opens a new frame.
    pub fn new(
        kind: CallKind,
        from: Address,
        to: Address,
        value: U256,
        input: &[u8],
        gas: u64,
        is_contract: bool,
    ) -> Self {
        Self {
            kind,
            from,
            to: Some(to),
            value: Some(value),
            input: Bytes::copy_from_slice(input),
            output: Bytes::new(),
            is_contract,
            gas,
            gas_used: 0,
            error: None,
            revert_reason: None,
            logs: Vec::new(),
            calls: Vec::new(),
            call_location: 0,
            is_state: false,
            created: AddressHashSet::default(),
            deleted: AddressHashSet::default(),
            pre_state: StateMap::default(),
            post_state: StateMap::default(),
            pre_token_balance: TokenBalanceMap::default(),
            post_token_balance: TokenBalanceMap::default(),
            branch: Vec::new(),
        }
    }

    /// Whether this frame failed.
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Attaches the execution result to the frame.
    ///
    /// Failed creations lose their `to` address; deliberate reverts keep
    /// their output and get the revert reason decoded when the data carries
    /// a solidity `Error(string)`.
    pub fn finish(&mut self, output: &[u8], err: Option<&EvmError>) {
        let Some(err) = err else {
            self.output = Bytes::copy_from_slice(output);
            return;
        };
        self.error = Some(err.to_string());
        if self.kind.is_create() {
            self.to = None;
        }
        if !err.is_revert() || output.is_empty() {
            return;
        }
        self.output = Bytes::copy_from_slice(output);
        if output.len() < 4 {
            return;
        }
        if let Ok(revert) = Revert::abi_decode(output, true) {
            self.revert_reason = Some(revert.reason);
        }
    }

    /// Drops the logs of this frame and all descendants of failed subtrees:
    /// a reverted frame's events never happened.
    pub fn clear_failed_logs(&mut self, parent_failed: bool) {
        let failed = self.failed() || parent_failed;
        if failed {
            self.logs.clear();
        }
        for call in &mut self.calls {
            call.clear_failed_logs(failed);
        }
    }

    /// Visits this frame and every descendant, depth first.
    pub fn walk(&self, visit: &mut impl FnMut(&CallFrame)) {
        visit(self);
        for call in &self.calls {
            call.walk(visit);
        }
    }
}

/// A fully replayed transaction and its call tree.
///
/// Created once per replayed transaction, fully populated by the time the
/// replay returns, immutable afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Hash of the replayed transaction, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    /// Number of the containing block.
    pub block_number: u64,
    /// Timestamp of the containing block.
    pub timestamp: u64,
    /// Index of the transaction inside its block.
    #[serde(rename = "position")]
    pub tx_index: u64,
    /// Gas limit the transaction started with.
    #[serde(skip)]
    pub initial_gas: u64,
    /// The root call frame.
    pub call: CallFrame,
}

impl Transaction {
    /// The block/index replay position of this transaction.
    pub fn position(&self) -> ReplayPosition {
        ReplayPosition { block: self.block_number, index: self.tx_index }
    }

    /// Serializes the tree to `<dir>/<blockNumber>_<txIndex>.json`.
    pub fn dump_tree(&self, dir: &Path) -> Result<PathBuf, ReplayError> {
        let path = dir.join(format!("{}_{}.json", self.block_number, self.tx_index));
        fs::write(&path, serde_json::to_vec(self)?)?;
        Ok(path)
    }

    /// Serializes the tree to `<dir>/<txHash>.json`. Falls back to the
    /// positional name when the hash is unknown.
    pub fn dump_tree_by_hash(&self, dir: &Path) -> Result<PathBuf, ReplayError> {
        let Some(hash) = self.tx_hash else {
            return self.dump_tree(dir);
        };
        let path = dir.join(format!("{hash}.json"));
        fs::write(&path, serde_json::to_vec(self)?)?;
        Ok(path)
    }

    /// Reads a dumped tree back.
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// A `<block>_<index>` replay position, ordered block first.
///
/// Batch inputs name transactions by this key; replaying them sorted by it
/// is what guarantees the in-block ordering property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplayPosition {
    /// Block number.
    pub block: u64,
    /// Transaction index within the block.
    pub index: u64,
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.block, self.index)
    }
}

impl FromStr for ReplayPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (block, index) =
            s.split_once('_').ok_or_else(|| format!("malformed replay position: {s}"))?;
        let block = block.parse().map_err(|_| format!("malformed block number: {s}"))?;
        let index = index.parse().map_err(|_| format!("malformed tx index: {s}"))?;
        Ok(Self { block, index })
    }
}
