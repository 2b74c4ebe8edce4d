//! Account state as observed by the tracer.

use alloy_primitives::{
    map::{AddressHashMap, B256HashMap},
    Bytes, B256, U256,
};
use serde::{Deserialize, Serialize};

/// Map from account address to its observed state.
///
/// Used both for frame pre/post-state maps and for pre-supplied allocation
/// data in provided-prestate mode.
pub type StateMap = AddressHashMap<Account>;

/// Per-token, per-holder balance table: `token -> holder -> balance`.
pub type TokenBalanceMap = AddressHashMap<AddressHashMap<U256>>;

/// The state of a single account, restricted to the fields the tracer has
/// established ground truth for.
///
/// A `balance` of `None` means "unknown": the account was referenced but its
/// balance was never read. Storage keys are present only if touched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account balance in wei. `None` means the balance was never observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    /// Account nonce.
    #[serde(default, skip_serializing_if = "is_zero_nonce")]
    pub nonce: u64,
    /// Contract code, empty for externally owned accounts.
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub code: Bytes,
    /// Touched storage slots.
    #[serde(default, skip_serializing_if = "B256HashMap::is_empty")]
    pub storage: B256HashMap<B256>,
}

fn is_zero_nonce(nonce: &u64) -> bool {
    *nonce == 0
}

impl Account {
    /// Whether the account had any real identity: a non-zero nonce, code,
    /// touched storage, or a non-zero balance.
    ///
    /// Used to decide whether a freshly created contract existed before the
    /// creating call, i.e. whether its synthetic prestate entry should be
    /// kept or pruned.
    pub fn exists(&self) -> bool {
        self.nonce > 0
            || !self.code.is_empty()
            || !self.storage.is_empty()
            || self.balance.is_some_and(|balance| !balance.is_zero())
    }
}
