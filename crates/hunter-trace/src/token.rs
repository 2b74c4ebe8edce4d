//! Token-flow extraction over finished call trees.
//!
//! A straightforward visitor and the primary downstream consumer of the
//! recorder's output: it classifies emitted logs into token-event shapes and
//! rebuilds per-token balance tables for watched frames by re-executing
//! read-only `balanceOf` queries against state overlays reconstructed from
//! the frame's pre- and post-state.

use alloy_primitives::{address, b256, map::AddressHashSet, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use tracing::debug;

use crate::{
    CallFrame, CallLog, CallMessage, ChainState, ExecutionEngine, NoopHooks, ReplayError,
    StateMap, TokenBalanceMap,
};

sol! {
    /// The ERC-20 surface the extractor understands.
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    /// Wrapped-ether deposit shape.
    interface IWETH {
        event Deposit(address indexed dst, uint256 wad);
    }
}

/// `Swap` of Uniswap V2 pairs (3 topics).
pub const UNISWAP_V2_SWAP_TOPIC: B256 =
    b256!("0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822");

/// `Swap` of Uniswap V3 pools (3 topics).
pub const UNISWAP_V3_SWAP_TOPIC: B256 =
    b256!("0xc42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67");

/// `TransferSingle` of ERC-1155 tokens (4 topics).
pub const ERC1155_TRANSFER_SINGLE_TOPIC: B256 =
    b256!("0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62");

/// Sender used for the read-only balance probes.
const PROBE_SENDER: Address = address!("0x0000000000000000000000000000000000000001");

/// Gas limit for one balance probe.
const PROBE_GAS: u64 = 8_000_000;

/// A recognized token event shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenEvent {
    /// ERC-20 `Transfer(from, to, value)`.
    Erc20Transfer {
        /// Emitting token contract.
        token: Address,
        /// Debited holder.
        from: Address,
        /// Credited holder.
        to: Address,
    },
    /// WETH-style `Deposit(dst, wad)`.
    Deposit {
        /// Emitting token contract.
        token: Address,
        /// Credited holder.
        dst: Address,
    },
    /// ERC-721 `Transfer(from, to, tokenId)` (same signature as ERC-20, but
    /// with the token id indexed as a fourth topic).
    Erc721Transfer {
        /// Emitting collection contract.
        token: Address,
        /// Previous owner.
        from: Address,
        /// New owner.
        to: Address,
    },
    /// ERC-1155 `TransferSingle(operator, from, to, id, value)`.
    Erc1155TransferSingle {
        /// Emitting token contract.
        token: Address,
        /// Debited holder.
        from: Address,
        /// Credited holder.
        to: Address,
    },
    /// Uniswap V2 `Swap`.
    UniswapV2Swap {
        /// The pair contract.
        pool: Address,
    },
    /// Uniswap V3 `Swap`.
    UniswapV3Swap {
        /// The pool contract.
        pool: Address,
    },
}

/// Classifies a log by topic signature and topic count.
pub fn classify_log(log: &CallLog) -> Option<TokenEvent> {
    let topic0 = *log.topics.first()?;
    let topics = log.topics.len();
    let token = log.address;
    if topic0 == IERC20::Transfer::SIGNATURE_HASH && topics == 3 {
        Some(TokenEvent::Erc20Transfer {
            token,
            from: Address::from_word(log.topics[1]),
            to: Address::from_word(log.topics[2]),
        })
    } else if topic0 == IERC20::Transfer::SIGNATURE_HASH && topics == 4 {
        Some(TokenEvent::Erc721Transfer {
            token,
            from: Address::from_word(log.topics[1]),
            to: Address::from_word(log.topics[2]),
        })
    } else if topic0 == IWETH::Deposit::SIGNATURE_HASH && topics == 2 {
        Some(TokenEvent::Deposit { token, dst: Address::from_word(log.topics[1]) })
    } else if topic0 == UNISWAP_V2_SWAP_TOPIC && topics == 3 {
        Some(TokenEvent::UniswapV2Swap { pool: token })
    } else if topic0 == UNISWAP_V3_SWAP_TOPIC && topics == 3 {
        Some(TokenEvent::UniswapV3Swap { pool: token })
    } else if topic0 == ERC1155_TRANSFER_SINGLE_TOPIC && topics == 4 {
        Some(TokenEvent::Erc1155TransferSingle {
            token,
            from: Address::from_word(log.topics[2]),
            to: Address::from_word(log.topics[3]),
        })
    } else {
        None
    }
}

/// Addresses and tokens a call tree moved value between.
#[derive(Clone, Debug, Default)]
pub struct TokenFlows {
    /// Every address that sent or received tokens, plus every call
    /// destination in the tree.
    pub related_addresses: AddressHashSet,
    /// Every contract that emitted a recognized token event.
    pub related_tokens: AddressHashSet,
}

impl TokenFlows {
    /// Walks a finished call tree and collects related addresses and tokens.
    pub fn collect(root: &CallFrame) -> Self {
        let mut flows = Self::default();
        root.walk(&mut |frame| {
            if let Some(to) = frame.to {
                flows.related_addresses.insert(to);
            }
            for log in &frame.logs {
                flows.absorb(classify_log(log));
            }
        });
        flows
    }

    fn absorb(&mut self, event: Option<TokenEvent>) {
        match event {
            Some(
                TokenEvent::Erc20Transfer { token, from, to }
                | TokenEvent::Erc721Transfer { token, from, to }
                | TokenEvent::Erc1155TransferSingle { token, from, to },
            ) => {
                self.related_addresses.insert(from);
                self.related_addresses.insert(to);
                self.related_tokens.insert(token);
            }
            Some(TokenEvent::Deposit { token, dst }) => {
                self.related_addresses.insert(dst);
                self.related_tokens.insert(token);
            }
            Some(TokenEvent::UniswapV2Swap { pool } | TokenEvent::UniswapV3Swap { pool }) => {
                self.related_addresses.insert(pool);
            }
            None => {}
        }
    }

    /// The read-only message probing `balanceOf(holder)` on `token`.
    pub fn balance_message(token: Address, holder: Address) -> CallMessage {
        CallMessage {
            from: PROBE_SENDER,
            to: Some(token),
            value: U256::ZERO,
            input: Bytes::from(IERC20::balanceOfCall { owner: holder }.abi_encode()),
            gas_limit: PROBE_GAS,
        }
    }

    /// Attaches pre/post token-balance tables to every watched frame of the
    /// tree, probing balances through `engine` against state overlays
    /// reconstructed from the frame's own pre- and post-state.
    pub fn attach_balance_tables(
        &self,
        frame: &mut CallFrame,
        engine: &mut dyn ExecutionEngine,
    ) -> Result<(), ReplayError> {
        if frame.is_state {
            frame.pre_token_balance = self.probe_table(&frame.pre_state, engine)?;
            frame.post_token_balance = self.probe_table(&frame.post_state, engine)?;
        }
        for call in &mut frame.calls {
            self.attach_balance_tables(call, engine)?;
        }
        Ok(())
    }

    fn probe_table(
        &self,
        state: &StateMap,
        engine: &mut dyn ExecutionEngine,
    ) -> Result<TokenBalanceMap, ReplayError> {
        let mut table = TokenBalanceMap::default();
        if state.is_empty() {
            return Ok(table);
        }
        let mut overlay = StateOverlay::from_state(state);
        for token in &self.related_tokens {
            for holder in &self.related_addresses {
                if let Some(balance) = probe_balance(engine, &mut overlay, *token, *holder)? {
                    table.entry(*token).or_default().insert(*holder, balance);
                }
            }
        }
        Ok(table)
    }
}

/// Runs one balance probe. Decode failures and probe-level reverts omit the
/// entry instead of aborting the surrounding frame.
fn probe_balance(
    engine: &mut dyn ExecutionEngine,
    overlay: &mut StateOverlay,
    token: Address,
    holder: Address,
) -> Result<Option<U256>, ReplayError> {
    let msg = TokenFlows::balance_message(token, holder);
    let outcome = engine.execute(overlay, &mut NoopHooks, &msg)?;
    if let Some(err) = outcome.error {
        debug!(%token, %holder, %err, "balance probe failed, omitting entry");
        return Ok(None);
    }
    match IERC20::balanceOfCall::abi_decode_returns(&outcome.output, true) {
        Ok(ret) => Ok(Some(ret._0)),
        Err(err) => {
            debug!(%token, %holder, %err, "balance probe returned undecodable data, omitting entry");
            Ok(None)
        }
    }
}

/// An in-memory [`ChainState`] reconstructed from a frame state map.
///
/// Balance probes run against these instead of the live execution state, so
/// a frame's token tables reflect exactly the state the frame saw.
#[derive(Clone, Debug, Default)]
pub struct StateOverlay {
    accounts: StateMap,
}

impl StateOverlay {
    /// Builds an overlay from a frame's pre- or post-state.
    pub fn from_state(state: &StateMap) -> Self {
        Self { accounts: state.clone() }
    }
}

impl ChainState for StateOverlay {
    fn balance(&mut self, address: Address) -> U256 {
        self.accounts.get(&address).and_then(|account| account.balance).unwrap_or_default()
    }

    fn set_balance(&mut self, address: Address, balance: U256) {
        self.accounts.entry(address).or_default().balance = Some(balance);
    }

    fn nonce(&mut self, address: Address) -> u64 {
        self.accounts.get(&address).map(|account| account.nonce).unwrap_or_default()
    }

    fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.accounts.entry(address).or_default().nonce = nonce;
    }

    fn code(&mut self, address: Address) -> Bytes {
        self.accounts.get(&address).map(|account| account.code.clone()).unwrap_or_default()
    }

    fn set_code(&mut self, address: Address, code: Bytes) {
        self.accounts.entry(address).or_default().code = code;
    }

    fn storage(&mut self, address: Address, slot: B256) -> B256 {
        self.accounts
            .get(&address)
            .and_then(|account| account.storage.get(&slot))
            .copied()
            .unwrap_or_default()
    }

    fn set_storage(&mut self, address: Address, slot: B256, value: B256) {
        self.accounts.entry(address).or_default().storage.insert(slot, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallKind;

    const TOKEN: Address = address!("0x00000000000000000000000000000000000000cc");
    const FROM: Address = address!("0x00000000000000000000000000000000000000aa");
    const TO: Address = address!("0x00000000000000000000000000000000000000bb");

    fn log(topics: Vec<B256>) -> CallLog {
        CallLog { address: TOKEN, topics, data: Bytes::new(), position: 0 }
    }

    #[test]
    fn classifies_erc20_and_erc721_by_topic_count() {
        let erc20 = log(vec![
            IERC20::Transfer::SIGNATURE_HASH,
            FROM.into_word(),
            TO.into_word(),
        ]);
        assert_eq!(
            classify_log(&erc20),
            Some(TokenEvent::Erc20Transfer { token: TOKEN, from: FROM, to: TO })
        );

        let erc721 = log(vec![
            IERC20::Transfer::SIGNATURE_HASH,
            FROM.into_word(),
            TO.into_word(),
            B256::with_last_byte(7),
        ]);
        assert_eq!(
            classify_log(&erc721),
            Some(TokenEvent::Erc721Transfer { token: TOKEN, from: FROM, to: TO })
        );
    }

    #[test]
    fn unknown_topics_classify_as_nothing() {
        assert_eq!(classify_log(&log(vec![B256::with_last_byte(1), B256::ZERO])), None);
        assert_eq!(classify_log(&log(vec![])), None);
    }

    #[test]
    fn collect_gathers_transfer_parties_and_call_destinations() {
        let mut root = CallFrame::new(CallKind::Call, FROM, TOKEN, U256::ZERO, &[], 0, true);
        root.logs.push(log(vec![
            IERC20::Transfer::SIGNATURE_HASH,
            FROM.into_word(),
            TO.into_word(),
        ]));

        let flows = TokenFlows::collect(&root);
        assert!(flows.related_tokens.contains(&TOKEN));
        assert!(flows.related_addresses.contains(&FROM));
        assert!(flows.related_addresses.contains(&TO));
        assert!(flows.related_addresses.contains(&TOKEN));
    }

    #[test]
    fn overlay_reads_fall_back_to_zero() {
        let mut overlay = StateOverlay::default();
        assert_eq!(overlay.balance(FROM), U256::ZERO);
        assert_eq!(overlay.storage(TOKEN, B256::ZERO), B256::ZERO);
        assert!(overlay.code(TOKEN).is_empty());
    }
}
