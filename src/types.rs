//! Core chain-state types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::constants::COINBASE_PREVOUT_INDEX;
use crate::encoding::{calculate_block_hash, calculate_tx_hash};

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Block height, signed to match the persisted 4-byte encoding
pub type Height = i32;

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint referenced by a coinbase input
    pub fn null() -> Self {
        Self { hash: [0u8; 32], index: COINBASE_PREVOUT_INDEX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == COINBASE_PREVOUT_INDEX
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: i64,
    pub script_pubkey: ByteString,
}

/// Transaction: 𝒯𝒳 = ℕ × ℐ* × 𝒯* × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double-SHA256 of the transaction's wire encoding
    pub fn hash(&self) -> Hash {
        calculate_tx_hash(self)
    }

    /// A coinbase has exactly one input spending the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ × ℕ × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        calculate_block_hash(self)
    }
}

/// Block: ℬ = ℋ × 𝒯𝒳*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// A block header positioned in a chain.
///
/// Immutable once created: `height` is always the predecessor's height plus
/// one and `total_work` is the predecessor's total work plus this header's work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedHeader {
    pub header: BlockHeader,
    pub hash: Hash,
    pub height: Height,
    pub total_work: u128,
}

impl ChainedHeader {
    pub fn previous_block_hash(&self) -> &Hash {
        &self.header.prev_block_hash
    }
}

/// State of a single transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    Unspent,
    Spent,
}

/// Fixed-length bitset with one bit per output index.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8` (least significant bit
/// first); a set bit means Unspent. Padding bits in the last byte are always
/// clear so equal states compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputStates {
    length: usize,
    bits: Vec<u8>,
}

impl OutputStates {
    pub fn new(length: usize, state: OutputState) -> Self {
        let mut states = Self {
            length,
            bits: vec![0u8; length.div_ceil(8)],
        };
        if state == OutputState::Unspent {
            for index in 0..length {
                states.bits[index / 8] |= 1 << (index % 8);
            }
        }
        states
    }

    /// Rebuild from packed bytes, rejecting a wrong byte count or set padding bits
    pub fn from_packed(length: usize, bits: Vec<u8>) -> Option<Self> {
        if bits.len() != length.div_ceil(8) {
            return None;
        }
        if length % 8 != 0 {
            let padding_mask = !((1u8 << (length % 8)) - 1);
            if bits.last().is_some_and(|last| last & padding_mask != 0) {
                return None;
            }
        }
        Some(Self { length, bits })
    }

    pub fn packed(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn get(&self, index: usize) -> Option<OutputState> {
        if index >= self.length {
            return None;
        }
        if self.bits[index / 8] & (1 << (index % 8)) != 0 {
            Some(OutputState::Unspent)
        } else {
            Some(OutputState::Spent)
        }
    }

    /// Returns false when `index` is out of range
    pub fn set(&mut self, index: usize, state: OutputState) -> bool {
        if index >= self.length {
            return false;
        }
        match state {
            OutputState::Unspent => self.bits[index / 8] |= 1 << (index % 8),
            OutputState::Spent => self.bits[index / 8] &= !(1 << (index % 8)),
        }
        true
    }

    pub fn unspent_count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn all_spent(&self) -> bool {
        self.unspent_count() == 0
    }

    pub fn all_unspent(&self) -> bool {
        self.unspent_count() == self.length
    }

    pub fn iter(&self) -> impl Iterator<Item = OutputState> + '_ {
        (0..self.length).filter_map(move |index| self.get(index))
    }
}

/// A transaction with at least one unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTx {
    pub tx_hash: Hash,
    pub block_height: Height,
    pub tx_index: i32,
    pub output_states: OutputStates,
}

impl UnspentTx {
    pub fn new(tx_hash: Hash, block_height: Height, tx_index: i32, output_states: OutputStates) -> Self {
        Self { tx_hash, block_height, tx_index, output_states }
    }
}

/// Location of a transaction inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockTxKey {
    pub block_hash: Hash,
    pub block_height: Height,
    pub tx_index: i32,
}

/// Undo record for one transaction minted by a block: where each of its
/// inputs' previous transactions was confirmed, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmintedTx {
    pub tx_hash: Hash,
    pub prev_output_tx_keys: Vec<BlockTxKey>,
}

/// A transaction resolved against a chain state during replay
#[derive(Debug, Clone)]
pub struct LoadedTx {
    pub transaction: Arc<Transaction>,
    pub tx_hash: Hash,
    pub tx_index: usize,
    pub is_coinbase: bool,
    /// Previous transaction of each input, in input order; empty for a coinbase
    pub input_txes: Vec<Arc<Transaction>>,
}

impl LoadedTx {
    /// The output spent by input `input_index`
    pub fn prev_output(&self, input_index: usize) -> Option<&TransactionOutput> {
        let input = self.transaction.inputs.get(input_index)?;
        let prev_tx = self.input_txes.get(input_index)?;
        prev_tx.outputs.get(input.prevout.index as usize)
    }
}

/// One unit of script-validation work
#[derive(Debug, Clone)]
pub struct TxInputWithPrevOutput {
    pub chained_header: ChainedHeader,
    pub transaction: Arc<Transaction>,
    pub tx_hash: Hash,
    pub tx_index: usize,
    pub input_index: usize,
    pub prev_output: TransactionOutput,
}

impl TxInputWithPrevOutput {
    /// The input being verified, for script verifiers
    pub fn input(&self) -> &TransactionInput {
        &self.transaction.inputs[self.input_index]
    }
}

/// Direction of a replay or navigation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayDirection {
    /// Add a block (+1)
    Forward,
    /// Remove a block (-1)
    Backward,
}

impl ReplayDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            ReplayDirection::Forward => 1,
            ReplayDirection::Backward => -1,
        }
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}
