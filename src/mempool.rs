//! Unconfirmed transaction pool validated against the chain state
//!
//! A transaction is admitted only when every input spends an output that is
//! currently Unspent in the committed UTXO set and not already claimed by
//! another pooled transaction.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain_state::ChainState;
use crate::economic::checked_money_sum;
use crate::error::{display_hash, ChainStateError, Result};
use crate::rules::BlockchainRules;
use crate::storage::{BlockStore, ChainStateStorage};
use crate::transaction::check_transaction;
use crate::types::*;

/// A pooled transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedTx {
    pub transaction: Arc<Transaction>,
    pub tx_hash: Hash,
    pub fee: i64,
    /// Chain height when the transaction was admitted
    pub added_at_height: Height,
}

/// Mempool acceptance result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolResult {
    Accepted,
    Rejected(String),
}

/// Transactions confirmed by one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxesConfirmed {
    pub confirm_block: ChainedHeader,
    pub confirmed_txes: HashMap<Hash, UnconfirmedTx>,
    /// Pooled transactions dropped because the block spent one of their inputs
    pub conflicted_txes: Vec<Hash>,
}

#[derive(Debug, Default)]
struct Pool {
    txes: HashMap<Hash, UnconfirmedTx>,
    spent_outpoints: HashMap<OutPoint, Hash>,
}

impl Pool {
    fn remove(&mut self, tx_hash: &Hash) -> Option<UnconfirmedTx> {
        let unconfirmed_tx = self.txes.remove(tx_hash)?;
        for input in &unconfirmed_tx.transaction.inputs {
            self.spent_outpoints.remove(&input.prevout);
        }
        Some(unconfirmed_tx)
    }
}

/// Builds the unconfirmed transaction set
pub struct UnconfirmedTxesBuilder {
    storage: Arc<dyn ChainStateStorage>,
    block_store: Arc<dyn BlockStore>,
    rules: Arc<dyn BlockchainRules>,
    pool: RwLock<Pool>,
}

impl UnconfirmedTxesBuilder {
    pub fn new(
        storage: Arc<dyn ChainStateStorage>,
        block_store: Arc<dyn BlockStore>,
        rules: Arc<dyn BlockchainRules>,
    ) -> Self {
        Self {
            storage,
            block_store,
            rules,
            pool: RwLock::new(Pool::default()),
        }
    }

    /// Admit `tx` if it is valid against the committed chain state
    pub fn try_add_transaction(&self, tx: Transaction) -> Result<bool> {
        Ok(self.accept_transaction(tx)? == MempoolResult::Accepted)
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × 𝒰𝒮 → {accepted, rejected}
    ///
    /// 1. Reject coinbases and structurally invalid transactions
    /// 2. Reject transactions already pooled or conflicting with pooled ones
    /// 3. Every input must spend an Unspent output of the UTXO set
    /// 4. Input value must cover output value
    /// 5. Every input script must verify
    pub fn accept_transaction(&self, tx: Transaction) -> Result<MempoolResult> {
        // 1. Structure
        if tx.is_coinbase() {
            return Ok(MempoolResult::Rejected("Coinbase transaction".to_string()));
        }
        if let ValidationResult::Invalid(reason) = check_transaction(&tx) {
            return Ok(MempoolResult::Rejected(reason));
        }

        // 2. Pool membership
        let tx_hash = tx.hash();
        if let Some(rejection) = self.check_pool(&tx, &tx_hash) {
            return Ok(rejection);
        }

        // 3. UTXO set
        let chain_state = ChainState::open(self.storage.as_ref())?;
        let tip = chain_state.chain().tip().clone();
        let mut prev_outputs = Vec::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            let unspent_tx = match chain_state.try_get_unspent_tx(&input.prevout.hash)? {
                Some(unspent_tx) => unspent_tx,
                None => return Ok(MempoolResult::Rejected(format!("Input {} not found in UTXO set", i))),
            };
            if unspent_tx.output_states.get(input.prevout.index as usize) != Some(OutputState::Unspent) {
                return Ok(MempoolResult::Rejected(format!("Input {} is spent or out of range", i)));
            }
            prev_outputs.push(self.load_prev_output(&chain_state, &unspent_tx, input.prevout.index)?);
        }

        // 4. Value
        let total_input = match checked_money_sum(prev_outputs.iter().map(|output| output.value)) {
            Some(total) => total,
            None => return Ok(MempoolResult::Rejected("Input value out of range".to_string())),
        };
        let total_output = match checked_money_sum(tx.outputs.iter().map(|output| output.value)) {
            Some(total) => total,
            None => return Ok(MempoolResult::Rejected("Output value out of range".to_string())),
        };
        if total_input < total_output {
            return Ok(MempoolResult::Rejected("Insufficient input value".to_string()));
        }

        // 5. Scripts
        let transaction = Arc::new(tx);
        for (input_index, prev_output) in prev_outputs.into_iter().enumerate() {
            let item = TxInputWithPrevOutput {
                chained_header: tip.clone(),
                transaction: Arc::clone(&transaction),
                tx_hash,
                tx_index: 0,
                input_index,
                prev_output,
            };
            if let Err(e) = self.rules.validate_transaction_script(&item) {
                return Ok(MempoolResult::Rejected(format!("Invalid script at input {}: {}", input_index, e)));
            }
        }

        // Re-check under the write lock; another caller may have won the race
        let mut pool = self.pool.write();
        if let Some(rejection) = check_pool_locked(&pool, &transaction, &tx_hash) {
            return Ok(rejection);
        }
        for input in &transaction.inputs {
            pool.spent_outpoints.insert(input.prevout, tx_hash);
        }
        pool.txes.insert(
            tx_hash,
            UnconfirmedTx {
                transaction,
                tx_hash,
                fee: total_input - total_output,
                added_at_height: tip.height,
            },
        );
        Ok(MempoolResult::Accepted)
    }

    pub fn try_get_transaction(&self, tx_hash: &Hash) -> Option<UnconfirmedTx> {
        self.pool.read().txes.get(tx_hash).cloned()
    }

    pub fn contains_transaction(&self, tx_hash: &Hash) -> bool {
        self.pool.read().txes.contains_key(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.pool.read().txes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.read().txes.is_empty()
    }

    /// Remove what `block` confirmed, and whatever it made a double spend
    pub fn confirm_block(&self, chained_header: &ChainedHeader, block: &Block) -> TxesConfirmed {
        let mut pool = self.pool.write();
        let mut confirmed_txes = HashMap::new();
        let mut conflicted_txes = Vec::new();

        for tx in &block.transactions {
            let tx_hash = tx.hash();
            if let Some(unconfirmed_tx) = pool.remove(&tx_hash) {
                confirmed_txes.insert(tx_hash, unconfirmed_tx);
                continue;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = pool.spent_outpoints.get(&input.prevout).copied() {
                    pool.remove(&conflict);
                    conflicted_txes.push(conflict);
                }
            }
        }

        TxesConfirmed {
            confirm_block: chained_header.clone(),
            confirmed_txes,
            conflicted_txes,
        }
    }

    fn check_pool(&self, tx: &Transaction, tx_hash: &Hash) -> Option<MempoolResult> {
        check_pool_locked(&self.pool.read(), tx, tx_hash)
    }

    fn load_prev_output(
        &self,
        chain_state: &ChainState,
        unspent_tx: &UnspentTx,
        output_index: u32,
    ) -> Result<TransactionOutput> {
        let block_hash = chain_state
            .chain()
            .get(unspent_tx.block_height)
            .map(|header| header.hash)
            .ok_or_else(|| {
                ChainStateError::consistency(format!(
                    "unspent tx {} at height {} beyond the chain",
                    display_hash(&unspent_tx.tx_hash),
                    unspent_tx.block_height
                ))
            })?;
        let prev_tx = self
            .block_store
            .try_get_transaction(&block_hash, unspent_tx.tx_index as usize)?
            .filter(|prev_tx| prev_tx.hash() == unspent_tx.tx_hash)
            .ok_or_else(|| {
                ChainStateError::consistency(format!(
                    "unspent tx {} missing from block {}",
                    display_hash(&unspent_tx.tx_hash),
                    display_hash(&block_hash)
                ))
            })?;
        prev_tx.outputs.get(output_index as usize).cloned().ok_or_else(|| {
            ChainStateError::consistency(format!(
                "unspent tx {} has no output {}",
                display_hash(&unspent_tx.tx_hash),
                output_index
            ))
        })
    }
}

fn check_pool_locked(pool: &Pool, tx: &Transaction, tx_hash: &Hash) -> Option<MempoolResult> {
    if pool.txes.contains_key(tx_hash) {
        return Some(MempoolResult::Rejected("Transaction already in mempool".to_string()));
    }
    if tx.inputs.iter().any(|input| pool.spent_outpoints.contains_key(&input.prevout)) {
        return Some(MempoolResult::Rejected("Transaction conflicts with mempool".to_string()));
    }
    None
}
