//! Block and script rules consumed by the chain-state builder

use std::fmt;
use std::sync::Arc;

use crate::economic::{calculate_fee, get_block_subsidy};
use crate::encoding::calculate_merkle_root;
use crate::error::{display_hash, ChainStateError, Result, ScriptError};
use crate::transaction::check_transaction;
use crate::types::*;

/// Rule-set applied while a block is connected
pub trait BlockchainRules: Send + Sync {
    /// Check a block whose transactions have been resolved by replay
    fn validate_block(&self, chained_header: &ChainedHeader, block: &Block, loaded_txes: &[LoadedTx]) -> Result<()>;

    /// Verify one input's script against the output it spends
    fn validate_transaction_script(&self, input: &TxInputWithPrevOutput) -> std::result::Result<(), ScriptError>;
}

/// Script verifier plugged into [`CoreRules`]
pub type ScriptVerifier = dyn Fn(&TxInputWithPrevOutput) -> std::result::Result<(), ScriptError> + Send + Sync;

/// Structural and economic block rules with an injected script verifier
#[derive(Clone)]
pub struct CoreRules {
    verifier: Arc<ScriptVerifier>,
}

impl CoreRules {
    pub fn new<F>(verifier: F) -> Self
    where
        F: Fn(&TxInputWithPrevOutput) -> std::result::Result<(), ScriptError> + Send + Sync + 'static,
    {
        Self { verifier: Arc::new(verifier) }
    }

    /// Accept every script
    pub fn without_scripts() -> Self {
        Self::new(|_| Ok(()))
    }
}

impl fmt::Debug for CoreRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreRules").finish_non_exhaustive()
    }
}

impl BlockchainRules for CoreRules {
    /// ValidateBlock: ℬ × ℕ → {valid, invalid}
    ///
    /// 1. |txs| > 0, txs[0] is the only coinbase
    /// 2. ∀tx ∈ txs: CheckTransaction(tx) = valid
    /// 3. merkle_root = MerkleRoot(txs)
    /// 4. ∀tx ∈ txs[1..]: fee(tx) ≥ 0
    /// 5. Σ txs[0].outs ≤ subsidy(h) + Σ fee
    fn validate_block(&self, chained_header: &ChainedHeader, block: &Block, loaded_txes: &[LoadedTx]) -> Result<()> {
        let invalid = |message: String| {
            ChainStateError::BlockValidation(format!("block {}: {}", display_hash(&chained_header.hash), message))
        };

        // 1. Coinbase placement
        let coinbase = block
            .transactions
            .first()
            .ok_or_else(|| invalid("no transactions".to_string()))?;
        if !coinbase.is_coinbase() {
            return Err(invalid("first transaction is not a coinbase".to_string()));
        }
        if let Some(index) = block.transactions.iter().skip(1).position(Transaction::is_coinbase) {
            return Err(invalid(format!("extra coinbase at index {}", index + 1)));
        }

        // 2. Structure
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            if let ValidationResult::Invalid(reason) = check_transaction(tx) {
                return Err(invalid(format!("tx {}: {}", tx_index, reason)));
            }
        }

        // 3. Merkle root
        if calculate_merkle_root(&block.transactions) != block.header.merkle_root {
            return Err(invalid("merkle root mismatch".to_string()));
        }

        // 4. Fees
        if loaded_txes.len() != block.transactions.len() {
            return Err(invalid(format!(
                "{} resolved transactions for {} in block",
                loaded_txes.len(),
                block.transactions.len()
            )));
        }
        let mut total_fees = 0i64;
        for loaded_tx in loaded_txes.iter().skip(1) {
            let fee = calculate_fee(loaded_tx).map_err(|e| invalid(e.to_string()))?;
            total_fees = total_fees.saturating_add(fee);
        }

        // 5. Coinbase value
        let coinbase_value: i64 = coinbase.outputs.iter().map(|output| output.value).sum();
        let allowed = get_block_subsidy(chained_header.height).saturating_add(total_fees);
        if coinbase_value > allowed {
            return Err(invalid(format!(
                "coinbase pays {} but subsidy plus fees is {}",
                coinbase_value, allowed
            )));
        }

        Ok(())
    }

    fn validate_transaction_script(&self, input: &TxInputWithPrevOutput) -> std::result::Result<(), ScriptError> {
        (self.verifier)(input)
    }
}
