//! Per-block undo journals
//!
//! Applying a block records two entries in the same write transaction as the
//! UTXO mutations they describe:
//! - the spent-tx journal (keyed by height): hashes whose UnspentTx record was
//!   removed because its last output was spent by this block
//! - the unminted-tx journal (keyed by block hash): for every transaction in
//!   the block, the location of each input's previous transaction
//!
//! Together with the block itself these are enough to rebuild every record
//! the block touched when it is undone.

use std::collections::HashMap;

use crate::error::{display_hash, ChainStateError, Result};
use crate::storage::ChainStateCursor;
use crate::types::*;

/// Undo data for one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockJournal {
    pub spent_txes: Vec<Hash>,
    pub unminted_txes: Vec<UnmintedTx>,
}

impl BlockJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note an UnspentTx record removed because its last output was spent
    pub fn record_spent_tx(&mut self, tx_hash: Hash) {
        self.spent_txes.push(tx_hash);
    }

    /// Note where a minted transaction's inputs came from
    pub fn record_unminted_tx(&mut self, unminted_tx: UnmintedTx) {
        self.unminted_txes.push(unminted_tx);
    }

    /// Persist both entries for `chained_header`
    ///
    /// An entry already present with identical content counts as written;
    /// different content is a consistency violation.
    pub fn write(&self, cursor: &mut dyn ChainStateCursor, chained_header: &ChainedHeader) -> Result<()> {
        if !cursor.try_add_block_spent_txes(chained_header.height, &self.spent_txes)? {
            let existing = cursor.try_get_block_spent_txes(chained_header.height)?;
            if existing.as_deref() != Some(self.spent_txes.as_slice()) {
                return Err(ChainStateError::consistency(format!(
                    "conflicting spent-tx journal already recorded at height {}",
                    chained_header.height
                )));
            }
        }

        if !cursor.try_add_block_unminted_txes(&chained_header.hash, &self.unminted_txes)? {
            let existing = cursor.try_get_block_unminted_txes(&chained_header.hash)?;
            if existing.as_deref() != Some(self.unminted_txes.as_slice()) {
                return Err(ChainStateError::consistency(format!(
                    "conflicting unminted-tx journal already recorded for block {}",
                    display_hash(&chained_header.hash)
                )));
            }
        }

        Ok(())
    }

    /// Load both entries, if the block still has them
    pub fn try_read(cursor: &dyn ChainStateCursor, chained_header: &ChainedHeader) -> Result<Option<Self>> {
        let spent_txes = cursor.try_get_block_spent_txes(chained_header.height)?;
        let unminted_txes = cursor.try_get_block_unminted_txes(&chained_header.hash)?;
        match (spent_txes, unminted_txes) {
            (Some(spent_txes), Some(unminted_txes)) => Ok(Some(Self { spent_txes, unminted_txes })),
            (None, None) => Ok(None),
            _ => Err(ChainStateError::consistency(format!(
                "journal for block {} at height {} is only partially recorded",
                display_hash(&chained_header.hash),
                chained_header.height
            ))),
        }
    }

    /// Load both entries; a block being undone must have them
    pub fn read(cursor: &dyn ChainStateCursor, chained_header: &ChainedHeader) -> Result<Self> {
        Self::try_read(cursor, chained_header)?.ok_or_else(|| {
            ChainStateError::consistency(format!(
                "no undo journal for block {} at height {}",
                display_hash(&chained_header.hash),
                chained_header.height
            ))
        })
    }

    /// Delete both entries of a block being undone
    pub fn remove(cursor: &mut dyn ChainStateCursor, chained_header: &ChainedHeader) -> Result<()> {
        let removed_spent = cursor.try_remove_block_spent_txes(chained_header.height)?;
        let removed_unminted = cursor.try_remove_block_unminted_txes(&chained_header.hash)?;
        if !removed_spent || !removed_unminted {
            return Err(ChainStateError::consistency(format!(
                "undo journal for block {} vanished during undo",
                display_hash(&chained_header.hash)
            )));
        }
        Ok(())
    }

    /// Drop journals of a block past the rollback horizon; absent entries are fine
    pub fn prune(cursor: &mut dyn ChainStateCursor, chained_header: &ChainedHeader) -> Result<bool> {
        let removed_spent = cursor.try_remove_block_spent_txes(chained_header.height)?;
        let removed_unminted = cursor.try_remove_block_unminted_txes(&chained_header.hash)?;
        Ok(removed_spent || removed_unminted)
    }

    /// Check the journal lines up with the block it describes
    pub fn verify_against(&self, block: &Block) -> Result<()> {
        if self.unminted_txes.len() != block.transactions.len() {
            return Err(ChainStateError::consistency(format!(
                "journal lists {} transactions, block has {}",
                self.unminted_txes.len(),
                block.transactions.len()
            )));
        }

        for (tx_index, (unminted_tx, tx)) in self.unminted_txes.iter().zip(&block.transactions).enumerate() {
            let expected_keys = if tx.is_coinbase() { 0 } else { tx.inputs.len() };
            if unminted_tx.tx_hash != tx.hash() || unminted_tx.prev_output_tx_keys.len() != expected_keys {
                return Err(ChainStateError::consistency(format!(
                    "journal entry {} does not match transaction {}",
                    tx_index,
                    display_hash(&unminted_tx.tx_hash)
                )));
            }
        }

        Ok(())
    }

    /// Previous-tx locations of the transaction at `tx_index`, in input order
    pub fn prev_tx_keys(&self, tx_index: usize) -> Option<&[BlockTxKey]> {
        self.unminted_txes
            .get(tx_index)
            .map(|unminted_tx| unminted_tx.prev_output_tx_keys.as_slice())
    }

    /// Location of every previous transaction spent by `block`, keyed by tx hash
    pub fn prev_tx_locations(&self, block: &Block) -> HashMap<Hash, BlockTxKey> {
        let mut locations = HashMap::new();
        for (tx, unminted_tx) in block.transactions.iter().zip(&self.unminted_txes) {
            for (input, key) in tx.inputs.iter().zip(&unminted_tx.prev_output_tx_keys) {
                locations.insert(input.prevout.hash, *key);
            }
        }
        locations
    }
}
