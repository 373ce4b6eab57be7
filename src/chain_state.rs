//! Read-only chain-state snapshots

use crate::chain::Chain;
use crate::error::Result;
use crate::storage::{ChainStateCounters, ChainStateCursor, ChainStateStorage, RecordIter};
use crate::types::*;

/// A chain paired with a pinned view of the UTXO store
///
/// Holds a read transaction for its whole lifetime, so every query sees the
/// state as of `open`, regardless of writers committing meanwhile.
pub struct ChainState {
    chain: Chain,
    cursor: Box<dyn ChainStateCursor>,
}

impl ChainState {
    /// Snapshot the latest committed state
    pub fn open(storage: &dyn ChainStateStorage) -> Result<Self> {
        let mut cursor = storage.open_cursor()?;
        cursor.begin_transaction(true)?;
        let headers = cursor.read_chain().collect::<Result<Vec<_>>>()?;
        let chain = Chain::from_headers(headers)?;
        Ok(Self { chain, cursor })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn counters(&self) -> Result<ChainStateCounters> {
        self.cursor.read_counters()
    }

    pub fn unspent_tx_count(&self) -> Result<u64> {
        self.cursor.unspent_tx_count()
    }

    pub fn unspent_output_count(&self) -> Result<u64> {
        self.cursor.unspent_output_count()
    }

    pub fn total_tx_count(&self) -> Result<u64> {
        self.cursor.total_tx_count()
    }

    pub fn total_input_count(&self) -> Result<u64> {
        self.cursor.total_input_count()
    }

    pub fn total_output_count(&self) -> Result<u64> {
        self.cursor.total_output_count()
    }

    pub fn contains_unspent_tx(&self, tx_hash: &Hash) -> Result<bool> {
        self.cursor.contains_unspent_tx(tx_hash)
    }

    pub fn try_get_unspent_tx(&self, tx_hash: &Hash) -> Result<Option<UnspentTx>> {
        self.cursor.try_get_unspent_tx(tx_hash)
    }

    pub fn read_unspent_transactions(&self) -> RecordIter<'_, UnspentTx> {
        self.cursor.read_unspent_transactions()
    }

    pub fn try_get_block_spent_txes(&self, block_height: Height) -> Result<Option<Vec<Hash>>> {
        self.cursor.try_get_block_spent_txes(block_height)
    }

    pub fn try_get_block_unminted_txes(&self, block_hash: &Hash) -> Result<Option<Vec<UnmintedTx>>> {
        self.cursor.try_get_block_unminted_txes(block_hash)
    }

    pub(crate) fn cursor(&self) -> &dyn ChainStateCursor {
        self.cursor.as_ref()
    }
}

impl Drop for ChainState {
    fn drop(&mut self) {
        if self.cursor.in_transaction() {
            if let Err(e) = self.cursor.rollback_transaction() {
                tracing::warn!(error = %e, "failed to release chain-state snapshot");
            }
        }
    }
}
