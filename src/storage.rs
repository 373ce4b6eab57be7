//! Transactional chain-state store contract
//!
//! One cursor interface covers every table the engine persists: chain
//! headers keyed by height, unspent transactions keyed by hash, the two undo
//! journals, and the global counters. Backends implement it once.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::Result;
use crate::types::*;

/// Lazy record sequence; each item may fail to decode
pub type RecordIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Global counters kept alongside the records they summarize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    UnspentTx,
    UnspentOutput,
    TotalTx,
    TotalInput,
    TotalOutput,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::UnspentTx,
        Counter::UnspentOutput,
        Counter::TotalTx,
        Counter::TotalInput,
        Counter::TotalOutput,
    ];

    /// Persistent key name
    pub fn name(self) -> &'static str {
        match self {
            Counter::UnspentTx => "UnspentTxCount",
            Counter::UnspentOutput => "UnspentOutputCount",
            Counter::TotalTx => "TotalTxCount",
            Counter::TotalInput => "TotalInputCount",
            Counter::TotalOutput => "TotalOutputCount",
        }
    }
}

/// Snapshot of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStateCounters {
    pub unspent_tx_count: u64,
    pub unspent_output_count: u64,
    pub total_tx_count: u64,
    pub total_input_count: u64,
    pub total_output_count: u64,
}

/// Transactional cursor over one chain-state database
///
/// Mutations require an open write transaction and fail with
/// `InvalidTransactionState` otherwise. At most one write transaction is open
/// per database. Reads inside a transaction see its snapshot; reads outside
/// one see the latest committed state. `try_*` operations report a missing
/// or duplicate key as a value, never as an error.
pub trait ChainStateCursor: Send {
    fn in_transaction(&self) -> bool;
    fn begin_transaction(&mut self, read_only: bool) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;

    /// Make committed data durable
    fn flush(&mut self) -> Result<()>;

    /// Best-effort space reclamation, outside transaction boundaries
    fn defragment(&mut self) -> Result<()>;

    // Chain headers, one per height

    /// Insert a header; a header already stored at that height is a consistency violation
    fn add_chained_header(&mut self, chained_header: &ChainedHeader) -> Result<()>;
    /// Delete the header at `chained_header.height`, which must be present and match
    fn remove_chained_header(&mut self, chained_header: &ChainedHeader) -> Result<()>;
    /// All headers in ascending height order
    fn read_chain(&self) -> RecordIter<'_, ChainedHeader>;
    fn get_chain_tip(&self) -> Result<Option<ChainedHeader>>;

    // Unspent transactions, keyed by hash

    fn contains_unspent_tx(&self, tx_hash: &Hash) -> Result<bool>;
    fn try_get_unspent_tx(&self, tx_hash: &Hash) -> Result<Option<UnspentTx>>;
    /// False if the hash is already present; the stored record is left untouched
    fn try_add_unspent_tx(&mut self, unspent_tx: &UnspentTx) -> Result<bool>;
    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash) -> Result<bool>;
    /// Replaces only the output states; false if absent
    fn try_update_unspent_tx(&mut self, unspent_tx: &UnspentTx) -> Result<bool>;
    /// The whole unspent set in ascending hash order
    fn read_unspent_transactions(&self) -> RecordIter<'_, UnspentTx>;

    // Spent-tx journal, keyed by block height

    fn contains_block_spent_txes(&self, block_height: Height) -> Result<bool>;
    fn try_get_block_spent_txes(&self, block_height: Height) -> Result<Option<Vec<Hash>>>;
    fn try_add_block_spent_txes(&mut self, block_height: Height, spent_txes: &[Hash]) -> Result<bool>;
    fn try_remove_block_spent_txes(&mut self, block_height: Height) -> Result<bool>;

    // Unminted-tx journal, keyed by block hash

    fn contains_block_unminted_txes(&self, block_hash: &Hash) -> Result<bool>;
    fn try_get_block_unminted_txes(&self, block_hash: &Hash) -> Result<Option<Vec<UnmintedTx>>>;
    fn try_add_block_unminted_txes(&mut self, block_hash: &Hash, unminted_txes: &[UnmintedTx]) -> Result<bool>;
    fn try_remove_block_unminted_txes(&mut self, block_hash: &Hash) -> Result<bool>;

    // Counters

    fn read_counter(&self, counter: Counter) -> Result<u64>;
    fn write_counter(&mut self, counter: Counter, value: u64) -> Result<()>;

    fn unspent_tx_count(&self) -> Result<u64> {
        self.read_counter(Counter::UnspentTx)
    }

    fn unspent_output_count(&self) -> Result<u64> {
        self.read_counter(Counter::UnspentOutput)
    }

    fn total_tx_count(&self) -> Result<u64> {
        self.read_counter(Counter::TotalTx)
    }

    fn total_input_count(&self) -> Result<u64> {
        self.read_counter(Counter::TotalInput)
    }

    fn total_output_count(&self) -> Result<u64> {
        self.read_counter(Counter::TotalOutput)
    }

    fn read_counters(&self) -> Result<ChainStateCounters> {
        Ok(ChainStateCounters {
            unspent_tx_count: self.unspent_tx_count()?,
            unspent_output_count: self.unspent_output_count()?,
            total_tx_count: self.total_tx_count()?,
            total_input_count: self.total_input_count()?,
            total_output_count: self.total_output_count()?,
        })
    }

    fn write_counters(&mut self, counters: &ChainStateCounters) -> Result<()> {
        self.write_counter(Counter::UnspentTx, counters.unspent_tx_count)?;
        self.write_counter(Counter::UnspentOutput, counters.unspent_output_count)?;
        self.write_counter(Counter::TotalTx, counters.total_tx_count)?;
        self.write_counter(Counter::TotalInput, counters.total_input_count)?;
        self.write_counter(Counter::TotalOutput, counters.total_output_count)
    }
}

/// Opens cursors over one chain-state database
pub trait ChainStateStorage: Send + Sync {
    fn open_cursor(&self) -> Result<Box<dyn ChainStateCursor>>;
}

/// Resolves blocks and their transactions by hash
pub trait BlockStore: Send + Sync {
    fn try_get_block(&self, block_hash: &Hash) -> Result<Option<Arc<Block>>>;

    fn try_get_transaction(&self, block_hash: &Hash, tx_index: usize) -> Result<Option<Arc<Transaction>>> {
        Ok(self
            .try_get_block(block_hash)?
            .and_then(|block| block.transactions.get(tx_index).cloned().map(Arc::new)))
    }
}

/// Write transaction scoped to a borrow of the cursor
///
/// Rolled back on drop unless `commit` succeeded.
pub struct WriteTransaction<'a> {
    cursor: &'a mut dyn ChainStateCursor,
    committed: bool,
}

impl<'a> WriteTransaction<'a> {
    pub fn begin(cursor: &'a mut dyn ChainStateCursor) -> Result<Self> {
        cursor.begin_transaction(false)?;
        Ok(Self { cursor, committed: false })
    }

    pub fn commit(mut self) -> Result<()> {
        self.cursor.commit_transaction()?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Deref for WriteTransaction<'a> {
    type Target = dyn ChainStateCursor + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.cursor
    }
}

impl<'a> DerefMut for WriteTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.cursor
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && self.cursor.in_transaction() {
            tracing::warn!("rolling back uncommitted chain-state transaction");
            if let Err(e) = self.cursor.rollback_transaction() {
                tracing::warn!(error = %e, "chain-state rollback failed");
            }
        }
    }
}
