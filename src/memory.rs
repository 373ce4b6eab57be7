//! In-memory chain-state storage with snapshot isolation
//!
//! Committed state is an immutable `Arc<Tables>`. A write transaction stages
//! changes on a private copy (copy-on-write via `Arc::make_mut`) and publishes
//! it on commit; read transactions pin the committed `Arc` they began with.
//!
//! The first mutation of a write transaction clones every table, since the
//! committed snapshot still shares them, so each block costs O(|UTXO set|).
//! This backend is meant for tests and small chains; a persistent backend
//! stages deltas instead.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::encoding::*;
use crate::error::{display_hash, ChainStateError, Result};
use crate::storage::{BlockStore, ChainStateCursor, ChainStateStorage, Counter, RecordIter};
use crate::types::*;

/// Logical tables of the chain-state database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Globals,
    Chain,
    UnspentTx,
    SpentTxes,
    UnmintedTxes,
}

impl Column {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Column::Globals => "globals",
            Column::Chain => "chain",
            Column::UnspentTx => "unspent_tx",
            Column::SpentTxes => "spent_txes",
            Column::UnmintedTxes => "unminted_txes",
        }
    }
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, Default)]
struct Tables {
    columns: [Table; Column::COUNT],
}

impl Tables {
    fn table(&self, column: Column) -> &Table {
        &self.columns[column.index()]
    }

    fn table_mut(&mut self, column: Column) -> &mut Table {
        &mut self.columns[column.index()]
    }
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Arc<Tables>>,
    durable: RwLock<Arc<Tables>>,
    writer_active: AtomicBool,
    flush_count: AtomicU64,
}

/// In-memory backend; clones share one database
#[derive(Debug, Clone, Default)]
pub struct MemoryChainStateStorage {
    shared: Arc<Shared>,
}

impl MemoryChainStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed flushes
    pub fn flush_count(&self) -> u64 {
        self.shared.flush_count.load(Ordering::SeqCst)
    }

    /// True when the last flush captured every committed change
    pub fn is_durable(&self) -> bool {
        Arc::ptr_eq(&*self.shared.committed.read(), &*self.shared.durable.read())
    }

    pub fn open_memory_cursor(&self) -> MemoryChainStateCursor {
        MemoryChainStateCursor {
            shared: Arc::clone(&self.shared),
            state: CursorState::Idle,
        }
    }
}

impl ChainStateStorage for MemoryChainStateStorage {
    fn open_cursor(&self) -> Result<Box<dyn ChainStateCursor>> {
        Ok(Box::new(self.open_memory_cursor()))
    }
}

#[derive(Debug)]
enum CursorState {
    Idle,
    Reading(Arc<Tables>),
    Writing(Arc<Tables>),
}

/// Cursor over a [`MemoryChainStateStorage`]
#[derive(Debug)]
pub struct MemoryChainStateCursor {
    shared: Arc<Shared>,
    state: CursorState,
}

impl MemoryChainStateCursor {
    fn snapshot(&self) -> Arc<Tables> {
        match &self.state {
            CursorState::Reading(tables) | CursorState::Writing(tables) => Arc::clone(tables),
            CursorState::Idle => self.shared.committed.read().clone(),
        }
    }

    fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot().table(column).get(key).cloned()
    }

    fn contains(&self, column: Column, key: &[u8]) -> bool {
        self.snapshot().table(column).contains_key(key)
    }

    fn staged(&mut self, operation: &'static str) -> Result<&mut Tables> {
        match &mut self.state {
            CursorState::Writing(tables) => Ok(Arc::make_mut(tables)),
            CursorState::Reading(_) => Err(ChainStateError::InvalidTransactionState(format!(
                "{} inside a read-only transaction",
                operation
            ))),
            CursorState::Idle => Err(ChainStateError::InvalidTransactionState(format!(
                "{} without an open write transaction",
                operation
            ))),
        }
    }

    fn try_insert(&mut self, operation: &'static str, column: Column, key: Vec<u8>, value: Vec<u8>) -> Result<bool> {
        let table = self.staged(operation)?.table_mut(column);
        if table.contains_key(&key) {
            return Ok(false);
        }
        table.insert(key, value);
        Ok(true)
    }

    fn try_delete(&mut self, operation: &'static str, column: Column, key: &[u8]) -> Result<bool> {
        Ok(self.staged(operation)?.table_mut(column).remove(key).is_some())
    }

    fn scan(&self, column: Column) -> TableIter {
        TableIter {
            tables: self.snapshot(),
            column,
            last_key: None,
        }
    }

    fn release_writer(&mut self) {
        if matches!(self.state, CursorState::Writing(_)) {
            self.shared.writer_active.store(false, Ordering::SeqCst);
        }
        self.state = CursorState::Idle;
    }
}

impl Drop for MemoryChainStateCursor {
    fn drop(&mut self) {
        self.release_writer();
    }
}

/// Restartable ascending scan over one column of a pinned snapshot
struct TableIter {
    tables: Arc<Tables>,
    column: Column,
    last_key: Option<Vec<u8>>,
}

impl Iterator for TableIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.tables.table(self.column);
        let lower = match &self.last_key {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let (key, value) = table.range((lower, Bound::Unbounded)).next()?;
        self.last_key = Some(key.clone());
        Some((key.clone(), value.clone()))
    }
}

fn wrap_decode<T>(column: Column, key: &[u8], decoded: Result<T>) -> Result<T> {
    decoded.map_err(|e| ChainStateError::storage("decode", format!("{}/{}", column.name(), hex::encode(key)), e))
}

impl ChainStateCursor for MemoryChainStateCursor {
    fn in_transaction(&self) -> bool {
        !matches!(self.state, CursorState::Idle)
    }

    fn begin_transaction(&mut self, read_only: bool) -> Result<()> {
        if self.in_transaction() {
            return Err(ChainStateError::InvalidTransactionState(
                "cursor already has an open transaction".to_string(),
            ));
        }

        if read_only {
            self.state = CursorState::Reading(self.shared.committed.read().clone());
            return Ok(());
        }

        if self
            .shared
            .writer_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChainStateError::InvalidTransactionState(
                "another write transaction is already open".to_string(),
            ));
        }
        self.state = CursorState::Writing(self.shared.committed.read().clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, CursorState::Idle) {
            CursorState::Writing(tables) => {
                *self.shared.committed.write() = tables;
                self.shared.writer_active.store(false, Ordering::SeqCst);
                Ok(())
            }
            CursorState::Reading(_) => Ok(()),
            CursorState::Idle => Err(ChainStateError::InvalidTransactionState(
                "commit without an open transaction".to_string(),
            )),
        }
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if !self.in_transaction() {
            return Err(ChainStateError::InvalidTransactionState(
                "rollback without an open transaction".to_string(),
            ));
        }
        self.release_writer();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let committed = self.shared.committed.read().clone();
        *self.shared.durable.write() = committed;
        let flushes = self.shared.flush_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(flushes, "flushed chain state");
        Ok(())
    }

    fn defragment(&mut self) -> Result<()> {
        tracing::debug!("defragment is a no-op for in-memory chain state");
        Ok(())
    }

    fn add_chained_header(&mut self, chained_header: &ChainedHeader) -> Result<()> {
        let key = encode_height_key(chained_header.height).to_vec();
        let value = encode_chained_header(chained_header);
        if !self.try_insert("add chained header", Column::Chain, key, value)? {
            return Err(ChainStateError::consistency(format!(
                "chained header already stored at height {}",
                chained_header.height
            )));
        }
        Ok(())
    }

    fn remove_chained_header(&mut self, chained_header: &ChainedHeader) -> Result<()> {
        let key = encode_height_key(chained_header.height);
        let stored = self.get(Column::Chain, &key);
        let stored = match stored {
            Some(bytes) => wrap_decode(Column::Chain, &key, decode_chained_header(&bytes))?,
            None => {
                return Err(ChainStateError::consistency(format!(
                    "no chained header stored at height {}",
                    chained_header.height
                )))
            }
        };
        if stored.hash != chained_header.hash {
            return Err(ChainStateError::consistency(format!(
                "header at height {} is {}, not {}",
                chained_header.height,
                display_hash(&stored.hash),
                display_hash(&chained_header.hash)
            )));
        }
        self.try_delete("remove chained header", Column::Chain, &key)?;
        Ok(())
    }

    fn read_chain(&self) -> RecordIter<'_, ChainedHeader> {
        Box::new(
            self.scan(Column::Chain)
                .map(|(key, value)| wrap_decode(Column::Chain, &key, decode_chained_header(&value))),
        )
    }

    fn get_chain_tip(&self) -> Result<Option<ChainedHeader>> {
        let snapshot = self.snapshot();
        match snapshot.table(Column::Chain).iter().next_back() {
            Some((key, value)) => Ok(Some(wrap_decode(Column::Chain, key, decode_chained_header(value))?)),
            None => Ok(None),
        }
    }

    fn contains_unspent_tx(&self, tx_hash: &Hash) -> Result<bool> {
        Ok(self.contains(Column::UnspentTx, tx_hash))
    }

    fn try_get_unspent_tx(&self, tx_hash: &Hash) -> Result<Option<UnspentTx>> {
        self.get(Column::UnspentTx, tx_hash)
            .map(|bytes| wrap_decode(Column::UnspentTx, tx_hash, decode_unspent_tx(&bytes)))
            .transpose()
    }

    fn try_add_unspent_tx(&mut self, unspent_tx: &UnspentTx) -> Result<bool> {
        self.try_insert(
            "add unspent tx",
            Column::UnspentTx,
            unspent_tx.tx_hash.to_vec(),
            encode_unspent_tx(unspent_tx),
        )
    }

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash) -> Result<bool> {
        self.try_delete("remove unspent tx", Column::UnspentTx, tx_hash)
    }

    fn try_update_unspent_tx(&mut self, unspent_tx: &UnspentTx) -> Result<bool> {
        self.staged("update unspent tx")?;
        let mut stored = match self.try_get_unspent_tx(&unspent_tx.tx_hash)? {
            Some(stored) => stored,
            None => return Ok(false),
        };
        stored.output_states = unspent_tx.output_states.clone();
        self.staged("update unspent tx")?
            .table_mut(Column::UnspentTx)
            .insert(stored.tx_hash.to_vec(), encode_unspent_tx(&stored));
        Ok(true)
    }

    fn read_unspent_transactions(&self) -> RecordIter<'_, UnspentTx> {
        Box::new(
            self.scan(Column::UnspentTx)
                .map(|(key, value)| wrap_decode(Column::UnspentTx, &key, decode_unspent_tx(&value))),
        )
    }

    fn contains_block_spent_txes(&self, block_height: Height) -> Result<bool> {
        Ok(self.contains(Column::SpentTxes, &encode_height_key(block_height)))
    }

    fn try_get_block_spent_txes(&self, block_height: Height) -> Result<Option<Vec<Hash>>> {
        let key = encode_height_key(block_height);
        self.get(Column::SpentTxes, &key)
            .map(|bytes| wrap_decode(Column::SpentTxes, &key, decode_spent_txes(&bytes)))
            .transpose()
    }

    fn try_add_block_spent_txes(&mut self, block_height: Height, spent_txes: &[Hash]) -> Result<bool> {
        self.try_insert(
            "add block spent txes",
            Column::SpentTxes,
            encode_height_key(block_height).to_vec(),
            encode_spent_txes(spent_txes),
        )
    }

    fn try_remove_block_spent_txes(&mut self, block_height: Height) -> Result<bool> {
        self.try_delete("remove block spent txes", Column::SpentTxes, &encode_height_key(block_height))
    }

    fn contains_block_unminted_txes(&self, block_hash: &Hash) -> Result<bool> {
        Ok(self.contains(Column::UnmintedTxes, block_hash))
    }

    fn try_get_block_unminted_txes(&self, block_hash: &Hash) -> Result<Option<Vec<UnmintedTx>>> {
        self.get(Column::UnmintedTxes, block_hash)
            .map(|bytes| wrap_decode(Column::UnmintedTxes, block_hash, decode_unminted_txes(&bytes)))
            .transpose()
    }

    fn try_add_block_unminted_txes(&mut self, block_hash: &Hash, unminted_txes: &[UnmintedTx]) -> Result<bool> {
        self.try_insert(
            "add block unminted txes",
            Column::UnmintedTxes,
            block_hash.to_vec(),
            encode_unminted_txes(unminted_txes),
        )
    }

    fn try_remove_block_unminted_txes(&mut self, block_hash: &Hash) -> Result<bool> {
        self.try_delete("remove block unminted txes", Column::UnmintedTxes, block_hash)
    }

    fn read_counter(&self, counter: Counter) -> Result<u64> {
        match self.get(Column::Globals, counter.name().as_bytes()) {
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    ChainStateError::storage("read counter", counter.name(), format!("{} bytes", bytes.len()))
                })?;
                Ok(u64::from_le_bytes(array))
            }
            None => Ok(0),
        }
    }

    fn write_counter(&mut self, counter: Counter, value: u64) -> Result<()> {
        self.staged("write counter")?
            .table_mut(Column::Globals)
            .insert(counter.name().as_bytes().to_vec(), value.to_le_bytes().to_vec());
        Ok(())
    }
}

/// Block store backed by a hash map
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash, Arc<Block>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, returning its hash
    pub fn add_block(&self, block: Block) -> Hash {
        let block_hash = block.hash();
        self.blocks.write().insert(block_hash, Arc::new(block));
        block_hash
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn try_get_block(&self, block_hash: &Hash) -> Result<Option<Arc<Block>>> {
        Ok(self.blocks.read().get(block_hash).cloned())
    }
}
