//! Block replay: resolving a block's transactions against a chain state
//!
//! Three replays share one resolution scheme:
//! - [`BlockReplayer::replay_block`] is read-only and works on a [`ChainState`] snapshot
//! - [`ApplyBlock`] spends inputs, mints outputs and records undo journals
//! - [`UndoBlock`] reverses an applied tip block from its journals
//!
//! Forward replay walks transactions in block order, backward replay in
//! reverse. Every input must resolve to an existing previous output; anything
//! else means the store no longer matches the chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::chain::Chain;
use crate::chain_state::ChainState;
use crate::error::{display_hash, ChainStateError, Result};
use crate::journal::BlockJournal;
use crate::storage::{BlockStore, ChainStateCounters, ChainStateCursor};
use crate::types::*;

/// Locates and loads previous transactions for one block
struct TxResolver<'a> {
    block_store: &'a dyn BlockStore,
    chained_header: ChainedHeader,
    block: Arc<Block>,
}

impl<'a> TxResolver<'a> {
    fn new(block_store: &'a dyn BlockStore, chained_header: ChainedHeader, block: Arc<Block>) -> Result<Self> {
        if block.hash() != chained_header.hash {
            return Err(ChainStateError::consistency(format!(
                "block {} does not match header {}",
                display_hash(&block.hash()),
                display_hash(&chained_header.hash)
            )));
        }
        Ok(Self { block_store, chained_header, block })
    }

    /// Location of an unspent transaction, using `chain` for heights below this block
    fn key_for(&self, chain: &Chain, unspent_tx: &UnspentTx) -> Result<BlockTxKey> {
        let block_hash = if unspent_tx.block_height == self.chained_header.height {
            self.chained_header.hash
        } else {
            chain
                .get(unspent_tx.block_height)
                .map(|header| header.hash)
                .ok_or_else(|| {
                    ChainStateError::consistency(format!(
                        "tx {} confirmed at height {} beyond chain height {}",
                        display_hash(&unspent_tx.tx_hash),
                        unspent_tx.block_height,
                        chain.height()
                    ))
                })?
        };

        Ok(BlockTxKey {
            block_hash,
            block_height: unspent_tx.block_height,
            tx_index: unspent_tx.tx_index,
        })
    }

    /// Load the transaction at `key` and check it is `tx_hash`
    fn resolve(&self, key: &BlockTxKey, tx_hash: &Hash) -> Result<Arc<Transaction>> {
        let tx_index = usize::try_from(key.tx_index)
            .map_err(|_| ChainStateError::consistency(format!("negative tx index {}", key.tx_index)))?;

        let tx = if key.block_hash == self.chained_header.hash {
            self.block.transactions.get(tx_index).cloned().map(Arc::new)
        } else {
            self.block_store.try_get_transaction(&key.block_hash, tx_index)?
        };

        match tx {
            Some(tx) if tx.hash() == *tx_hash => Ok(tx),
            Some(_) => Err(ChainStateError::consistency(format!(
                "tx {} of block {} is not {}",
                tx_index,
                display_hash(&key.block_hash),
                display_hash(tx_hash)
            ))),
            None => Err(ChainStateError::consistency(format!(
                "previous tx {} not found at index {} of block {}",
                display_hash(tx_hash),
                tx_index,
                display_hash(&key.block_hash)
            ))),
        }
    }
}

fn decrement(counter: &mut u64, by: u64, name: &str) -> Result<()> {
    *counter = counter
        .checked_sub(by)
        .ok_or_else(|| ChainStateError::consistency(format!("{} would drop below zero", name)))?;
    Ok(())
}

fn check_tip(cursor: &dyn ChainStateCursor, expected: &Hash, height: Height) -> Result<()> {
    match cursor.get_chain_tip()? {
        Some(tip) if tip.hash == *expected && tip.height == height => Ok(()),
        Some(tip) => Err(ChainStateError::consistency(format!(
            "stored tip is {} at height {}, expected {} at height {}",
            display_hash(&tip.hash),
            tip.height,
            display_hash(expected),
            height
        ))),
        None => Err(ChainStateError::consistency("store has no chain tip")),
    }
}

// ============================================================================
// APPLY
// ============================================================================

/// Mutating forward replay inside the caller's write transaction
///
/// Yields one [`LoadedTx`] per transaction in block order. The first error
/// ends the sequence; the caller must then roll back. [`ApplyBlock::finish`]
/// applies any remaining transactions, then writes the journals, the header
/// and the counters.
pub struct ApplyBlock<'a> {
    cursor: &'a mut dyn ChainStateCursor,
    chain: &'a Chain,
    resolver: TxResolver<'a>,
    journal: BlockJournal,
    counters: ChainStateCounters,
    minted: HashSet<Hash>,
    next_tx: usize,
    failed: bool,
}

impl<'a> ApplyBlock<'a> {
    /// `chain` must end at the block's parent, which must also be the stored tip
    pub fn begin(
        cursor: &'a mut dyn ChainStateCursor,
        chain: &'a Chain,
        block_store: &'a dyn BlockStore,
        chained_header: ChainedHeader,
        block: Arc<Block>,
    ) -> Result<Self> {
        let tip = chain.tip();
        if chained_header.previous_block_hash() != &tip.hash || chained_header.height != tip.height + 1 {
            return Err(ChainStateError::InvalidChain(format!(
                "block {} at height {} does not extend tip {}",
                display_hash(&chained_header.hash),
                chained_header.height,
                display_hash(&tip.hash)
            )));
        }
        check_tip(cursor, &tip.hash, tip.height)?;

        let resolver = TxResolver::new(block_store, chained_header, block)?;
        let counters = cursor.read_counters()?;

        Ok(Self {
            cursor,
            chain,
            resolver,
            journal: BlockJournal::new(),
            counters,
            minted: HashSet::new(),
            next_tx: 0,
            failed: false,
        })
    }

    pub fn chained_header(&self) -> &ChainedHeader {
        &self.resolver.chained_header
    }

    /// Apply what is left, then persist journals, header and counters
    pub fn finish(mut self) -> Result<ChainStateCounters> {
        for loaded_tx in self.by_ref() {
            loaded_tx?;
        }
        if self.failed {
            return Err(ChainStateError::consistency("cannot finish a block whose replay failed"));
        }

        let chained_header = &self.resolver.chained_header;
        self.journal.write(self.cursor, chained_header)?;
        self.cursor.add_chained_header(chained_header)?;
        self.cursor.write_counters(&self.counters)?;
        Ok(self.counters)
    }

    fn apply_tx(&mut self, tx_index: usize) -> Result<LoadedTx> {
        let block = Arc::clone(&self.resolver.block);
        let tx = &block.transactions[tx_index];
        let tx_hash = tx.hash();

        if !self.minted.insert(tx_hash) || self.cursor.contains_unspent_tx(&tx_hash)? {
            return Err(ChainStateError::consistency(format!(
                "duplicate transaction {} in block {}",
                display_hash(&tx_hash),
                display_hash(&self.resolver.chained_header.hash)
            )));
        }

        // 1. Spend inputs (never the tx's own outputs)
        let is_coinbase = tx.is_coinbase();
        let mut input_txes = Vec::new();
        let mut prev_output_tx_keys = Vec::new();
        if !is_coinbase {
            input_txes.reserve(tx.inputs.len());
            prev_output_tx_keys.reserve(tx.inputs.len());
            for input in &tx.inputs {
                let (prev_tx, key) = self.spend_output(&input.prevout)?;
                input_txes.push(prev_tx);
                prev_output_tx_keys.push(key);
            }
        }

        // 2. Mint outputs
        if !tx.outputs.is_empty() {
            let unspent_tx = UnspentTx::new(
                tx_hash,
                self.resolver.chained_header.height,
                tx_index as i32,
                OutputStates::new(tx.outputs.len(), OutputState::Unspent),
            );
            if !self.cursor.try_add_unspent_tx(&unspent_tx)? {
                return Err(ChainStateError::consistency(format!(
                    "unspent tx {} already present",
                    display_hash(&tx_hash)
                )));
            }
            self.counters.unspent_tx_count += 1;
            self.counters.unspent_output_count += tx.outputs.len() as u64;
        }

        // 3. Journal and totals
        self.journal.record_unminted_tx(UnmintedTx { tx_hash, prev_output_tx_keys });
        self.counters.total_tx_count += 1;
        self.counters.total_input_count += tx.inputs.len() as u64;
        self.counters.total_output_count += tx.outputs.len() as u64;

        Ok(LoadedTx {
            transaction: Arc::new(tx.clone()),
            tx_hash,
            tx_index,
            is_coinbase,
            input_txes,
        })
    }

    /// Flip one output to Spent, removing the record when its last output goes
    fn spend_output(&mut self, prevout: &OutPoint) -> Result<(Arc<Transaction>, BlockTxKey)> {
        let mut unspent_tx = self.cursor.try_get_unspent_tx(&prevout.hash)?.ok_or_else(|| {
            ChainStateError::consistency(format!(
                "input spends {}:{} which is not in the unspent set",
                display_hash(&prevout.hash),
                prevout.index
            ))
        })?;

        match unspent_tx.output_states.get(prevout.index as usize) {
            Some(OutputState::Unspent) => {}
            Some(OutputState::Spent) => {
                return Err(ChainStateError::consistency(format!(
                    "output {}:{} is already spent",
                    display_hash(&prevout.hash),
                    prevout.index
                )))
            }
            None => {
                return Err(ChainStateError::consistency(format!(
                    "output {}:{} is out of range ({} outputs)",
                    display_hash(&prevout.hash),
                    prevout.index,
                    unspent_tx.output_states.len()
                )))
            }
        }
        unspent_tx.output_states.set(prevout.index as usize, OutputState::Spent);
        decrement(&mut self.counters.unspent_output_count, 1, "unspent output count")?;

        let key = self.resolver.key_for(self.chain, &unspent_tx)?;

        if unspent_tx.output_states.all_spent() {
            self.journal.record_spent_tx(unspent_tx.tx_hash);
            if !self.cursor.try_remove_unspent_tx(&unspent_tx.tx_hash)? {
                return Err(ChainStateError::consistency(format!(
                    "unspent tx {} vanished while spending",
                    display_hash(&unspent_tx.tx_hash)
                )));
            }
            decrement(&mut self.counters.unspent_tx_count, 1, "unspent tx count")?;
        } else if !self.cursor.try_update_unspent_tx(&unspent_tx)? {
            return Err(ChainStateError::consistency(format!(
                "unspent tx {} vanished while spending",
                display_hash(&unspent_tx.tx_hash)
            )));
        }

        let prev_tx = self.resolver.resolve(&key, &prevout.hash)?;
        Ok((prev_tx, key))
    }
}

impl Iterator for ApplyBlock<'_> {
    type Item = Result<LoadedTx>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_tx >= self.resolver.block.transactions.len() {
            return None;
        }
        let tx_index = self.next_tx;
        self.next_tx += 1;

        let result = self.apply_tx(tx_index);
        self.failed = result.is_err();
        Some(result)
    }
}

// ============================================================================
// UNDO
// ============================================================================

/// Mutating backward replay of the stored tip block
///
/// [`UndoBlock::begin`] recreates every record the block removed as a
/// skeleton with all outputs Spent; walking the transactions in reverse then
/// deletes what each minted and flips its spent outputs back to Unspent.
pub struct UndoBlock<'a> {
    cursor: &'a mut dyn ChainStateCursor,
    resolver: TxResolver<'a>,
    journal: BlockJournal,
    counters: ChainStateCounters,
    remaining: usize,
    failed: bool,
}

impl<'a> UndoBlock<'a> {
    pub fn begin(
        cursor: &'a mut dyn ChainStateCursor,
        block_store: &'a dyn BlockStore,
        chained_header: ChainedHeader,
        block: Arc<Block>,
    ) -> Result<Self> {
        check_tip(cursor, &chained_header.hash, chained_header.height)?;
        let resolver = TxResolver::new(block_store, chained_header, block)?;

        let journal = BlockJournal::read(cursor, &resolver.chained_header)?;
        journal.verify_against(&resolver.block)?;
        let mut counters = cursor.read_counters()?;

        // Skeletons for records whose last output this block spent
        let locations = journal.prev_tx_locations(&resolver.block);
        for tx_hash in &journal.spent_txes {
            let key = locations.get(tx_hash).ok_or_else(|| {
                ChainStateError::consistency(format!(
                    "spent tx {} is not an input of the block",
                    display_hash(tx_hash)
                ))
            })?;
            let prev_tx = resolver.resolve(key, tx_hash)?;
            let skeleton = UnspentTx::new(
                *tx_hash,
                key.block_height,
                key.tx_index,
                OutputStates::new(prev_tx.outputs.len(), OutputState::Spent),
            );
            if !cursor.try_add_unspent_tx(&skeleton)? {
                return Err(ChainStateError::consistency(format!(
                    "spent tx {} is still in the unspent set",
                    display_hash(tx_hash)
                )));
            }
            counters.unspent_tx_count += 1;
        }

        let remaining = resolver.block.transactions.len();
        Ok(Self {
            cursor,
            resolver,
            journal,
            counters,
            remaining,
            failed: false,
        })
    }

    pub fn chained_header(&self) -> &ChainedHeader {
        &self.resolver.chained_header
    }

    /// Undo what is left, then drop the journals and the header
    pub fn finish(mut self) -> Result<ChainStateCounters> {
        for loaded_tx in self.by_ref() {
            loaded_tx?;
        }
        if self.failed {
            return Err(ChainStateError::consistency("cannot finish a block whose undo failed"));
        }

        for tx_hash in &self.journal.spent_txes {
            if let Some(unspent_tx) = self.cursor.try_get_unspent_tx(tx_hash)? {
                if unspent_tx.output_states.all_spent() {
                    return Err(ChainStateError::consistency(format!(
                        "restored tx {} has no unspent output",
                        display_hash(tx_hash)
                    )));
                }
            }
        }

        let chained_header = &self.resolver.chained_header;
        BlockJournal::remove(self.cursor, chained_header)?;
        self.cursor.remove_chained_header(chained_header)?;
        self.cursor.write_counters(&self.counters)?;
        Ok(self.counters)
    }

    fn undo_tx(&mut self, tx_index: usize) -> Result<LoadedTx> {
        let block = Arc::clone(&self.resolver.block);
        let tx = &block.transactions[tx_index];
        let tx_hash = tx.hash();
        let height = self.resolver.chained_header.height;

        // 1. Unmint outputs; later blocks are already undone so all must be unspent
        if !tx.outputs.is_empty() {
            let minted = self.cursor.try_get_unspent_tx(&tx_hash)?.ok_or_else(|| {
                ChainStateError::consistency(format!("minted tx {} missing on undo", display_hash(&tx_hash)))
            })?;
            if minted.block_height != height || !minted.output_states.all_unspent() {
                return Err(ChainStateError::consistency(format!(
                    "minted tx {} is not fully unspent at height {}",
                    display_hash(&tx_hash),
                    height
                )));
            }
            self.cursor.try_remove_unspent_tx(&tx_hash)?;
            decrement(&mut self.counters.unspent_tx_count, 1, "unspent tx count")?;
            decrement(&mut self.counters.unspent_output_count, tx.outputs.len() as u64, "unspent output count")?;
        }

        // 2. Unspend inputs, last first
        let is_coinbase = tx.is_coinbase();
        let mut input_txes = Vec::new();
        if !is_coinbase {
            let keys = self.journal.prev_tx_keys(tx_index).map(<[BlockTxKey]>::to_vec).unwrap_or_default();
            for (input, key) in tx.inputs.iter().zip(&keys).rev() {
                input_txes.push(self.unspend_output(&input.prevout, key)?);
            }
            input_txes.reverse();
        }

        decrement(&mut self.counters.total_tx_count, 1, "total tx count")?;
        decrement(&mut self.counters.total_input_count, tx.inputs.len() as u64, "total input count")?;
        decrement(&mut self.counters.total_output_count, tx.outputs.len() as u64, "total output count")?;

        Ok(LoadedTx {
            transaction: Arc::new(tx.clone()),
            tx_hash,
            tx_index,
            is_coinbase,
            input_txes,
        })
    }

    fn unspend_output(&mut self, prevout: &OutPoint, key: &BlockTxKey) -> Result<Arc<Transaction>> {
        let mut unspent_tx = self.cursor.try_get_unspent_tx(&prevout.hash)?.ok_or_else(|| {
            ChainStateError::consistency(format!(
                "previous tx {} missing on undo",
                display_hash(&prevout.hash)
            ))
        })?;

        if unspent_tx.output_states.get(prevout.index as usize) != Some(OutputState::Spent) {
            return Err(ChainStateError::consistency(format!(
                "output {}:{} is not spent on undo",
                display_hash(&prevout.hash),
                prevout.index
            )));
        }
        unspent_tx.output_states.set(prevout.index as usize, OutputState::Unspent);
        self.cursor.try_update_unspent_tx(&unspent_tx)?;
        self.counters.unspent_output_count += 1;

        self.resolver.resolve(key, &prevout.hash)
    }
}

impl Iterator for UndoBlock<'_> {
    type Item = Result<LoadedTx>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let result = self.undo_tx(self.remaining);
        self.failed = result.is_err();
        Some(result)
    }
}

// ============================================================================
// READ-ONLY
// ============================================================================

/// Read-only replay entry point
pub struct BlockReplayer;

impl BlockReplayer {
    /// Replay `block_hash` against a snapshot without touching the store
    ///
    /// The block must be on the snapshot's chain or extend its tip. Inputs
    /// resolve through the block's unminted journal when it has one, and
    /// otherwise through the snapshot's unspent set and the block itself.
    pub fn replay_block<'a>(
        block_store: &'a dyn BlockStore,
        chain_state: &'a ChainState,
        block_hash: &Hash,
        direction: ReplayDirection,
    ) -> Result<ReplayTxes<'a>> {
        let block = block_store
            .try_get_block(block_hash)?
            .ok_or_else(|| ChainStateError::BlockNotFound(display_hash(block_hash)))?;

        let chain = chain_state.chain();
        let on_chain = chain.blocks().iter().find(|header| header.hash == *block_hash).cloned();
        let (chained_header, journal) = match on_chain {
            Some(chained_header) => {
                let journal = BlockJournal::try_read(chain_state.cursor(), &chained_header)?;
                (chained_header, journal)
            }
            None if block.header.prev_block_hash == chain.tip().hash => {
                (ChainedHeader::create_from_prev(chain.tip(), block.header.clone())?, None)
            }
            None => {
                return Err(ChainStateError::BlockNotFound(format!(
                    "{} is neither on the chain nor its next block",
                    display_hash(block_hash)
                )))
            }
        };
        if let Some(journal) = &journal {
            journal.verify_against(&block)?;
        }

        let tx_positions = block
            .transactions
            .iter()
            .enumerate()
            .map(|(tx_index, tx)| (tx.hash(), tx_index))
            .collect();
        let order: Vec<usize> = match direction {
            ReplayDirection::Forward => (0..block.transactions.len()).collect(),
            ReplayDirection::Backward => (0..block.transactions.len()).rev().collect(),
        };

        Ok(ReplayTxes {
            chain_state,
            resolver: TxResolver::new(block_store, chained_header, block)?,
            journal,
            tx_positions,
            order: order.into_iter(),
            failed: false,
        })
    }
}

/// Lazy sequence produced by [`BlockReplayer::replay_block`]
pub struct ReplayTxes<'a> {
    chain_state: &'a ChainState,
    resolver: TxResolver<'a>,
    journal: Option<BlockJournal>,
    tx_positions: HashMap<Hash, usize>,
    order: std::vec::IntoIter<usize>,
    failed: bool,
}

impl ReplayTxes<'_> {
    pub fn chained_header(&self) -> &ChainedHeader {
        &self.resolver.chained_header
    }

    fn load_tx(&self, tx_index: usize) -> Result<LoadedTx> {
        let tx = &self.resolver.block.transactions[tx_index];
        let tx_hash = tx.hash();
        let is_coinbase = tx.is_coinbase();

        let mut input_txes = Vec::new();
        if !is_coinbase {
            input_txes.reserve(tx.inputs.len());
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let key = self.locate(tx_index, input_index, &input.prevout.hash)?;
                input_txes.push(self.resolver.resolve(&key, &input.prevout.hash)?);
            }
        }

        Ok(LoadedTx {
            transaction: Arc::new(tx.clone()),
            tx_hash,
            tx_index,
            is_coinbase,
            input_txes,
        })
    }

    fn locate(&self, tx_index: usize, input_index: usize, prev_hash: &Hash) -> Result<BlockTxKey> {
        if let Some(journal) = &self.journal {
            return journal
                .prev_tx_keys(tx_index)
                .and_then(|keys| keys.get(input_index))
                .copied()
                .ok_or_else(|| ChainStateError::consistency(format!("journal has no key for input {}", input_index)));
        }

        let chained_header = &self.resolver.chained_header;
        if let Some(&position) = self.tx_positions.get(prev_hash) {
            if position < tx_index {
                return Ok(BlockTxKey {
                    block_hash: chained_header.hash,
                    block_height: chained_header.height,
                    tx_index: position as i32,
                });
            }
        }

        let unspent_tx = self.chain_state.try_get_unspent_tx(prev_hash)?.ok_or_else(|| {
            ChainStateError::consistency(format!(
                "previous tx {} cannot be resolved without a journal",
                display_hash(prev_hash)
            ))
        })?;
        self.resolver.key_for(self.chain_state.chain(), &unspent_tx)
    }
}

impl Iterator for ReplayTxes<'_> {
    type Item = Result<LoadedTx>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let tx_index = self.order.next()?;
        let result = self.load_tx(tx_index);
        self.failed = result.is_err();
        Some(result)
    }
}
