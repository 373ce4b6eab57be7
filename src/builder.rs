//! Block-processing driver
//!
//! `ChainStateBuilder` owns the single write cursor of a chain-state
//! database. Each block it applies or undoes runs in exactly one write
//! transaction: replay, script validation, block rules and journal pruning
//! either all commit together or the transaction is rolled back.

use std::sync::Arc;
use tracing::Span;

use crate::chain::Chain;
use crate::chain_state::ChainState;
use crate::config::ChainStateConfig;
use crate::error::{display_hash, ChainStateError, Result};
use crate::journal::BlockJournal;
use crate::reorganization::{should_reorganize, ReorganizationResult};
use crate::replay::{ApplyBlock, UndoBlock};
use crate::rules::BlockchainRules;
use crate::script_validator::{script_inputs, ScriptValidator};
use crate::storage::{BlockStore, ChainStateCounters, ChainStateCursor, ChainStateStorage, WriteTransaction};
use crate::types::*;
use crate::utxo_commitment;

/// Drives a chain state from block to block
pub struct ChainStateBuilder {
    storage: Arc<dyn ChainStateStorage>,
    cursor: Box<dyn ChainStateCursor>,
    block_store: Arc<dyn BlockStore>,
    rules: Arc<dyn BlockchainRules>,
    script_validator: ScriptValidator,
    chain: Chain,
    config: ChainStateConfig,
    blocks_since_flush: u32,
    span: Span,
}

impl ChainStateBuilder {
    /// Open the builder, seeding an empty store with `genesis`
    ///
    /// A non-empty store must already be rooted at `genesis`. Genesis gets a
    /// header only: its coinbase is never added to the unspent set.
    pub fn new(
        storage: Arc<dyn ChainStateStorage>,
        block_store: Arc<dyn BlockStore>,
        rules: Arc<dyn BlockchainRules>,
        genesis: ChainedHeader,
        config: ChainStateConfig,
        span: Span,
    ) -> Result<Self> {
        if genesis.height != 0 {
            return Err(ChainStateError::InvalidChain(format!(
                "genesis header {} has height {}",
                display_hash(&genesis.hash),
                genesis.height
            )));
        }

        let mut cursor = storage.open_cursor()?;
        let headers = cursor.read_chain().collect::<Result<Vec<_>>>()?;

        let chain = if headers.is_empty() {
            let mut txn = WriteTransaction::begin(cursor.as_mut())?;
            txn.add_chained_header(&genesis)?;
            txn.write_counters(&ChainStateCounters::default())?;
            txn.commit()?;
            span.in_scope(|| tracing::info!(genesis = %display_hash(&genesis.hash), "initialized empty chain state"));
            Chain::create_for_genesis(genesis)?
        } else {
            let chain = Chain::from_headers(headers)?;
            if chain.genesis().hash != genesis.hash {
                return Err(ChainStateError::InvalidChain(format!(
                    "stored chain is rooted at {}, expected {}",
                    display_hash(&chain.genesis().hash),
                    display_hash(&genesis.hash)
                )));
            }
            span.in_scope(|| {
                tracing::info!(height = chain.height(), tip = %display_hash(&chain.tip().hash), "loaded chain state")
            });
            chain
        };

        let script_validator = ScriptValidator::new(
            Arc::clone(&rules),
            &config,
            tracing::debug_span!(parent: &span, "script_validation"),
        );

        Ok(Self {
            storage,
            cursor,
            block_store,
            rules,
            script_validator,
            chain,
            config,
            blocks_since_flush: 0,
            span,
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn config(&self) -> &ChainStateConfig {
        &self.config
    }

    /// Counters as last committed
    pub fn counters(&self) -> Result<ChainStateCounters> {
        self.cursor.read_counters()
    }

    /// Connect the block for `chained_header` on top of the tip
    pub fn add_block(&mut self, chained_header: &ChainedHeader) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let block = fetch_block(self.block_store.as_ref(), &chained_header.hash)?;
        let result = apply_block(
            self.cursor.as_mut(),
            &self.chain,
            self.block_store.as_ref(),
            self.rules.as_ref(),
            &self.script_validator,
            self.config.max_rollback_depth,
            chained_header,
            block,
        );

        let counters = match result {
            Ok(counters) => counters,
            Err(e) => {
                tracing::warn!(
                    height = chained_header.height,
                    hash = %display_hash(&chained_header.hash),
                    error = %e,
                    "rolled back block"
                );
                return Err(e);
            }
        };

        self.chain.add_block(chained_header.clone())?;
        tracing::info!(
            height = chained_header.height,
            hash = %display_hash(&chained_header.hash),
            unspent_txes = counters.unspent_tx_count,
            unspent_outputs = counters.unspent_output_count,
            "applied block"
        );

        self.blocks_since_flush += 1;
        if self.config.flush_interval > 0 && self.blocks_since_flush >= self.config.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Disconnect the tip block, returning its header
    pub fn rollback_block(&mut self) -> Result<ChainedHeader> {
        let span = self.span.clone();
        let _enter = span.enter();

        let tip = self.chain.tip().clone();
        if tip.height == 0 {
            return Err(ChainStateError::InvalidChain("cannot roll back the genesis block".to_string()));
        }

        let block = fetch_block(self.block_store.as_ref(), &tip.hash)?;
        let result = undo_block(self.cursor.as_mut(), self.block_store.as_ref(), &tip, block);
        if let Err(e) = result {
            tracing::warn!(height = tip.height, hash = %display_hash(&tip.hash), error = %e, "rollback aborted");
            return Err(e);
        }

        self.chain.remove_block(&tip)?;
        tracing::info!(height = tip.height, hash = %display_hash(&tip.hash), "rolled back block");
        Ok(tip)
    }

    /// Walk from the current chain to `target`, one committed block per step
    ///
    /// Stops at the first failing step; the chain stays at the last step that committed.
    pub fn navigate_to(&mut self, target: &Chain) -> Result<ReorganizationResult> {
        let source = self.chain.clone();
        let path = source.navigate_towards(target)?;
        let common_ancestor = path.common_ancestor().clone();
        let steps: Vec<_> = path.collect();

        let mut disconnected_blocks = Vec::new();
        let mut connected_blocks = Vec::new();
        for step in steps {
            match step.direction {
                ReplayDirection::Backward => {
                    let removed = self.rollback_block()?;
                    if removed.hash != step.header.hash {
                        return Err(ChainStateError::consistency(format!(
                            "rolled back {} while navigating away from {}",
                            display_hash(&removed.hash),
                            display_hash(&step.header.hash)
                        )));
                    }
                    disconnected_blocks.push(removed);
                }
                ReplayDirection::Forward => {
                    self.add_block(&step.header)?;
                    connected_blocks.push(step.header);
                }
            }
        }

        if !disconnected_blocks.is_empty() {
            self.span.in_scope(|| {
                tracing::info!(
                    depth = disconnected_blocks.len(),
                    fork = %display_hash(&common_ancestor.hash),
                    tip = %display_hash(&self.chain.tip().hash),
                    "reorganized chain"
                )
            });
        }

        Ok(ReorganizationResult {
            reorganization_depth: disconnected_blocks.len(),
            common_ancestor,
            disconnected_blocks,
            connected_blocks,
        })
    }

    /// Switch to `candidate` only if it carries more work
    pub fn reorganize_if_better(&mut self, candidate: &Chain) -> Result<Option<ReorganizationResult>> {
        if !should_reorganize(&self.chain, candidate) {
            return Ok(None);
        }
        self.navigate_to(candidate).map(Some)
    }

    /// Snapshot of the committed state
    pub fn to_chain_state(&self) -> Result<ChainState> {
        ChainState::open(self.storage.as_ref())
    }

    pub fn utxo_commitment(&self) -> Result<Hash> {
        utxo_commitment::compute_hash(&self.to_chain_state()?)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cursor.flush()?;
        self.blocks_since_flush = 0;
        self.span.in_scope(|| tracing::debug!(height = self.chain.height(), "flushed chain state"));
        Ok(())
    }

    pub fn defragment(&mut self) -> Result<()> {
        self.span.in_scope(|| tracing::debug!("defragmenting chain state"));
        self.cursor.defragment()
    }
}

fn fetch_block(block_store: &dyn BlockStore, block_hash: &Hash) -> Result<Arc<Block>> {
    block_store
        .try_get_block(block_hash)?
        .ok_or_else(|| ChainStateError::BlockNotFound(display_hash(block_hash)))
}

/// One block forward, in one transaction
///
/// 1. Replay the block, spending and minting in the store
/// 2. Validate every input script concurrently with the replay
/// 3. Apply the block rules to the resolved transactions
/// 4. Prune the journal that just fell past the rollback horizon
/// 5. Commit
#[allow(clippy::too_many_arguments)]
fn apply_block(
    cursor: &mut dyn ChainStateCursor,
    chain: &Chain,
    block_store: &dyn BlockStore,
    rules: &dyn BlockchainRules,
    script_validator: &ScriptValidator,
    max_rollback_depth: u32,
    chained_header: &ChainedHeader,
    block: Arc<Block>,
) -> Result<ChainStateCounters> {
    let mut txn = WriteTransaction::begin(cursor)?;
    let mut validation = script_validator.start();
    let mut loaded_txes = Vec::with_capacity(block.transactions.len());

    // 1-2
    let mut apply = ApplyBlock::begin(&mut *txn, chain, block_store, chained_header.clone(), Arc::clone(&block))?;
    for loaded_tx in apply.by_ref() {
        let loaded_tx = loaded_tx?;
        for item in script_inputs(chained_header, &loaded_tx)? {
            validation.submit(item);
        }
        loaded_txes.push(loaded_tx);
    }
    let counters = apply.finish()?;
    let report = validation.finish();
    tracing::debug!(checked = report.checked, failures = report.failures.len(), "validated scripts");
    report.into_result()?;

    // 3
    rules.validate_block(chained_header, &block, &loaded_txes)?;

    // 4
    if max_rollback_depth > 0 {
        let prune_height = i64::from(chained_header.height) - i64::from(max_rollback_depth) - 1;
        // genesis has no journal; depths beyond the chain prune nothing
        if let Some(prune_height) = Height::try_from(prune_height).ok().filter(|height| *height >= 1) {
            if let Some(pruned) = chain.get(prune_height) {
                if BlockJournal::prune(&mut *txn, pruned)? {
                    tracing::debug!(height = prune_height, "pruned undo journal");
                }
            }
        }
    }

    // 5
    txn.commit()?;
    Ok(counters)
}

/// Tip block backward, in one transaction
fn undo_block(
    cursor: &mut dyn ChainStateCursor,
    block_store: &dyn BlockStore,
    chained_header: &ChainedHeader,
    block: Arc<Block>,
) -> Result<ChainStateCounters> {
    let mut txn = WriteTransaction::begin(cursor)?;
    let mut undo = UndoBlock::begin(&mut *txn, block_store, chained_header.clone(), block)?;
    for loaded_tx in undo.by_ref() {
        loaded_tx?;
    }
    let counters = undo.finish()?;
    txn.commit()?;
    Ok(counters)
}
