//! # Chainstate-Proof
//!
//! Transactional, reorganizable UTXO chain state for Bitcoin-style blockchains.
//!
//! The crate keeps the unspent-output set of the active chain in a
//! transactional store and moves it block by block, forward and backward,
//! without ever leaving it half-applied.
//!
//! ## Architecture
//!
//! - Chain navigation: fork point and ordered remove/add steps between two chains
//! - Chain-state store: single-writer cursor over headers, unspent txes, journals and counters
//! - Undo journals: per-block records that make every block reversible
//! - Block replay: resolve a block's inputs forward (apply) or backward (undo)
//! - Script validation: worker pool checking every input, failures collected exhaustively
//! - UTXO commitment: double SHA256 over the canonical unspent set
//!
//! ## Design Principles
//!
//! 1. **One block, one transaction**: a block's effect on chain, UTXO set and journals commits as a whole
//! 2. **Canonical encodings**: persisted records have one byte form, so equal sets hash equal
//! 3. **Explicit wiring**: storage, block store, rules and logging span are constructor parameters
//! 4. **Exact Version Pinning**: consensus-critical hashing dependencies pinned to exact versions
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use chainstate_proof::*;
//!
//! let coinbase = Transaction {
//!     version: 1,
//!     inputs: vec![TransactionInput {
//!         prevout: OutPoint::null(),
//!         script_sig: vec![0x00],
//!         sequence: 0xffffffff,
//!     }],
//!     outputs: vec![TransactionOutput { value: 50 * SATOSHIS_PER_BTC, script_pubkey: vec![0x51] }],
//!     lock_time: 0,
//! };
//! let genesis = Block {
//!     header: BlockHeader {
//!         version: 1,
//!         prev_block_hash: [0; 32],
//!         merkle_root: calculate_merkle_root(std::slice::from_ref(&coinbase)),
//!         timestamp: 1_231_006_505,
//!         bits: 0x207fffff,
//!         nonce: 0,
//!     },
//!     transactions: vec![coinbase],
//! };
//!
//! let block_store = Arc::new(MemoryBlockStore::new());
//! let genesis_header = ChainedHeader::create_for_genesis(genesis.header.clone());
//! block_store.add_block(genesis);
//!
//! let builder = ChainStateBuilder::new(
//!     Arc::new(MemoryChainStateStorage::new()),
//!     block_store,
//!     Arc::new(CoreRules::without_scripts()),
//!     genesis_header,
//!     ChainStateConfig::deterministic(),
//!     tracing::Span::none(),
//! )
//! .unwrap();
//!
//! assert_eq!(builder.chain().height(), 0);
//! assert_eq!(builder.counters().unwrap().unspent_tx_count, 0);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod encoding;
pub mod chain;
pub mod reorganization;
pub mod storage;
pub mod memory;
pub mod journal;
pub mod chain_state;
pub mod replay;
pub mod script_validator;
pub mod rules;
pub mod economic;
pub mod transaction;
pub mod utxo_commitment;
pub mod builder;
pub mod mempool;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ChainStateError, Result, ScriptError, ScriptFailure};

pub use builder::ChainStateBuilder;
pub use chain::{calculate_header_work, Chain};
pub use chain_state::ChainState;
pub use config::ChainStateConfig;
pub use encoding::calculate_merkle_root;
pub use journal::BlockJournal;
pub use memory::{MemoryBlockStore, MemoryChainStateStorage};
pub use mempool::{MempoolResult, TxesConfirmed, UnconfirmedTx, UnconfirmedTxesBuilder};
pub use reorganization::{navigate_towards, should_reorganize, NavigationStep, ReorganizationResult};
pub use replay::{ApplyBlock, BlockReplayer, UndoBlock};
pub use rules::{BlockchainRules, CoreRules};
pub use script_validator::{ScriptValidationReport, ScriptValidator};
pub use storage::{
    BlockStore, ChainStateCounters, ChainStateCursor, ChainStateStorage, Counter, WriteTransaction,
};
