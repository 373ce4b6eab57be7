//! Consensus constants and chain-state engine defaults

/// Maximum money supply: 21,000,000 BTC in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Maximum transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum number of inputs per transaction
pub const MAX_INPUTS: usize = 100_000;

/// Maximum number of outputs per transaction
pub const MAX_OUTPUTS: usize = 100_000;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block subsidy: 50 BTC
pub const INITIAL_SUBSIDY: i64 = 50 * 100_000_000;

/// Satoshis per BTC
pub const SATOSHIS_PER_BTC: i64 = 100_000_000;

/// Output index of the null outpoint spent by a coinbase input
pub const COINBASE_PREVOUT_INDEX: u32 = 0xffffffff;

/// Size of a serialized block header
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Blocks applied between durability flushes
pub const DEFAULT_FLUSH_INTERVAL: u32 = 100;

/// Depth below the tip after which undo journals are pruned
pub const DEFAULT_MAX_ROLLBACK_DEPTH: u32 = 2_016;

/// Bounded queue between the replayer and script workers
pub const DEFAULT_SCRIPT_QUEUE_CAPACITY: usize = 4_096;
