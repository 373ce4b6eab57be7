//! Shared fixtures for the integration tests

#![allow(dead_code)]

use chainstate_proof::*;
use std::sync::Arc;

/// Regtest-style target: every header carries work 2
pub const TEST_BITS: u32 = 0x207fffff;

pub struct TestNode {
    pub storage: Arc<MemoryChainStateStorage>,
    pub block_store: Arc<MemoryBlockStore>,
    pub genesis: ChainedHeader,
}

impl TestNode {
    pub fn new() -> Self {
        let block_store = Arc::new(MemoryBlockStore::new());
        let genesis_block = create_genesis_block();
        let genesis = ChainedHeader::create_for_genesis(genesis_block.header.clone());
        block_store.add_block(genesis_block);
        Self {
            storage: Arc::new(MemoryChainStateStorage::new()),
            block_store,
            genesis,
        }
    }

    pub fn builder(&self) -> ChainStateBuilder {
        self.builder_with(Arc::new(CoreRules::without_scripts()), ChainStateConfig::deterministic())
    }

    pub fn builder_with(&self, rules: Arc<dyn BlockchainRules>, config: ChainStateConfig) -> ChainStateBuilder {
        ChainStateBuilder::new(
            self.storage.clone(),
            self.block_store.clone(),
            rules,
            self.genesis.clone(),
            config,
            tracing::Span::none(),
        )
        .unwrap()
    }

    /// Mine a block on `prev` whose coinbase is tagged with `tag`
    pub fn mine(&self, prev: &ChainedHeader, tag: u8, txes: Vec<Transaction>) -> ChainedHeader {
        let mut transactions = vec![create_coinbase_tx(prev.height + 1, tag)];
        transactions.extend(txes);
        self.mine_raw(prev, transactions)
    }

    /// Mine a block with exactly `transactions`
    pub fn mine_raw(&self, prev: &ChainedHeader, transactions: Vec<Transaction>) -> ChainedHeader {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: prev.hash,
            merkle_root: calculate_merkle_root(&transactions),
            timestamp: 1_300_000_000 + prev.height as u32 + 1,
            bits: TEST_BITS,
            nonce: 0,
        };
        let chained_header = ChainedHeader::create_from_prev(prev, header.clone()).unwrap();
        self.block_store.add_block(Block { header, transactions });
        chained_header
    }

    /// Mine `count` coinbase-only blocks on `prev`
    pub fn mine_chain(&self, prev: &ChainedHeader, count: usize, tag: u8) -> Vec<ChainedHeader> {
        let mut headers = Vec::with_capacity(count);
        let mut prev = prev.clone();
        for _ in 0..count {
            prev = self.mine(&prev, tag, vec![]);
            headers.push(prev.clone());
        }
        headers
    }

    pub fn block(&self, chained_header: &ChainedHeader) -> Arc<Block> {
        self.block_store.try_get_block(&chained_header.hash).unwrap().unwrap()
    }

    /// Hash of the coinbase of `chained_header`'s block
    pub fn coinbase_hash(&self, chained_header: &ChainedHeader) -> Hash {
        self.block(chained_header).transactions[0].hash()
    }

    pub fn chain_of(&self, headers: &[ChainedHeader]) -> Chain {
        let mut blocks = vec![self.genesis.clone()];
        blocks.extend_from_slice(headers);
        Chain::from_headers(blocks).unwrap()
    }
}

pub fn create_genesis_block() -> Block {
    let coinbase = create_coinbase_tx(0, 0);
    Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: calculate_merkle_root(std::slice::from_ref(&coinbase)),
            timestamp: 1_231_006_505,
            bits: TEST_BITS,
            nonce: 0,
        },
        transactions: vec![coinbase],
    }
}

/// Coinbase paying the full subsidy, unique per (height, tag)
pub fn create_coinbase_tx(height: Height, tag: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput {
            value: INITIAL_SUBSIDY,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Spend `prevouts`, creating one output per value
pub fn create_spend_tx(prevouts: &[(Hash, u32)], values: &[i64]) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts
            .iter()
            .map(|(hash, index)| TransactionInput {
                prevout: OutPoint { hash: *hash, index: *index },
                script_sig: vec![0x01],
                sequence: 0xffffffff,
            })
            .collect(),
        outputs: values
            .iter()
            .map(|value| TransactionOutput {
                value: *value,
                script_pubkey: vec![0x51],
            })
            .collect(),
        lock_time: 0,
    }
}

/// Every unspent record of the committed state, in hash order
pub fn unspent_set(builder: &ChainStateBuilder) -> Vec<UnspentTx> {
    let chain_state = builder.to_chain_state().unwrap();
    let records = chain_state.read_unspent_transactions().collect::<Result<Vec<_>>>();
    records.unwrap()
}
