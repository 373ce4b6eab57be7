//! Integration tests for the unconfirmed transaction pool

mod common;

use chainstate_proof::*;
use common::*;
use std::sync::Arc;

fn create_test_mempool(node: &TestNode, rules: CoreRules) -> UnconfirmedTxesBuilder {
    UnconfirmedTxesBuilder::new(node.storage.clone(), node.block_store.clone(), Arc::new(rules))
}

/// Node with two coinbase-only blocks applied
fn create_funded_node() -> (TestNode, ChainStateBuilder, Vec<ChainedHeader>) {
    let node = TestNode::new();
    let mut builder = node.builder();
    let blocks = node.mine_chain(&node.genesis, 2, 0);
    for header in &blocks {
        builder.add_block(header).unwrap();
    }
    (node, builder, blocks)
}

#[test]
fn test_accept_spend_of_unspent_output() {
    let (node, _builder, blocks) = create_funded_node();
    let mempool = create_test_mempool(&node, CoreRules::without_scripts());

    let tx = create_spend_tx(&[(node.coinbase_hash(&blocks[0]), 0)], &[49 * SATOSHIS_PER_BTC]);
    let tx_hash = tx.hash();
    assert_eq!(mempool.accept_transaction(tx).unwrap(), MempoolResult::Accepted);

    let pooled = mempool.try_get_transaction(&tx_hash).unwrap();
    assert_eq!(pooled.fee, SATOSHIS_PER_BTC);
    assert_eq!(pooled.added_at_height, 2);
    assert_eq!(mempool.len(), 1);
}

#[test]
fn test_reject_duplicate_and_conflict() {
    let (node, _builder, blocks) = create_funded_node();
    let mempool = create_test_mempool(&node, CoreRules::without_scripts());
    let c1 = node.coinbase_hash(&blocks[0]);

    let tx = create_spend_tx(&[(c1, 0)], &[49 * SATOSHIS_PER_BTC]);
    assert!(mempool.try_add_transaction(tx.clone()).unwrap());
    assert!(!mempool.try_add_transaction(tx).unwrap());

    let conflicting = create_spend_tx(&[(c1, 0)], &[48 * SATOSHIS_PER_BTC]);
    assert!(matches!(mempool.accept_transaction(conflicting).unwrap(), MempoolResult::Rejected(_)));
    assert_eq!(mempool.len(), 1);
}

#[test]
fn test_reject_unknown_or_invalid_inputs() {
    let (node, _builder, blocks) = create_funded_node();
    let mempool = create_test_mempool(&node, CoreRules::without_scripts());
    let c2 = node.coinbase_hash(&blocks[1]);

    let missing = create_spend_tx(&[([9; 32], 0)], &[1]);
    let out_of_range = create_spend_tx(&[(c2, 5)], &[1]);
    let overspend = create_spend_tx(&[(c2, 0)], &[51 * SATOSHIS_PER_BTC]);
    let coinbase = create_coinbase_tx(3, 0);

    for tx in [missing, out_of_range, overspend, coinbase] {
        assert!(matches!(mempool.accept_transaction(tx).unwrap(), MempoolResult::Rejected(_)));
    }
    assert!(mempool.is_empty());
}

#[test]
fn test_reject_spent_output() {
    let (node, mut builder, blocks) = create_funded_node();
    let c2 = node.coinbase_hash(&blocks[1]);
    let b3 = node.mine(&blocks[1], 0, vec![create_spend_tx(&[(c2, 0)], &[50 * SATOSHIS_PER_BTC])]);
    builder.add_block(&b3).unwrap();

    let mempool = create_test_mempool(&node, CoreRules::without_scripts());
    let tx = create_spend_tx(&[(c2, 0)], &[49 * SATOSHIS_PER_BTC]);
    assert!(matches!(mempool.accept_transaction(tx).unwrap(), MempoolResult::Rejected(_)));
}

#[test]
fn test_reject_failing_script() {
    let (node, _builder, blocks) = create_funded_node();
    let mempool = create_test_mempool(
        &node,
        CoreRules::new(|item| {
            if item.prev_output.script_pubkey == vec![0x51] {
                Err(ScriptError("locked".to_string()))
            } else {
                Ok(())
            }
        }),
    );

    let tx = create_spend_tx(&[(node.coinbase_hash(&blocks[0]), 0)], &[49 * SATOSHIS_PER_BTC]);
    match mempool.accept_transaction(tx).unwrap() {
        MempoolResult::Rejected(reason) => assert!(reason.contains("locked")),
        MempoolResult::Accepted => panic!("script failure accepted"),
    }
}

#[test]
fn test_confirm_block_removes_confirmed_and_conflicted() {
    let (node, mut builder, blocks) = create_funded_node();
    let mempool = create_test_mempool(&node, CoreRules::without_scripts());
    let (c1, c2) = (node.coinbase_hash(&blocks[0]), node.coinbase_hash(&blocks[1]));

    let confirmed = create_spend_tx(&[(c1, 0)], &[49 * SATOSHIS_PER_BTC]);
    let displaced = create_spend_tx(&[(c2, 0)], &[48 * SATOSHIS_PER_BTC]);
    let (confirmed_hash, displaced_hash) = (confirmed.hash(), displaced.hash());
    assert!(mempool.try_add_transaction(confirmed.clone()).unwrap());
    assert!(mempool.try_add_transaction(displaced).unwrap());

    let winner = create_spend_tx(&[(c2, 0)], &[47 * SATOSHIS_PER_BTC]);
    let b3 = node.mine(&blocks[1], 0, vec![confirmed, winner]);
    builder.add_block(&b3).unwrap();

    let event = mempool.confirm_block(&b3, &node.block(&b3));
    assert_eq!(event.confirm_block, b3);
    assert_eq!(event.confirmed_txes.len(), 1);
    assert!(event.confirmed_txes.contains_key(&confirmed_hash));
    assert_eq!(event.conflicted_txes, vec![displaced_hash]);
    assert!(mempool.is_empty());
    assert!(!mempool.contains_transaction(&displaced_hash));
}

/// Accepts any block, so coinbases may pay more than the subsidy
struct PermissiveRules;

impl BlockchainRules for PermissiveRules {
    fn validate_block(&self, _chained_header: &ChainedHeader, _block: &Block, _loaded_txes: &[LoadedTx]) -> Result<()> {
        Ok(())
    }

    fn validate_transaction_script(&self, _input: &TxInputWithPrevOutput) -> std::result::Result<(), ScriptError> {
        Ok(())
    }
}

#[test]
fn test_reject_input_value_out_of_range() {
    let node = TestNode::new();
    let mut builder = node.builder_with(Arc::new(PermissiveRules), ChainStateConfig::deterministic());
    let mut prev = node.genesis.clone();
    let mut coinbase_hashes = Vec::new();
    for tag in 1..=2 {
        let mut coinbase = create_coinbase_tx(prev.height + 1, tag);
        coinbase.outputs[0].value = MAX_MONEY;
        coinbase_hashes.push(coinbase.hash());
        prev = node.mine_raw(&prev, vec![coinbase]);
        builder.add_block(&prev).unwrap();
    }

    let mempool = create_test_mempool(&node, CoreRules::without_scripts());
    let tx = create_spend_tx(&[(coinbase_hashes[0], 0), (coinbase_hashes[1], 0)], &[1]);
    match mempool.accept_transaction(tx).unwrap() {
        MempoolResult::Rejected(reason) => assert!(reason.contains("out of range")),
        MempoolResult::Accepted => panic!("input value beyond MAX_MONEY accepted"),
    }
    assert!(mempool.is_empty());

    let tx = create_spend_tx(&[(coinbase_hashes[0], 0)], &[1]);
    assert_eq!(mempool.accept_transaction(tx).unwrap(), MempoolResult::Accepted);
}
