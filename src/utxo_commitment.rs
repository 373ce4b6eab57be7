//! UTXO set commitment
//!
//! Commitment: 𝒰 → ℍ = SHA256(SHA256(enc(u₁) ‖ enc(u₂) ‖ … ‖ enc(uₙ)))
//! where u₁ < u₂ < … < uₙ by transaction hash and enc is the UnspentTx
//! record encoding. Equal sets give equal commitments, whatever order the
//! records were written in.

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};

use crate::chain_state::ChainState;
use crate::encoding::encode_unspent_tx;
use crate::error::Result;
use crate::storage::ChainStateCursor;
use crate::types::*;

/// Commitment over the unspent set of a snapshot
pub fn compute_hash(chain_state: &ChainState) -> Result<Hash> {
    compute_cursor_hash(chain_state.cursor())
}

/// Commitment over whatever `cursor` currently sees
pub fn compute_cursor_hash(cursor: &dyn ChainStateCursor) -> Result<Hash> {
    let mut hasher = sha256d::Hash::engine();
    for unspent_tx in cursor.read_unspent_transactions() {
        hasher.input(&encode_unspent_tx(&unspent_tx?));
    }
    let result = sha256d::Hash::from_engine(hasher);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::double_sha256;
    use crate::memory::MemoryChainStateStorage;

    fn create_test_unspent_tx(seed: u8) -> UnspentTx {
        UnspentTx::new([seed; 32], seed as Height, 0, OutputStates::new(seed as usize % 5 + 1, OutputState::Unspent))
    }

    #[test]
    fn test_empty_set_is_hash_of_nothing() {
        let storage = MemoryChainStateStorage::new();
        let cursor = storage.open_memory_cursor();
        assert_eq!(compute_cursor_hash(&cursor).unwrap(), double_sha256(&[]));
    }

    #[test]
    fn test_matches_double_hash_of_sorted_encodings() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.open_memory_cursor();
        cursor.begin_transaction(false).unwrap();
        cursor.try_add_unspent_tx(&create_test_unspent_tx(8)).unwrap();
        cursor.try_add_unspent_tx(&create_test_unspent_tx(2)).unwrap();

        let mut expected = encode_unspent_tx(&create_test_unspent_tx(2));
        expected.extend(encode_unspent_tx(&create_test_unspent_tx(8)));
        assert_eq!(compute_cursor_hash(&cursor).unwrap(), double_sha256(&expected));
    }

    #[test]
    fn test_output_state_change_changes_commitment() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.open_memory_cursor();
        cursor.begin_transaction(false).unwrap();
        let mut unspent_tx = create_test_unspent_tx(4);
        cursor.try_add_unspent_tx(&unspent_tx).unwrap();
        let before = compute_cursor_hash(&cursor).unwrap();

        unspent_tx.output_states.set(0, OutputState::Spent);
        cursor.try_update_unspent_tx(&unspent_tx).unwrap();
        assert_ne!(compute_cursor_hash(&cursor).unwrap(), before);
    }
}
