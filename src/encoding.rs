//! Canonical binary encodings for persisted chain-state records
//!
//! Record layouts (all integers little-endian unless noted):
//! - UnspentTx: tx hash (32) ‖ block height (i32) ‖ tx index (i32) ‖ OutputStates
//! - OutputStates: output count (u32) ‖ ⌈count/8⌉ packed bytes, LSB first, 1 = Unspent
//! - Spent-tx journal: count (u32) ‖ hash (32)*
//! - Unminted-tx journal: count (u32) ‖ (tx hash (32) ‖ count (u32) ‖ BlockTxKey*)*
//! - BlockTxKey: block hash (32) ‖ block height (i32) ‖ tx index (i32)
//! - Chained header: header (80) ‖ height (i32) ‖ total work (u128); keyed by big-endian height
//!
//! Transactions and headers are hashed over their Bitcoin wire encoding.

use sha2::{Digest, Sha256};

use crate::constants::BLOCK_HEADER_SIZE;
use crate::error::{ChainStateError, Result};
use crate::types::*;

/// SHA256(SHA256(x))
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Transaction hash over the wire encoding
pub fn calculate_tx_hash(tx: &Transaction) -> Hash {
    double_sha256(&encode_transaction(tx))
}

/// Block hash over the 80-byte header
pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    double_sha256(&encode_block_header(header))
}

/// Merkle root of a block's transaction hashes, duplicating the last hash on odd levels
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    let mut level: Vec<Hash> = transactions.iter().map(calculate_tx_hash).collect();
    if level.is_empty() {
        return [0u8; 32];
    }

    while level.len() > 1 {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&pair[0]);
            combined[32..].copy_from_slice(right);
            next_level.push(double_sha256(&combined));
        }
        level = next_level;
    }

    level[0]
}

// ============================================================================
// WIRE ENCODING
// ============================================================================

pub fn encode_block_header(header: &BlockHeader) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(BLOCK_HEADER_SIZE);
    bytes.extend_from_slice(&header.version.to_le_bytes());
    bytes.extend_from_slice(&header.prev_block_hash);
    bytes.extend_from_slice(&header.merkle_root);
    bytes.extend_from_slice(&header.timestamp.to_le_bytes());
    bytes.extend_from_slice(&header.bits.to_le_bytes());
    bytes.extend_from_slice(&header.nonce.to_le_bytes());
    bytes
}

#[cfg(test)]
fn decode_block_header(bytes: &[u8]) -> Result<BlockHeader> {
    let mut reader = ByteReader::new(bytes);
    let header = read_block_header(&mut reader)?;
    reader.finish("block header")?;
    Ok(header)
}

fn read_block_header(reader: &mut ByteReader<'_>) -> Result<BlockHeader> {
    Ok(BlockHeader {
        version: reader.read_i32()?,
        prev_block_hash: reader.read_hash()?,
        merkle_root: reader.read_hash()?,
        timestamp: reader.read_u32()?,
        bits: reader.read_u32()?,
        nonce: reader.read_u32()?,
    })
}

pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&tx.version.to_le_bytes());

    write_compact_size(&mut bytes, tx.inputs.len() as u64);
    for input in &tx.inputs {
        bytes.extend_from_slice(&input.prevout.hash);
        bytes.extend_from_slice(&input.prevout.index.to_le_bytes());
        write_compact_size(&mut bytes, input.script_sig.len() as u64);
        bytes.extend_from_slice(&input.script_sig);
        bytes.extend_from_slice(&input.sequence.to_le_bytes());
    }

    write_compact_size(&mut bytes, tx.outputs.len() as u64);
    for output in &tx.outputs {
        bytes.extend_from_slice(&output.value.to_le_bytes());
        write_compact_size(&mut bytes, output.script_pubkey.len() as u64);
        bytes.extend_from_slice(&output.script_pubkey);
    }

    bytes.extend_from_slice(&tx.lock_time.to_le_bytes());
    bytes
}

#[cfg(test)]
fn decode_transaction(bytes: &[u8]) -> Result<Transaction> {
    let mut reader = ByteReader::new(bytes);
    let version = reader.read_i32()?;

    let input_count = reader.read_compact_size()?;
    let mut inputs = Vec::with_capacity(reader.bounded_capacity(input_count, 41));
    for _ in 0..input_count {
        let hash = reader.read_hash()?;
        let index = reader.read_u32()?;
        let script_len = reader.read_compact_size()?;
        let script_sig = reader.read_bytes(script_len)?.to_vec();
        let sequence = reader.read_u32()?;
        inputs.push(TransactionInput {
            prevout: OutPoint { hash, index },
            script_sig,
            sequence,
        });
    }

    let output_count = reader.read_compact_size()?;
    let mut outputs = Vec::with_capacity(reader.bounded_capacity(output_count, 9));
    for _ in 0..output_count {
        let value = reader.read_i64()?;
        let script_len = reader.read_compact_size()?;
        let script_pubkey = reader.read_bytes(script_len)?.to_vec();
        outputs.push(TransactionOutput { value, script_pubkey });
    }

    let lock_time = reader.read_u32()?;
    reader.finish("transaction")?;

    Ok(Transaction { version, inputs, outputs, lock_time })
}

fn write_compact_size(bytes: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => bytes.push(value as u8),
        0xfd..=0xffff => {
            bytes.push(0xfd);
            bytes.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            bytes.push(0xfe);
            bytes.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            bytes.push(0xff);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
}

// ============================================================================
// STORE RECORDS
// ============================================================================

/// Chain table key: big-endian so byte order matches height order
pub fn encode_height_key(height: Height) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

pub fn encode_output_states(states: &OutputStates, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&(states.len() as u32).to_le_bytes());
    bytes.extend_from_slice(states.packed());
}

fn read_output_states(reader: &mut ByteReader<'_>) -> Result<OutputStates> {
    let length = reader.read_u32()? as usize;
    let packed = reader.read_bytes(length.div_ceil(8) as u64)?.to_vec();
    OutputStates::from_packed(length, packed)
        .ok_or_else(|| ChainStateError::Serialization("output states padding bits set".to_string()))
}

pub fn encode_unspent_tx(unspent_tx: &UnspentTx) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(44 + unspent_tx.output_states.packed().len());
    bytes.extend_from_slice(&unspent_tx.tx_hash);
    bytes.extend_from_slice(&unspent_tx.block_height.to_le_bytes());
    bytes.extend_from_slice(&unspent_tx.tx_index.to_le_bytes());
    encode_output_states(&unspent_tx.output_states, &mut bytes);
    bytes
}

pub fn decode_unspent_tx(bytes: &[u8]) -> Result<UnspentTx> {
    let mut reader = ByteReader::new(bytes);
    let unspent_tx = UnspentTx {
        tx_hash: reader.read_hash()?,
        block_height: reader.read_i32()?,
        tx_index: reader.read_i32()?,
        output_states: read_output_states(&mut reader)?,
    };
    reader.finish("unspent tx")?;
    Ok(unspent_tx)
}

pub fn encode_spent_txes(spent_txes: &[Hash]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + spent_txes.len() * 32);
    bytes.extend_from_slice(&(spent_txes.len() as u32).to_le_bytes());
    for tx_hash in spent_txes {
        bytes.extend_from_slice(tx_hash);
    }
    bytes
}

pub fn decode_spent_txes(bytes: &[u8]) -> Result<Vec<Hash>> {
    let mut reader = ByteReader::new(bytes);
    let count = reader.read_u32()? as u64;
    let mut spent_txes = Vec::with_capacity(reader.bounded_capacity(count, 32));
    for _ in 0..count {
        spent_txes.push(reader.read_hash()?);
    }
    reader.finish("spent tx journal")?;
    Ok(spent_txes)
}

pub fn encode_unminted_txes(unminted_txes: &[UnmintedTx]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(unminted_txes.len() as u32).to_le_bytes());
    for unminted_tx in unminted_txes {
        bytes.extend_from_slice(&unminted_tx.tx_hash);
        bytes.extend_from_slice(&(unminted_tx.prev_output_tx_keys.len() as u32).to_le_bytes());
        for key in &unminted_tx.prev_output_tx_keys {
            bytes.extend_from_slice(&key.block_hash);
            bytes.extend_from_slice(&key.block_height.to_le_bytes());
            bytes.extend_from_slice(&key.tx_index.to_le_bytes());
        }
    }
    bytes
}

pub fn decode_unminted_txes(bytes: &[u8]) -> Result<Vec<UnmintedTx>> {
    let mut reader = ByteReader::new(bytes);
    let count = reader.read_u32()? as u64;
    let mut unminted_txes = Vec::with_capacity(reader.bounded_capacity(count, 36));
    for _ in 0..count {
        let tx_hash = reader.read_hash()?;
        let key_count = reader.read_u32()? as u64;
        let mut prev_output_tx_keys = Vec::with_capacity(reader.bounded_capacity(key_count, 40));
        for _ in 0..key_count {
            prev_output_tx_keys.push(BlockTxKey {
                block_hash: reader.read_hash()?,
                block_height: reader.read_i32()?,
                tx_index: reader.read_i32()?,
            });
        }
        unminted_txes.push(UnmintedTx { tx_hash, prev_output_tx_keys });
    }
    reader.finish("unminted tx journal")?;
    Ok(unminted_txes)
}

pub fn encode_chained_header(chained_header: &ChainedHeader) -> Vec<u8> {
    let mut bytes = encode_block_header(&chained_header.header);
    bytes.extend_from_slice(&chained_header.height.to_le_bytes());
    bytes.extend_from_slice(&chained_header.total_work.to_le_bytes());
    bytes
}

pub fn decode_chained_header(bytes: &[u8]) -> Result<ChainedHeader> {
    let mut reader = ByteReader::new(bytes);
    let header = read_block_header(&mut reader)?;
    let height = reader.read_i32()?;
    let total_work = u128::from_le_bytes(reader.read_array::<16>()?);
    reader.finish("chained header")?;

    Ok(ChainedHeader {
        hash: calculate_block_hash(&header),
        header,
        height,
        total_work,
    })
}

// ============================================================================
// READER
// ============================================================================

/// Bounds-checked cursor over an encoded record
struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn read_bytes(&mut self, len: u64) -> Result<&'a [u8]> {
        let remaining = self.bytes.len() - self.position;
        if len > remaining as u64 {
            return Err(ChainStateError::Serialization(format!(
                "unexpected end of data: wanted {} bytes at offset {}, {} remain",
                len, self.position, remaining
            )));
        }
        let start = self.position;
        self.position += len as usize;
        Ok(&self.bytes[start..self.position])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N as u64)?);
        Ok(array)
    }

    fn read_hash(&mut self) -> Result<Hash> {
        self.read_array::<32>()
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array::<4>()?))
    }

    #[cfg(test)]
    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    #[cfg(test)]
    fn read_compact_size(&mut self) -> Result<u64> {
        let prefix = self.read_array::<1>()?[0];
        Ok(match prefix {
            0xfd => u16::from_le_bytes(self.read_array::<2>()?) as u64,
            0xfe => u32::from_le_bytes(self.read_array::<4>()?) as u64,
            0xff => u64::from_le_bytes(self.read_array::<8>()?),
            small => small as u64,
        })
    }

    /// Caps a pre-allocation by what the remaining bytes could possibly hold
    fn bounded_capacity(&self, count: u64, min_item_size: usize) -> usize {
        let remaining = (self.bytes.len() - self.position) / min_item_size.max(1);
        count.min(remaining as u64) as usize
    }

    fn finish(&self, record: &str) -> Result<()> {
        if self.position != self.bytes.len() {
            return Err(ChainStateError::Serialization(format!(
                "{} trailing bytes after {}",
                self.bytes.len() - self.position,
                record
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: [7; 32], index: 3 },
                script_sig: vec![0x51; 300],
                sequence: 0xfffffffe,
            }],
            outputs: vec![TransactionOutput { value: 12_345, script_pubkey: vec![0x76, 0xa9] }],
            lock_time: 17,
        }
    }

    #[test]
    fn test_transaction_wire_roundtrip_with_large_script() {
        let tx = create_test_tx();
        let bytes = encode_transaction(&tx);
        // 300-byte script needs the 0xfd compact size prefix
        assert_eq!(bytes[4 + 1 + 32 + 4], 0xfd);
        assert_eq!(decode_transaction(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_block_header_is_80_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [1; 32],
            merkle_root: [2; 32],
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        };
        let bytes = encode_block_header(&header);
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        assert_eq!(decode_block_header(&bytes).unwrap(), header);
    }

    #[test]
    fn test_genesis_block_hash() {
        // Bitcoin mainnet genesis header
        let mut merkle_root = [0u8; 32];
        hex::decode_to_slice(
            "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
            &mut merkle_root,
        )
        .unwrap();
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root,
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        };
        let mut hash = calculate_block_hash(&header);
        hash.reverse();
        assert_eq!(
            hex::encode(hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_unspent_tx_layout() {
        let mut states = OutputStates::new(10, OutputState::Unspent);
        states.set(0, OutputState::Spent);
        let unspent_tx = UnspentTx::new([9; 32], 5, 2, states);

        let bytes = encode_unspent_tx(&unspent_tx);
        assert_eq!(&bytes[..32], &[9; 32]);
        assert_eq!(&bytes[32..36], &5i32.to_le_bytes());
        assert_eq!(&bytes[36..40], &2i32.to_le_bytes());
        assert_eq!(&bytes[40..44], &10u32.to_le_bytes());
        assert_eq!(&bytes[44..], &[0xfe, 0x03]);
        assert_eq!(decode_unspent_tx(&bytes).unwrap(), unspent_tx);
    }

    #[test]
    fn test_decode_unspent_tx_rejects_truncation() {
        let unspent_tx = UnspentTx::new([1; 32], 0, 0, OutputStates::new(3, OutputState::Unspent));
        let bytes = encode_unspent_tx(&unspent_tx);
        let result = decode_unspent_tx(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ChainStateError::Serialization(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode_spent_txes(&[[1; 32]]);
        bytes.push(0);
        assert!(decode_spent_txes(&bytes).is_err());
    }

    #[test]
    fn test_unminted_journal_nested_counts() {
        let unminted = vec![
            UnmintedTx { tx_hash: [1; 32], prev_output_tx_keys: vec![] },
            UnmintedTx {
                tx_hash: [2; 32],
                prev_output_tx_keys: vec![
                    BlockTxKey { block_hash: [3; 32], block_height: 4, tx_index: 0 },
                    BlockTxKey { block_hash: [5; 32], block_height: 6, tx_index: 7 },
                ],
            },
        ];
        let bytes = encode_unminted_txes(&unminted);
        assert_eq!(bytes.len(), 4 + (32 + 4) + (32 + 4 + 2 * 40));
        assert_eq!(decode_unminted_txes(&bytes).unwrap(), unminted);
    }

    #[test]
    fn test_height_key_orders_bytes_like_heights() {
        assert!(encode_height_key(255) < encode_height_key(256));
        assert_eq!(encode_height_key(70_000), [0x00, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_merkle_root_single_tx_is_tx_hash() {
        let tx = create_test_tx();
        assert_eq!(calculate_merkle_root(std::slice::from_ref(&tx)), tx.hash());
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let tx1 = create_test_tx();
        let mut tx2 = create_test_tx();
        tx2.lock_time = 99;
        let three = calculate_merkle_root(&[tx1.clone(), tx2.clone(), tx2.clone()]);
        let four = calculate_merkle_root(&[tx1.clone(), tx2.clone(), tx2.clone(), tx2.clone()]);
        assert_eq!(three, four);
        assert_ne!(calculate_merkle_root(&[tx1.clone(), tx2.clone()]), calculate_merkle_root(&[tx2, tx1]));
    }
}
