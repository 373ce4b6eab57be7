//! Header chains and chain work

use serde::{Deserialize, Serialize};

use crate::error::{display_hash, ChainStateError, Result};
use crate::reorganization::{navigate_towards, NavigationPath};
use crate::types::*;

/// Work represented by a header with compact target `bits`
///
/// work = 2^256 / target, where target = mantissa × 256^(exponent − 3).
/// Saturates at u128::MAX for targets below 2^128; a zero mantissa carries no work.
pub fn calculate_header_work(bits: u32) -> u128 {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007fffff) as u128;
    if mantissa == 0 {
        return 0;
    }

    // 2^256 / (mantissa × 2^(8(e−3))) = 2^(256 − 8(e−3)) / mantissa
    let shift = 256 - 8 * (exponent - 3);
    if shift > 127 {
        return u128::MAX;
    }
    if shift < 0 {
        return 0;
    }
    (1u128 << shift) / mantissa
}

impl ChainedHeader {
    /// Height 0, work of the header alone
    pub fn create_for_genesis(header: BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            total_work: calculate_header_work(header.bits),
            height: 0,
            header,
        }
    }

    /// Chain `header` onto `prev`
    pub fn create_from_prev(prev: &ChainedHeader, header: BlockHeader) -> Result<Self> {
        if header.prev_block_hash != prev.hash {
            return Err(ChainStateError::InvalidChain(format!(
                "header {} does not build on {}",
                display_hash(&header.hash()),
                display_hash(&prev.hash)
            )));
        }

        Ok(Self {
            hash: header.hash(),
            height: prev.height + 1,
            total_work: prev.total_work.saturating_add(calculate_header_work(header.bits)),
            header,
        })
    }
}

/// Chain: 𝒞 = ⟨h₀, h₁, …, hₙ⟩ with hᵢ.height = i and hᵢ.prev = hash(hᵢ₋₁)
///
/// Never empty: element 0 is the genesis header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    blocks: Vec<ChainedHeader>,
}

impl Chain {
    pub fn create_for_genesis(genesis: ChainedHeader) -> Result<Self> {
        Self::from_headers(vec![genesis])
    }

    /// Build a chain from headers in ascending height order
    pub fn from_headers(blocks: Vec<ChainedHeader>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(ChainStateError::InvalidChain("chain has no genesis header".to_string()));
        }

        for (expected_height, header) in blocks.iter().enumerate() {
            if header.height as i64 != expected_height as i64 {
                return Err(ChainStateError::InvalidChain(format!(
                    "header {} at position {} has height {}",
                    display_hash(&header.hash),
                    expected_height,
                    header.height
                )));
            }
        }
        for pair in blocks.windows(2) {
            if pair[1].previous_block_hash() != &pair[0].hash {
                return Err(ChainStateError::InvalidChain(format!(
                    "header {} at height {} does not build on {}",
                    display_hash(&pair[1].hash),
                    pair[1].height,
                    display_hash(&pair[0].hash)
                )));
            }
        }

        Ok(Self { blocks })
    }

    pub fn genesis(&self) -> &ChainedHeader {
        &self.blocks[0]
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> Height {
        self.tip().height
    }

    /// Number of headers, genesis included
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[ChainedHeader] {
        &self.blocks
    }

    pub fn get(&self, height: Height) -> Option<&ChainedHeader> {
        usize::try_from(height).ok().and_then(|index| self.blocks.get(index))
    }

    pub fn contains(&self, chained_header: &ChainedHeader) -> bool {
        self.get(chained_header.height)
            .is_some_and(|header| header.hash == chained_header.hash)
    }

    pub fn total_work(&self) -> u128 {
        self.tip().total_work
    }

    /// Extend the tip by one header
    pub fn add_block(&mut self, chained_header: ChainedHeader) -> Result<()> {
        let tip = self.tip();
        if chained_header.height != tip.height + 1 || chained_header.previous_block_hash() != &tip.hash {
            return Err(ChainStateError::InvalidChain(format!(
                "header {} at height {} does not extend tip {} at height {}",
                display_hash(&chained_header.hash),
                chained_header.height,
                display_hash(&tip.hash),
                tip.height
            )));
        }
        self.blocks.push(chained_header);
        Ok(())
    }

    /// Retract the tip header; the genesis header cannot be removed
    pub fn remove_block(&mut self, chained_header: &ChainedHeader) -> Result<()> {
        if self.blocks.len() == 1 {
            return Err(ChainStateError::InvalidChain("cannot remove the genesis header".to_string()));
        }
        if self.tip().hash != chained_header.hash {
            return Err(ChainStateError::InvalidChain(format!(
                "header {} is not the tip {}",
                display_hash(&chained_header.hash),
                display_hash(&self.tip().hash)
            )));
        }
        self.blocks.pop();
        Ok(())
    }

    /// Steps that turn this chain into `target`
    pub fn navigate_towards<'a>(&'a self, target: &'a Chain) -> Result<NavigationPath<'a>> {
        navigate_towards(self, target)
    }
}
