//! Chain reorganization functions: fork-point search and navigation between chains

use crate::chain::Chain;
use crate::error::{display_hash, ChainStateError, Result};
use crate::types::*;

/// One navigation step: remove (Backward) or add (Forward) a single header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationStep {
    pub direction: ReplayDirection,
    pub header: ChainedHeader,
}

/// Find the highest header shared by `source` and `target`
///
/// 1. Start at the lower of the two tip heights
/// 2. Walk down until both chains hold the same hash at that height
/// 3. Reaching below genesis means the chains are disjoint
pub fn find_common_ancestor<'a>(source: &'a Chain, target: &Chain) -> Result<&'a ChainedHeader> {
    let mut height = source.height().min(target.height());

    while height >= 0 {
        match (source.get(height), target.get(height)) {
            (Some(a), Some(b)) if a.hash == b.hash => return Ok(a),
            _ => height -= 1,
        }
    }

    Err(ChainStateError::MissingCommonAncestor(format!(
        "chains rooted at {} and {} share no header",
        display_hash(&source.genesis().hash),
        display_hash(&target.genesis().hash)
    )))
}

/// Navigation: source → target
///
/// Yields every source header above the fork point in descending height
/// order (Backward), then every target header above the fork point in
/// ascending height order (Forward). Applying the steps in yielded order
/// keeps the chain contiguous after each one; identical chains yield nothing.
pub fn navigate_towards<'a>(source: &'a Chain, target: &'a Chain) -> Result<NavigationPath<'a>> {
    let common_ancestor = find_common_ancestor(source, target)?;
    let fork_height = common_ancestor.height;

    Ok(NavigationPath {
        source,
        target,
        common_ancestor,
        next_removal: source.height(),
        next_addition: fork_height + 1,
    })
}

/// Lazy step sequence produced by [`navigate_towards`]
#[derive(Debug, Clone)]
pub struct NavigationPath<'a> {
    source: &'a Chain,
    target: &'a Chain,
    common_ancestor: &'a ChainedHeader,
    next_removal: Height,
    next_addition: Height,
}

impl<'a> NavigationPath<'a> {
    pub fn common_ancestor(&self) -> &'a ChainedHeader {
        self.common_ancestor
    }
}

impl Iterator for NavigationPath<'_> {
    type Item = NavigationStep;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_removal > self.common_ancestor.height {
            let header = self.source.get(self.next_removal)?.clone();
            self.next_removal -= 1;
            return Some(NavigationStep { direction: ReplayDirection::Backward, header });
        }

        if self.next_addition <= self.target.height() {
            let header = self.target.get(self.next_addition)?.clone();
            self.next_addition += 1;
            return Some(NavigationStep { direction: ReplayDirection::Forward, header });
        }

        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let removals = (self.next_removal - self.common_ancestor.height).max(0) as usize;
        let additions = (self.target.height() - self.next_addition + 1).max(0) as usize;
        (removals + additions, Some(removals + additions))
    }
}

impl ExactSizeIterator for NavigationPath<'_> {}

/// Check if reorganization is beneficial
///
/// Switch only when the candidate carries strictly more cumulative work.
pub fn should_reorganize(current: &Chain, candidate: &Chain) -> bool {
    candidate.total_work() > current.total_work()
}

// ============================================================================
// TYPES
// ============================================================================

/// Result of chain reorganization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorganizationResult {
    pub common_ancestor: ChainedHeader,
    /// Removed headers, newest first
    pub disconnected_blocks: Vec<ChainedHeader>,
    /// Added headers, oldest first
    pub connected_blocks: Vec<ChainedHeader>,
    pub reorganization_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_header(prev_block_hash: Hash, nonce: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash,
            merkle_root: [0; 32],
            timestamp: 1_600_000_000,
            bits,
            nonce,
        }
    }

    fn create_test_genesis() -> Chain {
        Chain::create_for_genesis(ChainedHeader::create_for_genesis(create_test_header([0; 32], 0, 0x207fffff))).unwrap()
    }

    fn extend(chain: &Chain, count: u32, nonce_base: u32, bits: u32) -> Chain {
        let mut chain = chain.clone();
        for nonce in nonce_base..nonce_base + count {
            let header = create_test_header(chain.tip().hash, nonce, bits);
            let next = ChainedHeader::create_from_prev(chain.tip(), header).unwrap();
            chain.add_block(next).unwrap();
        }
        chain
    }

    fn apply_steps(chain: &Chain, steps: &[NavigationStep]) -> Chain {
        let mut chain = chain.clone();
        for step in steps {
            match step.direction {
                ReplayDirection::Backward => chain.remove_block(&step.header).unwrap(),
                ReplayDirection::Forward => chain.add_block(step.header.clone()).unwrap(),
            }
        }
        chain
    }

    #[test]
    fn test_navigate_identical_chains_is_empty() {
        let chain = extend(&create_test_genesis(), 3, 1, 0x207fffff);
        let path = navigate_towards(&chain, &chain).unwrap();
        assert_eq!(path.len(), 0);
        assert_eq!(path.common_ancestor().height, 3);
    }

    #[test]
    fn test_navigate_fork_orders_removals_then_additions() {
        let base = extend(&create_test_genesis(), 2, 1, 0x207fffff);
        let source = extend(&base, 3, 100, 0x207fffff);
        let target = extend(&base, 2, 200, 0x207fffff);

        let steps: Vec<_> = navigate_towards(&source, &target).unwrap().collect();
        let heights: Vec<_> = steps.iter().map(|s| (s.direction.as_i32(), s.header.height)).collect();
        assert_eq!(heights, vec![(-1, 5), (-1, 4), (-1, 3), (1, 3), (1, 4)]);
        assert_eq!(apply_steps(&source, &steps), target);
    }

    #[test]
    fn test_navigate_to_ancestor_only_removes() {
        let base = extend(&create_test_genesis(), 2, 1, 0x207fffff);
        let source = extend(&base, 2, 10, 0x207fffff);
        let steps: Vec<_> = navigate_towards(&source, &base).unwrap().collect();
        assert!(steps.iter().all(|s| s.direction == ReplayDirection::Backward));
        assert_eq!(apply_steps(&source, &steps), base);
    }

    #[test]
    fn test_disjoint_chains_have_no_common_ancestor() {
        let a = create_test_genesis();
        let b = Chain::create_for_genesis(ChainedHeader::create_for_genesis(create_test_header([1; 32], 0, 0x207fffff))).unwrap();
        assert!(matches!(navigate_towards(&a, &b), Err(ChainStateError::MissingCommonAncestor(_))));
    }

    #[test]
    fn test_should_reorganize_by_work_not_length() {
        let base = create_test_genesis();
        let long_easy = extend(&base, 3, 1, 0x207fffff);
        let short_hard = extend(&base, 1, 50, 0x1f00ffff);
        assert!(should_reorganize(&long_easy, &short_hard));
        assert!(!should_reorganize(&short_hard, &long_easy));
        assert!(!should_reorganize(&long_easy, &long_easy));
    }
}
