//! Mapping between sequence positions and quantization groups.
//!
//! A group is the set of positions sharing one scale. The same [`GroupPlan`]
//! drives both the quantizer (which positions to reduce over) and the kernel
//! (which scale to apply to a position), so the two can never disagree.

use crate::core::config::Granularity;
use crate::device::tier::TileShape;

/// Lanes sharing a query warp tile under per-thread quantization.
pub const QUERY_THREAD_LANES: usize = 8;
/// Lanes sharing a key warp tile under per-thread quantization.
pub const KEY_THREAD_LANES: usize = 4;

/// Partition of one `(batch, head)` sequence into scale groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupPlan {
    /// One scale per `block` consecutive positions.
    Block { block: usize },
    /// One scale per `warp` consecutive positions; blocks are whole warps.
    Warp { block: usize, warp: usize },
    /// One scale per lane of each warp tile. Lane `t` owns runs of `run`
    /// positions starting at `8j + run*t` inside the warp tile.
    Thread {
        block: usize,
        warp: usize,
        lanes: usize,
        run: usize,
    },
}

impl GroupPlan {
    /// Plan for Q at `granularity` with tile sizes `tiles`.
    pub fn for_query(granularity: Granularity, tiles: TileShape) -> Self {
        match granularity {
            Granularity::PerBlock => GroupPlan::Block {
                block: tiles.block_q,
            },
            Granularity::PerWarp => GroupPlan::Warp {
                block: tiles.block_q,
                warp: tiles.warp_q,
            },
            Granularity::PerThread => GroupPlan::Thread {
                block: tiles.block_q,
                warp: tiles.warp_q,
                lanes: QUERY_THREAD_LANES,
                run: 1,
            },
        }
    }

    /// Plan for K. Per-warp K shares one scale across the whole key tile.
    pub fn for_key(granularity: Granularity, tiles: TileShape) -> Self {
        match granularity {
            Granularity::PerBlock => GroupPlan::Block {
                block: tiles.block_k,
            },
            Granularity::PerWarp => GroupPlan::Warp {
                block: tiles.block_k,
                warp: tiles.warp_k,
            },
            Granularity::PerThread => GroupPlan::Thread {
                block: tiles.block_k,
                warp: tiles.warp_k,
                lanes: KEY_THREAD_LANES,
                run: 2,
            },
        }
    }

    /// Number of groups covering `seq_len` positions, padded up to whole
    /// blocks. Groups past the end of the sequence hold no real positions.
    pub fn num_groups(&self, seq_len: usize) -> usize {
        match *self {
            GroupPlan::Block { block } => seq_len.div_ceil(block),
            GroupPlan::Warp { block, warp } => seq_len.div_ceil(block) * (block / warp),
            GroupPlan::Thread {
                block,
                warp,
                lanes,
                ..
            } => seq_len.div_ceil(block) * (block / warp) * lanes,
        }
    }

    /// Group owning sequence position `pos`.
    #[inline]
    pub fn group_of(&self, pos: usize) -> usize {
        match *self {
            GroupPlan::Block { block } => pos / block,
            GroupPlan::Warp { warp, .. } => pos / warp,
            GroupPlan::Thread {
                warp, lanes, run, ..
            } => {
                let warp_index = pos / warp;
                let lane = (pos % warp % (lanes * run)) / run;
                warp_index * lanes + lane
            }
        }
    }

    /// Real positions (`< seq_len`) belonging to `group`, ascending.
    pub fn positions(&self, group: usize, seq_len: usize) -> impl Iterator<Item = usize> {
        let (base, repeats, stride, run) = match *self {
            GroupPlan::Block { block } => (group * block, 1, block, block),
            GroupPlan::Warp { warp, .. } => (group * warp, 1, warp, warp),
            GroupPlan::Thread {
                warp, lanes, run, ..
            } => {
                let warp_index = group / lanes;
                let lane = group % lanes;
                let stride = lanes * run;
                (warp_index * warp + lane * run, warp / stride, stride, run)
            }
        };
        (0..repeats)
            .flat_map(move |j| (0..run).map(move |r| base + j * stride + r))
            .filter(move |&pos| pos < seq_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tier::TRITON_TILES;

    const TILES: TileShape = TileShape::new(128, 32, 64, 64);

    #[test]
    fn group_counts_follow_granularity() {
        // ceil(300 / 128) = 3 query blocks, ceil(300 / 64) = 5 key blocks.
        let q = |g| GroupPlan::for_query(g, TILES).num_groups(300);
        let k = |g| GroupPlan::for_key(g, TILES).num_groups(300);
        assert_eq!(q(Granularity::PerBlock), 3);
        assert_eq!(q(Granularity::PerWarp), 3 * 4);
        assert_eq!(q(Granularity::PerThread), 3 * 4 * 8);
        assert_eq!(k(Granularity::PerBlock), 5);
        assert_eq!(k(Granularity::PerWarp), 5);
        assert_eq!(k(Granularity::PerThread), 5 * 4);
    }

    #[test]
    fn query_lanes_interleave_by_eight() {
        let plan = GroupPlan::for_query(Granularity::PerThread, TILES);
        let lane3: Vec<_> = plan.positions(3, 1024).collect();
        assert_eq!(lane3, vec![3, 11, 19, 27]);
        // Second warp of the first block.
        let next: Vec<_> = plan.positions(8, 1024).collect();
        assert_eq!(next, vec![32, 40, 48, 56]);
    }

    #[test]
    fn key_lanes_own_position_pairs() {
        let plan = GroupPlan::for_key(Granularity::PerThread, TILES);
        let lane1: Vec<_> = plan.positions(1, 1024).take(4).collect();
        assert_eq!(lane1, vec![2, 3, 10, 11]);
        assert_eq!(plan.positions(1, 1024).count(), 64 / 4);
    }

    #[test]
    fn positions_and_group_of_agree() {
        let plans = [
            GroupPlan::for_query(Granularity::PerBlock, TRITON_TILES),
            GroupPlan::for_key(Granularity::PerBlock, TRITON_TILES),
            GroupPlan::for_query(Granularity::PerWarp, TILES),
            GroupPlan::for_key(Granularity::PerWarp, TILES),
            GroupPlan::for_query(Granularity::PerThread, TILES),
            GroupPlan::for_key(Granularity::PerThread, TILES),
        ];
        let seq_len = 333;
        for plan in plans {
            let mut covered = vec![0usize; seq_len];
            for group in 0..plan.num_groups(seq_len) {
                for pos in plan.positions(group, seq_len) {
                    assert_eq!(plan.group_of(pos), group, "{plan:?} pos {pos}");
                    covered[pos] += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1), "{plan:?}");
        }
    }

    #[test]
    fn tail_groups_may_be_empty() {
        let plan = GroupPlan::for_query(Granularity::PerThread, TILES);
        // Seven positions: lane 7 of the first warp owns nothing.
        assert_eq!(plan.positions(7, 7).count(), 0);
        assert_eq!(plan.num_groups(7), 4 * 8);
    }
}
