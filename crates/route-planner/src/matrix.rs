//! Block-major distance matrix and the Floyd-Warshall block kernel
//!
//! The matrix is padded to a multiple of [`BLOCK_SIZE`] in both dimensions and
//! stored row-major over blocks, row-major over cells within each block, so
//! every block occupies one contiguous run of `BLOCK_SIZE²` cells.

use crate::NodeId;

/// Side length of a matrix block
pub const BLOCK_SIZE: usize = 16;

pub(crate) const BLOCK_CELLS: usize = BLOCK_SIZE * BLOCK_SIZE;

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub(crate) struct Cell {
    pub weight: f32,
    pub next: NodeId,
}

/// Geometry of a padded, block-major matrix
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    /// Blocks per matrix row
    pub blocks: usize,
}

impl Layout {
    pub fn for_nodes(nodes: usize) -> Self {
        Self {
            blocks: nodes.div_ceil(BLOCK_SIZE),
        }
    }

    /// Side length of the padded matrix
    pub fn padded(&self) -> usize {
        self.blocks * BLOCK_SIZE
    }

    pub fn cell_count(&self) -> usize {
        self.padded() * self.padded()
    }

    /// Offset of the first cell of block (`bi`, `bj`)
    #[inline]
    pub fn block_offset(&self, bi: usize, bj: usize) -> usize {
        (bi * self.blocks + bj) * BLOCK_CELLS
    }

    /// Offset of cell (`i`, `j`)
    #[inline]
    pub fn index(&self, i: usize, j: usize) -> usize {
        self.block_offset(i / BLOCK_SIZE, j / BLOCK_SIZE) + (i % BLOCK_SIZE) * BLOCK_SIZE + j % BLOCK_SIZE
    }
}

/// Relax block (`bi`, `bj`) through every intermediate node of pivot block `round`.
///
/// # Safety
///
/// `cells` must point to a matrix with `layout`'s geometry, and no other thread
/// may write to block (`bi`, `round`), (`round`, `bj`) or (`bi`, `bj`) unless it is
/// this call's own block.
#[inline]
pub(crate) unsafe fn relax_block(cells: *mut Cell, layout: Layout, round: usize, bi: usize, bj: usize) {
    let ij = layout.block_offset(bi, bj);
    let ik = layout.block_offset(bi, round);
    let kj = layout.block_offset(round, bj);

    for k in 0..BLOCK_SIZE {
        for i in 0..BLOCK_SIZE {
            let via = *cells.add(ik + i * BLOCK_SIZE + k);
            if via.weight == f32::INFINITY {
                continue;
            }
            for j in 0..BLOCK_SIZE {
                let tail = *cells.add(kj + k * BLOCK_SIZE + j);
                let sum = via.weight + tail.weight;
                let target = &mut *cells.add(ij + i * BLOCK_SIZE + j);
                if sum < target.weight {
                    target.weight = sum;
                    target.next = via.next;
                }
            }
        }
    }
}

/// A rectangle of blocks, all of which may be relaxed independently
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl Chunk {
    pub fn new(rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Self {
        Self {
            row_start: rows.start,
            row_end: rows.end,
            col_start: cols.start,
            col_end: cols.end,
        }
    }

    fn width(&self) -> usize {
        self.col_end.saturating_sub(self.col_start)
    }

    pub fn len(&self) -> usize {
        self.row_end.saturating_sub(self.row_start) * self.width()
    }

    /// Block coordinates of the `n`th block in row-major order
    #[inline]
    pub fn block(&self, n: usize) -> (usize, usize) {
        let width = self.width();
        (self.row_start + n / width, self.col_start + n % width)
    }
}

/// The chunks of one round in dependency order: the pivot, the four singly
/// dependent strips (above, left, right, below), then the four doubly
/// dependent quadrants.
pub(crate) fn round_chunks(round: usize, blocks: usize) -> [Chunk; 9] {
    let r = round;
    let after = r + 1;
    [
        Chunk::new(r..after, r..after),
        Chunk::new(0..r, r..after),
        Chunk::new(r..after, 0..r),
        Chunk::new(r..after, after..blocks),
        Chunk::new(after..blocks, r..after),
        Chunk::new(0..r, 0..r),
        Chunk::new(0..r, after..blocks),
        Chunk::new(after..blocks, 0..r),
        Chunk::new(after..blocks, after..blocks),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_contiguous() {
        let layout = Layout::for_nodes(40);
        assert_eq!(layout.blocks, 3);
        assert_eq!(layout.padded(), 48);

        for bi in 0..layout.blocks {
            for bj in 0..layout.blocks {
                let base = layout.block_offset(bi, bj);
                for i in 0..BLOCK_SIZE {
                    for j in 0..BLOCK_SIZE {
                        let idx = layout.index(bi * BLOCK_SIZE + i, bj * BLOCK_SIZE + j);
                        assert!(idx >= base && idx < base + BLOCK_CELLS);
                    }
                }
            }
        }
        assert_eq!(layout.index(47, 47), layout.cell_count() - 1);
    }

    #[test]
    fn test_round_chunks_cover_matrix_once() {
        let blocks = 5;
        for round in 0..blocks {
            let mut hits = vec![0; blocks * blocks];
            for chunk in round_chunks(round, blocks) {
                for n in 0..chunk.len() {
                    let (bi, bj) = chunk.block(n);
                    hits[bi * blocks + bj] += 1;
                }
            }
            assert!(hits.iter().all(|&h| h == 1), "round {}", round);
        }
    }

    #[test]
    fn test_empty_chunks() {
        let chunks = round_chunks(0, 1);
        assert_eq!(chunks[0].len(), 1);
        assert!(chunks[1..].iter().all(|c| c.len() == 0));
    }
}
