//! Two-level chunk/block tiling of an N-D logical array. A compiled
//! expression carries one [`NdLayout`]; each `eval_nd` call addresses one
//! block by `(nchunk, nblock)` and sees it at its padded size, with the
//! valid (non-padding) extent reported separately.

use std::{error, fmt};

use smallvec::SmallVec;

use crate::error::EvalError;
use crate::eval::IndexBlock;

pub(crate) const MAX_RANK: usize = 8;

type Dims = SmallVec<[usize; 8]>;

#[derive(Debug, Clone)]
pub struct LayoutError(String);

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid layout: {}", self.0)
    }
}

impl error::Error for LayoutError {}

/// Shape, chunk-shape and block-shape of the logical array, with the
/// derived per-dimension chunk and block counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdLayout {
    shape: Dims,
    chunk: Dims,
    block: Dims,
    chunks_per_dim: Dims,
    blocks_per_chunk: Dims,
}

impl NdLayout {
    /// Validates `1 ≤ rank ≤ 8` and, per dimension,
    /// `shape ≥ 1` and `chunk ≥ block ≥ 1`.
    pub fn new(shape: &[usize], chunk: &[usize], block: &[usize]) -> Result<Self, LayoutError> {
        let rank = shape.len();
        if rank == 0 || rank > MAX_RANK {
            return Err(LayoutError(format!("rank {rank} outside 1..=8")));
        }
        if chunk.len() != rank || block.len() != rank {
            return Err(LayoutError("shape, chunk and block rank differ".into()));
        }
        for d in 0..rank {
            if shape[d] == 0 {
                return Err(LayoutError(format!("shape[{d}] is zero")));
            }
            if block[d] == 0 || chunk[d] < block[d] {
                return Err(LayoutError(format!(
                    "dimension {d} needs chunk ≥ block ≥ 1, got chunk={} block={}",
                    chunk[d], block[d]
                )));
            }
        }
        let chunks_per_dim = (0..rank).map(|d| shape[d].div_ceil(chunk[d])).collect();
        let blocks_per_chunk = (0..rank).map(|d| chunk[d].div_ceil(block[d])).collect();
        Ok(Self {
            shape: shape.into(),
            chunk: chunk.into(),
            block: block.into(),
            chunks_per_dim,
            blocks_per_chunk,
        })
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk
    }

    #[must_use]
    pub fn block_shape(&self) -> &[usize] {
        &self.block
    }

    /// Total number of chunks tiling the shape.
    #[must_use]
    pub fn nchunks(&self) -> usize {
        self.chunks_per_dim.iter().product()
    }

    /// Blocks tiling one chunk.
    #[must_use]
    pub fn nblocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk.iter().product()
    }

    /// Padded element count of every block.
    #[must_use]
    pub fn block_nitems(&self) -> usize {
        self.block.iter().product()
    }

    /// Resolves a `(nchunk, nblock)` pair to its padded region.
    pub fn region(&self, nchunk: usize, nblock: usize) -> Result<BlockRegion, EvalError> {
        if nchunk >= self.nchunks() || nblock >= self.nblocks_per_chunk() {
            return Err(EvalError::ShapeMismatch(format!(
                "block index ({nchunk}, {nblock}) outside ({}, {})",
                self.nchunks(),
                self.nblocks_per_chunk()
            )));
        }
        let rank = self.rank();
        let cd = decompose(nchunk, &self.chunks_per_dim);
        let bd = decompose(nblock, &self.blocks_per_chunk);
        let mut global_start = Dims::new();
        let mut valid = Dims::new();
        for d in 0..rank {
            let chunk_start = cd[d] * self.chunk[d];
            let chunk_len = self.chunk[d].min(self.shape[d] - chunk_start);
            let block_start = bd[d] * self.block[d];
            valid.push(self.block[d].min(chunk_len.saturating_sub(block_start)));
            global_start.push(chunk_start + block_start);
        }
        Ok(BlockRegion {
            shape: self.shape.clone(),
            block: self.block.clone(),
            global_start,
            valid,
        })
    }
}

/// Row-major decomposition of a linear index over per-dimension counts.
fn decompose(mut index: usize, counts: &[usize]) -> Dims {
    let mut out: Dims = smallvec::smallvec![0; counts.len()];
    for d in (0..counts.len()).rev() {
        out[d] = index % counts[d];
        index /= counts[d];
    }
    out
}

/// One padded block with its position in the global array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRegion {
    shape: Dims,
    /// Padded block extents
    block: Dims,
    /// Global start coordinate per dimension
    global_start: Dims,
    /// Non-padding extent per dimension; zero when the block lies fully
    /// outside the shape along some dimension
    valid: Dims,
}

impl BlockRegion {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn valid_extent(&self) -> &[usize] {
        &self.valid
    }

    #[must_use]
    pub fn global_start(&self) -> &[usize] {
        &self.global_start
    }

    /// Padded block extents.
    #[must_use]
    pub fn block_shape(&self) -> &[usize] {
        &self.block
    }

    /// Elements a consumer may trust: the product of the valid extents.
    #[must_use]
    pub fn valid_nitems(&self) -> usize {
        self.valid.iter().product()
    }

    /// Padded element count presented to the kernel.
    #[must_use]
    pub fn nitems(&self) -> usize {
        self.block.iter().product()
    }

    /// Block-local coordinates of padded position `p`, row-major.
    fn local(&self, p: usize) -> Dims {
        decompose(p, &self.block)
    }

    /// Whether padded position `p` lies inside the valid extent.
    pub(crate) fn is_valid_pos(&self, p: usize) -> bool {
        self.local(p)
            .iter()
            .zip(&self.valid)
            .all(|(l, v)| l < v)
    }

    /// Materialises the reserved index columns for padded positions
    /// `base .. base + len`.
    pub(crate) fn index_block(&self, base: usize, len: usize) -> IndexBlock {
        let rank = self.rank();
        let mut dims: SmallVec<[Vec<i64>; 2]> = SmallVec::new();
        for _ in 0..rank {
            dims.push(Vec::with_capacity(len));
        }
        let mut flat = Vec::with_capacity(len);
        // row-major strides over the global shape
        let mut stride: Dims = smallvec::smallvec![1; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            stride[d] = stride[d + 1] * self.shape[d + 1];
        }
        for p in base..base + len {
            let local = self.local(p);
            let mut linear = 0i64;
            for d in 0..rank {
                dims[d].push(local[d] as i64);
                linear += ((self.global_start[d] + local[d]) * stride[d]) as i64;
            }
            flat.push(linear);
        }
        IndexBlock {
            rank,
            shape: self.shape.iter().map(|&s| s as i64).collect(),
            dims,
            flat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_layouts() {
        assert!(NdLayout::new(&[], &[], &[]).is_err());
        assert!(NdLayout::new(&[1; 9], &[1; 9], &[1; 9]).is_err());
        assert!(NdLayout::new(&[4, 4], &[2, 2], &[3, 1]).is_err());
        assert!(NdLayout::new(&[4, 0], &[2, 2], &[1, 1]).is_err());
        assert!(NdLayout::new(&[4], &[2, 2], &[1, 1]).is_err());
    }

    #[test]
    fn counts() {
        let l = NdLayout::new(&[50, 60, 70], &[50, 60, 70], &[18, 20, 24]).unwrap();
        assert_eq!(l.nchunks(), 1);
        assert_eq!(l.nblocks_per_chunk(), 3 * 3 * 3);
        assert_eq!(l.block_nitems(), 18 * 20 * 24);
    }

    #[test]
    fn full_and_truncated_blocks() {
        let l = NdLayout::new(&[50, 60, 70], &[50, 60, 70], &[18, 20, 24]).unwrap();
        let first = l.region(0, 0).unwrap();
        assert_eq!(first.valid_nitems(), 18 * 20 * 24);
        // last block along every dimension
        let last = l.region(0, 26).unwrap();
        assert_eq!(last.valid_extent(), &[50 - 36, 60 - 40, 70 - 48]);
        assert_eq!(last.valid_nitems(), 14 * 20 * 22);
        assert_eq!(last.global_start(), &[36, 40, 48]);
    }

    #[test]
    fn chunk_boundary_padding() {
        // shape does not divide into chunks; the final chunk is short
        let l = NdLayout::new(&[10], &[8], &[4]).unwrap();
        assert_eq!(l.nchunks(), 2);
        assert_eq!(l.nblocks_per_chunk(), 2);
        // last chunk holds 2 valid elements in its first block
        let r = l.region(1, 0).unwrap();
        assert_eq!(r.valid_extent(), &[2]);
        // and none in its second
        let r = l.region(1, 1).unwrap();
        assert_eq!(r.valid_nitems(), 0);
        assert!(l.region(2, 0).is_err());
    }

    #[test]
    fn closed_form_valid_nitems() {
        let l = NdLayout::new(&[7, 5], &[4, 5], &[3, 2]).unwrap();
        for nchunk in 0..l.nchunks() {
            for nblock in 0..l.nblocks_per_chunk() {
                let r = l.region(nchunk, nblock).unwrap();
                let cd = super::decompose(nchunk, &l.chunks_per_dim);
                let bd = super::decompose(nblock, &l.blocks_per_chunk);
                let expect: usize = (0..2)
                    .map(|d| {
                        let start = cd[d] * l.chunk[d] + bd[d] * l.block[d];
                        l.block[d].min(l.shape[d].saturating_sub(start))
                            .min((l.chunk[d] * (cd[d] + 1)).saturating_sub(start).min(l.block[d]))
                    })
                    .product();
                assert_eq!(r.valid_nitems(), expect, "chunk {nchunk} block {nblock}");
            }
        }
    }

    #[test]
    fn index_columns() {
        let l = NdLayout::new(&[4, 6], &[4, 6], &[2, 3]).unwrap();
        // second block row-major: starts at (0, 3)
        let r = l.region(0, 1).unwrap();
        let idx = r.index_block(0, r.nitems());
        assert_eq!(idx.rank, 2);
        assert_eq!(&idx.shape[..], &[4, 6]);
        assert_eq!(idx.dims[0], vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(idx.dims[1], vec![0, 1, 2, 0, 1, 2]);
        // global flat index of local (i0, i1) is (0 + i0) * 6 + (3 + i1)
        assert_eq!(idx.flat, vec![3, 4, 5, 9, 10, 11]);
    }
}
