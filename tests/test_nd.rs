use miniexpr::{Dtype, Expression, NdLayout, VarDecl};

#[test]
fn valid_extent_of_a_tiled_cube() {
    let layout = NdLayout::new(&[50, 60, 70], &[50, 60, 70], &[18, 20, 24]).unwrap();
    let e = Expression::compile_nd(
        "x + 1",
        &[VarDecl::new("x", Dtype::I32)],
        None,
        layout,
    )
    .unwrap();
    assert_eq!(e.valid_nitems(0, 0).unwrap(), 18 * 20 * 24);
    // last block along every dimension: truncated extents (14, 20, 22)
    assert_eq!(e.valid_nitems(0, 26).unwrap(), 14 * 20 * 22);
    // out-of-range block indices are rejected
    assert!(e.valid_nitems(1, 0).is_err());
    assert!(e.valid_nitems(0, 27).is_err());
}

#[test]
fn closed_form_valid_nitems_over_all_blocks() {
    let shape = [7usize, 5];
    let chunk = [4usize, 5];
    let block = [3usize, 2];
    let layout = NdLayout::new(&shape, &chunk, &block).unwrap();
    let e = Expression::compile_nd("x", &[VarDecl::new("x", Dtype::F64)], None, layout.clone())
        .unwrap();
    let chunks_per_dim = [2usize, 1];
    let blocks_per_chunk = [2usize, 3];
    for nchunk in 0..layout.nchunks() {
        for nblock in 0..layout.nblocks_per_chunk() {
            let cd = [nchunk / chunks_per_dim[1], nchunk % chunks_per_dim[1]];
            let bd = [nblock / blocks_per_chunk[1], nblock % blocks_per_chunk[1]];
            let expect: usize = (0..2)
                .map(|d| {
                    let chunk_start = cd[d] * chunk[d];
                    let chunk_len = chunk[d].min(shape[d] - chunk_start);
                    let block_start = bd[d] * block[d];
                    block[d].min(chunk_len.saturating_sub(block_start))
                })
                .product();
            assert_eq!(
                e.valid_nitems(nchunk, nblock).unwrap(),
                expect,
                "chunk {nchunk} block {nblock}"
            );
        }
    }
}

#[test]
fn eval_nd_zeroes_padding() {
    // 1-D: shape 10, one chunk of 8 (so two chunks), blocks of 4
    let layout = NdLayout::new(&[10], &[8], &[4]).unwrap();
    let e = Expression::compile_nd("x * 2", &[VarDecl::new("x", Dtype::I64)], None, layout)
        .unwrap();
    // second chunk, first block: global elements 8, 9 then padding
    let x = [100i64, 200, -1, -1];
    let mut out = [7i64; 4];
    e.eval_nd(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 1, 0, None)
        .unwrap();
    assert_eq!(e.valid_nitems(1, 0).unwrap(), 2);
    assert_eq!(out, [200, 400, 0, 0]);
}

#[test]
fn kernel_reads_global_flat_index() {
    // shape (9, 6), one chunk, blocks of (3, 6): block 1 starts at (3, 0)
    let layout = NdLayout::new(&[9, 6], &[9, 6], &[3, 6]).unwrap();
    let e = Expression::compile_nd(
        "def kernel(x):\n    return _flat_idx + 17 + 5\n",
        &[VarDecl::new("x", Dtype::I64)],
        None,
        layout,
    )
    .unwrap();
    assert_eq!(e.dtype(), Dtype::I64);
    let x = [0i64; 18];
    let mut out = [0i64; 18];
    e.eval_nd(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 0, 1, None)
        .unwrap();
    for i0 in 0..3usize {
        for i1 in 0..6usize {
            let expect = ((3 + i0) * 6 + i1) as i64 + 22;
            assert_eq!(out[i0 * 6 + i1], expect, "local ({i0}, {i1})");
        }
    }
}

#[test]
fn kernel_index_variables_cover_shape_and_rank() {
    let layout = NdLayout::new(&[4, 6], &[4, 6], &[2, 3]).unwrap();
    let e = Expression::compile_nd(
        "def kernel(x):\n    return _i0 * 100 + _i1 * 10 + _n1 + _ndim\n",
        &[VarDecl::new("x", Dtype::I64)],
        None,
        layout,
    )
    .unwrap();
    let x = [0i64; 6];
    let mut out = [0i64; 6];
    // block (0, 1): local indices walk (0..2, 0..3)
    e.eval_nd(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 0, 1, None)
        .unwrap();
    let mut expect = [0i64; 6];
    for i0 in 0..2 {
        for i1 in 0..3 {
            expect[i0 * 3 + i1] = (i0 as i64) * 100 + (i1 as i64) * 10 + 6 + 2;
        }
    }
    assert_eq!(out, expect);
}

#[test]
fn truncated_kernel_block_zeroes_invalid_lanes() {
    let layout = NdLayout::new(&[5], &[5], &[3]).unwrap();
    let e = Expression::compile_nd(
        "def kernel(x):\n    return _flat_idx + 1\n",
        &[VarDecl::new("x", Dtype::I64)],
        None,
        layout,
    )
    .unwrap();
    let x = [0i64; 3];
    let mut out = [9i64; 3];
    // last block holds two valid elements (3, 4) and one padding lane
    e.eval_nd(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 0, 1, None)
        .unwrap();
    assert_eq!(out, [4, 5, 0]);
}

#[test]
fn nd_layout_validation() {
    assert!(NdLayout::new(&[4, 4], &[2, 2], &[3, 1]).is_err());
    assert!(NdLayout::new(&[0], &[1], &[1]).is_err());
    assert!(NdLayout::new(&[1; 9], &[1; 9], &[1; 9]).is_err());
    assert!(NdLayout::new(&[4], &[4], &[4]).is_ok());
}
