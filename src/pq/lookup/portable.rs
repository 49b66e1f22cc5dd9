//! Lookup kernels over plain arrays.
//!
//! These follow the vector kernels step for step (two source permutes over 32 or 64 entry
//! windows, then the selection tree over the index high bits) so they can stand in for them on
//! any host and serve as their reference in tests.

use crate::pq::{
    BATCH_SIZE, MAX_FLOAT_CLUSTERS, QUANTIZED_ROW_STRIDE,
    lookup::selection::{bit_mask, select_tree},
};

/// Per lane, read entry `idx & (2 * lo.len() - 1)` of the concatenation of `lo` and `hi`.
#[inline(always)]
pub fn permute2<T: Copy, const L: usize>(idx: &[u8; L], lo: &[T], hi: &[T]) -> [T; L] {
    let n = lo.len();
    debug_assert!(n.is_power_of_two() && hi.len() == n);
    std::array::from_fn(|i| {
        let j = idx[i] as usize & (2 * n - 1);
        if j < n { lo[j] } else { hi[j - n] }
    })
}

/// Iterate over the rows of a transposed batch. A trailing partial row is ignored.
#[inline]
fn rows(shuffles: &[u8]) -> impl Iterator<Item = &[u8; BATCH_SIZE]> {
    shuffles
        .chunks_exact(BATCH_SIZE)
        .filter_map(|c| c.try_into().ok())
}

/// Saturating sum of quantized partials for each candidate in a batch.
pub fn quantized_sums(shuffles: &[u8], table: &[u16]) -> [u16; BATCH_SIZE] {
    let mut acc = [0u16; BATCH_SIZE];
    for (codes, row) in rows(shuffles).zip(table.chunks_exact(QUANTIZED_ROW_STRIDE)) {
        let windows: [[u16; BATCH_SIZE]; 4] = std::array::from_fn(|w| {
            let window = &row[(w * 64)..((w + 1) * 64)];
            permute2(codes, &window[..32], &window[32..])
        });
        let lookup = select_tree(windows, &[bit_mask(codes, 6), bit_mask(codes, 7)]);
        for (a, v) in acc.iter_mut().zip(lookup) {
            *a = a.saturating_add(v);
        }
    }
    acc
}

/// Sum of float partials for each candidate in a batch.
pub fn float_sums(shuffles: &[u8], table: &[f32]) -> [f32; BATCH_SIZE] {
    let mut acc = [0.0f32; BATCH_SIZE];
    for (codes, row) in rows(shuffles).zip(table.chunks_exact(MAX_FLOAT_CLUSTERS)) {
        let lookup = permute2(codes, &row[..16], &row[16..]);
        for (a, v) in acc.iter_mut().zip(lookup) {
            *a += v;
        }
    }
    acc
}
