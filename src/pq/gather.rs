//! Exact scoring of product quantized codes by summing unquantized table entries.
//!
//! This is the reference the lookup engine is measured against, and the path a query takes
//! before it has seen enough candidates to choose a quantization range.

use crate::pq::BATCH_SIZE;

/// Sum `table[row_stride * i + code[i]]` over every byte of `code`.
///
/// No normalization is applied.
///
/// *Panics* if any lookup falls outside of `table`.
#[inline]
pub fn assemble_and_sum(table: &[f32], row_stride: usize, code: &[u8]) -> f32 {
    code.iter()
        .enumerate()
        .map(|(i, c)| table[row_stride * i + *c as usize])
        .sum()
}

/// Sum unquantized partials for every candidate of a transposed batch.
///
/// `shuffles` holds `M` rows of [`BATCH_SIZE`] cluster indices and `table` holds `M` rows of
/// `row_stride` partials.
///
/// *Panics* if `shuffles` is not a whole number of rows or a lookup falls outside `table`.
pub fn assemble_batch(
    table: &[f32],
    row_stride: usize,
    shuffles: &[u8],
    out: &mut [f32; BATCH_SIZE],
) {
    assert_eq!(
        shuffles.len() % BATCH_SIZE,
        0,
        "shuffles must hold whole rows of {BATCH_SIZE}"
    );
    out.fill(0.0);
    for (m, codes) in shuffles.chunks_exact(BATCH_SIZE).enumerate() {
        let row = &table[(m * row_stride)..((m + 1) * row_stride)];
        for (o, c) in out.iter_mut().zip(codes.iter()) {
            *o += row[*c as usize];
        }
    }
}

/// Gather both dot product partials and centroid squared magnitudes for a transposed batch.
///
/// Both tables share the same `row_stride`.
pub fn assemble_batch_cosine(
    table: &[f32],
    magnitudes: &[f32],
    row_stride: usize,
    shuffles: &[u8],
    dots: &mut [f32; BATCH_SIZE],
    mags: &mut [f32; BATCH_SIZE],
) {
    assemble_batch(table, row_stride, shuffles, dots);
    assemble_batch(magnitudes, row_stride, shuffles, mags);
}

#[cfg(test)]
mod test {
    use super::{assemble_and_sum, assemble_batch, assemble_batch_cosine};
    use crate::{
        VectorSimilarity,
        capability::InstructionSet,
        pq::{BATCH_SIZE, PartialSums},
        test::{random_codebooks, random_shuffles, random_vector, test_rng},
    };

    #[test]
    fn single_code() {
        let table = [1.0, 0.0, -1.0, 0.0, 1.0, 0.0, -1.0, 0.0];
        assert_eq!(assemble_and_sum(&table, 4, &[0, 0]), 2.0);
        assert_eq!(assemble_and_sum(&table, 4, &[2, 1]), -1.0);
        assert_eq!(assemble_and_sum(&table, 4, &[]), 0.0);
    }

    #[test]
    fn batch_matches_single() {
        let mut rng = test_rng();
        let books = random_codebooks(&mut rng, 6, 16, 2);
        let sums = PartialSums::new(
            &books,
            &random_vector(&mut rng, books.dimensions()),
            VectorSimilarity::Cosine,
            InstructionSet::default(),
        )
        .unwrap();
        let shuffles = random_shuffles(&mut rng, 6, 16);
        let mut dots = [0.0f32; BATCH_SIZE];
        let mut mags = [0.0f32; BATCH_SIZE];
        assemble_batch_cosine(
            sums.table(),
            books.magnitudes().partials(),
            16,
            &shuffles,
            &mut dots,
            &mut mags,
        );
        let mut plain = [0.0f32; BATCH_SIZE];
        assemble_batch(sums.table(), 16, &shuffles, &mut plain);
        assert_eq!(plain, dots);
        for lane in 0..BATCH_SIZE {
            let code = (0..6).map(|m| shuffles[m * BATCH_SIZE + lane]).collect::<Vec<_>>();
            assert_eq!(dots[lane], assemble_and_sum(sums.table(), 16, &code));
            assert_eq!(
                mags[lane],
                assemble_and_sum(books.magnitudes().partials(), 16, &code)
            );
        }
    }
}
