use crate::{
    Error, Result, VectorSimilarity,
    capability::InstructionSet,
    distance::{dot, l2sq},
    error::ensure,
    pq::Codebooks,
};

#[inline]
fn partial(centroid: &[f32], query: &[f32], similarity: VectorSimilarity, width: InstructionSet) -> f32 {
    match similarity {
        VectorSimilarity::Dot | VectorSimilarity::Cosine => dot(centroid, query, width),
        VectorSimilarity::Euclidean => l2sq(centroid, query, width),
    }
}

/// Compute the partial distance between the query sub-vector at `query_offset` and every
/// centroid of `codebook`, writing `cluster_count` values to `out` starting at
/// `codebook_index * cluster_count`.
///
/// `Cosine` produces dot product partials; normalization happens when scores are assembled.
///
/// *Panics* if `codebook` or `query` are too short or `out` has no room for the row.
#[allow(clippy::too_many_arguments)]
pub fn calculate_partial_sums(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    similarity: VectorSimilarity,
    out: &mut [f32],
    width: InstructionSet,
) {
    let q = &query[query_offset..(query_offset + sub_dim)];
    let row = &mut out[(codebook_index * cluster_count)..((codebook_index + 1) * cluster_count)];
    for (o, centroid) in row
        .iter_mut()
        .zip(codebook[..(cluster_count * sub_dim)].chunks_exact(sub_dim))
    {
        *o = partial(centroid, q, similarity, width);
    }
}

/// As [`calculate_partial_sums`], also writing the best value of the row to
/// `out_best[codebook_index]`: the maximum for dot products, the minimum for Euclidean.
///
/// *Panics* if any buffer is too short.
#[allow(clippy::too_many_arguments)]
pub fn calculate_partial_sums_best(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    similarity: VectorSimilarity,
    out: &mut [f32],
    out_best: &mut [f32],
    width: InstructionSet,
) {
    calculate_partial_sums(
        codebook,
        codebook_index,
        sub_dim,
        cluster_count,
        query,
        query_offset,
        similarity,
        out,
        width,
    );
    let row = &out[(codebook_index * cluster_count)..((codebook_index + 1) * cluster_count)];
    out_best[codebook_index] = extrema(row, similarity).0;
}

/// Returns (best, worst) values of a row of partials.
fn extrema(row: &[f32], similarity: VectorSimilarity) -> (f32, f32) {
    let (min, max) = row
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), v| {
            (min.min(*v), max.max(*v))
        });
    if similarity.larger_is_better() {
        (max, min)
    } else {
        (min, max)
    }
}

/// Per-query table of partial distances between each query sub-vector and every centroid.
///
/// Rows are computed per codebook and the table remembers which rows are filled, so it can only
/// be quantized once every anchor comes from the same pass as the values it anchors.
#[derive(Debug, Clone)]
pub struct PartialSums {
    similarity: VectorSimilarity,
    clusters: usize,
    sub_dim: usize,
    table: Vec<f32>,
    bests: Vec<f32>,
    worsts: Vec<f32>,
    query_magnitudes: Vec<f32>,
    filled: Vec<bool>,
}

impl PartialSums {
    /// Build the full table for `query` against `codebooks`.
    ///
    /// If the codebooks carry a global centroid the query is centered on it first.
    pub fn new(
        codebooks: &Codebooks,
        query: &[f32],
        similarity: VectorSimilarity,
        width: InstructionSet,
    ) -> Result<Self> {
        let mut sums = Self::empty(codebooks, similarity);
        for m in 0..codebooks.subspaces() {
            sums.fill_codebook(codebooks, query, m, width)?;
        }
        Ok(sums)
    }

    /// Create a table shaped for `codebooks` with no rows computed.
    pub fn empty(codebooks: &Codebooks, similarity: VectorSimilarity) -> Self {
        let subspaces = codebooks.subspaces();
        let (best, worst) = if similarity.larger_is_better() {
            (f32::NEG_INFINITY, f32::INFINITY)
        } else {
            (f32::INFINITY, f32::NEG_INFINITY)
        };
        Self {
            similarity,
            clusters: codebooks.clusters(),
            sub_dim: codebooks.sub_dim(),
            table: vec![0.0; subspaces * codebooks.clusters()],
            bests: vec![best; subspaces],
            worsts: vec![worst; subspaces],
            query_magnitudes: vec![0.0; subspaces],
            filled: vec![false; subspaces],
        }
    }

    /// Compute row `m` of the table for `query`.
    ///
    /// Fails if `codebooks` is not shaped like the codebooks this table was created for or if
    /// `query` does not have the full vector dimensions.
    pub fn fill_codebook(
        &mut self,
        codebooks: &Codebooks,
        query: &[f32],
        m: usize,
        width: InstructionSet,
    ) -> Result<()> {
        self.check_codebooks(codebooks)?;
        ensure(query.len() == codebooks.dimensions(), || {
            format!(
                "query has {} dimensions, codebooks cover {}",
                query.len(),
                codebooks.dimensions()
            )
        })?;
        ensure(m < self.subspaces(), || {
            format!("codebook {m} out of range for {} subspaces", self.subspaces())
        })?;

        let mut sub = vec![0.0f32; self.sub_dim];
        codebooks.centered_subvector(query, m, &mut sub);
        calculate_partial_sums_best(
            codebooks.codebook(m),
            m,
            self.sub_dim,
            self.clusters,
            &sub,
            0,
            self.similarity,
            &mut self.table,
            &mut self.bests,
            width,
        );
        self.worsts[m] = extrema(self.row(m), self.similarity).1;
        self.query_magnitudes[m] = dot(&sub, &sub, width);
        self.filled[m] = true;
        Ok(())
    }

    /// Fails with [`Error::InvalidArgument`] if `codebooks` has a different shape than this table.
    pub fn check_codebooks(&self, codebooks: &Codebooks) -> Result<()> {
        if codebooks.subspaces() != self.subspaces()
            || codebooks.clusters() != self.clusters
            || codebooks.sub_dim() != self.sub_dim
        {
            return Err(Error::invalid(format!(
                "codebooks are {}x{}x{} but partial sums were built for {}x{}x{}",
                codebooks.subspaces(),
                codebooks.clusters(),
                codebooks.sub_dim(),
                self.subspaces(),
                self.clusters,
                self.sub_dim
            )));
        }
        Ok(())
    }

    pub fn similarity(&self) -> VectorSimilarity {
        self.similarity
    }

    pub fn subspaces(&self) -> usize {
        self.filled.len()
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    /// Row-major table of `M` rows of `C` partials.
    pub fn table(&self) -> &[f32] {
        &self.table
    }

    pub fn row(&self, m: usize) -> &[f32] {
        &self.table[(m * self.clusters)..((m + 1) * self.clusters)]
    }

    /// Best partial value of each codebook row.
    pub fn bests(&self) -> &[f32] {
        &self.bests
    }

    /// Best achievable distance: the sum of per-codebook best values.
    pub fn best_distance(&self) -> f32 {
        self.bests.iter().sum()
    }

    /// Worst achievable distance: the sum of per-codebook worst values.
    pub fn worst_distance(&self) -> f32 {
        self.worsts.iter().sum()
    }

    /// Squared magnitude of the (centered) query, summed over all sub-vectors.
    pub fn query_magnitude_squared(&self) -> f32 {
        self.query_magnitudes.iter().sum()
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing().is_none()
    }

    /// Index of the first codebook whose row has not been computed.
    pub fn first_missing(&self) -> Option<usize> {
        self.filled.iter().position(|f| !f)
    }
}

#[cfg(test)]
mod test {
    use super::{PartialSums, calculate_partial_sums, calculate_partial_sums_best};
    use crate::{
        Error, VectorSimilarity,
        capability::InstructionSet,
        pq::{Codebooks, gather::assemble_and_sum},
        test::{WIDTHS, assert_float_near, random_codebooks, random_vector, test_rng},
    };

    fn two_by_four() -> Codebooks {
        // codebook 0 centroids: (1,0) (0,1) (-1,0) (0,-1); codebook 1 identical.
        let book = [1.0, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0];
        Codebooks::new(2, 4, 2, [book, book].concat()).unwrap()
    }

    #[test]
    fn dot_scenario() {
        let books = two_by_four();
        let query = [1.0, 0.0, 1.0, 0.0];
        let mut out = [f32::NAN; 8];
        let mut best = [f32::NAN; 2];
        for m in 0..2 {
            calculate_partial_sums_best(
                books.codebook(m),
                m,
                2,
                4,
                &query,
                m * 2,
                VectorSimilarity::Dot,
                &mut out,
                &mut best,
                InstructionSet::default(),
            );
        }
        assert_eq!(out, [1.0, 0.0, -1.0, 0.0, 1.0, 0.0, -1.0, 0.0]);
        assert_eq!(best, [1.0, 1.0]);
        let raw = assemble_and_sum(&out, 4, &[0, 0]);
        assert_eq!(raw, 2.0);
        assert_eq!(VectorSimilarity::Dot.score(raw), 1.5);
    }

    #[test]
    fn euclidean_best_is_min() {
        let books = two_by_four();
        let sums = PartialSums::new(
            &books,
            &[0.0, 2.0, 0.0, -2.0],
            VectorSimilarity::Euclidean,
            InstructionSet::Scalar,
        )
        .unwrap();
        assert_eq!(sums.row(0), &[5.0, 1.0, 5.0, 9.0]);
        assert_eq!(sums.bests(), &[1.0, 1.0]);
        assert_eq!(sums.best_distance(), 2.0);
        assert_eq!(sums.worst_distance(), 18.0);
    }

    #[test]
    fn single_row_leaves_others() {
        let books = two_by_four();
        let mut out = [7.0f32; 8];
        calculate_partial_sums(
            books.codebook(1),
            1,
            2,
            4,
            &[0.0, 0.0, 0.0, 1.0],
            2,
            VectorSimilarity::Cosine,
            &mut out,
            InstructionSet::Width256,
        );
        assert_eq!(out, [7.0, 7.0, 7.0, 7.0, 0.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn widths_agree() {
        let mut rng = test_rng();
        let books = random_codebooks(&mut rng, 16, 256, 6);
        let query = random_vector(&mut rng, books.dimensions());
        for similarity in VectorSimilarity::all() {
            let expected = PartialSums::new(&books, &query, similarity, InstructionSet::Scalar)
                .unwrap();
            for w in WIDTHS {
                let actual = PartialSums::new(&books, &query, similarity, w).unwrap();
                for (e, a) in expected.table().iter().zip(actual.table()) {
                    assert_float_near!(*e, *a);
                }
                assert_float_near!(expected.best_distance(), actual.best_distance());
            }
        }
    }

    #[test]
    fn centered_query() {
        let books = two_by_four()
            .with_global_centroid(vec![1.0, 1.0, 1.0, 1.0])
            .unwrap();
        let sums =
            PartialSums::new(&books, &[2.0, 1.0, 1.0, 2.0], VectorSimilarity::Cosine, InstructionSet::Scalar)
                .unwrap();
        assert_eq!(sums.row(0), &[1.0, 0.0, -1.0, 0.0]);
        assert_eq!(sums.row(1), &[0.0, 1.0, 0.0, -1.0]);
        assert_eq!(sums.query_magnitude_squared(), 2.0);
    }

    #[test]
    fn shape_mismatch() {
        let books = two_by_four();
        let other = Codebooks::new(2, 2, 2, vec![0.0; 8]).unwrap();
        let mut sums = PartialSums::empty(&books, VectorSimilarity::Dot);
        assert!(!sums.is_complete());
        assert!(matches!(
            sums.fill_codebook(&other, &[0.0; 4], 0, InstructionSet::Scalar),
            Err(Error::InvalidArgument(_))
        ));
        assert!(sums.fill_codebook(&books, &[0.0; 3], 0, InstructionSet::Scalar).is_err());
        assert!(sums.fill_codebook(&books, &[0.0; 4], 2, InstructionSet::Scalar).is_err());
    }
}
