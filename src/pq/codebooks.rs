use std::sync::OnceLock;

use tracing::debug;

use crate::{
    Error, Result,
    capability::InstructionSet,
    distance::{dot, l2sq},
    error::ensure,
    pq::{BATCH_SIZE, MAX_QUANTIZED_CLUSTERS, QuantizationParams, QuantizedPartials},
};

/// A set of `M` codebooks, each holding `C` centroids of `D'` dimensions.
///
/// Centroids are stored codebook-major and row-major within a codebook, so centroid `c` of
/// codebook `m` starts at `(m * C + c) * D'`. Codebooks are trained elsewhere; this type only
/// validates their layout and uses them at query time.
#[derive(Debug, Clone)]
pub struct Codebooks {
    subspaces: usize,
    clusters: usize,
    sub_dim: usize,
    centroids: Vec<f32>,
    global_centroid: Option<Vec<f32>>,
    magnitudes: OnceLock<MagnitudeTable>,
}

impl Codebooks {
    /// Create codebooks from `subspaces * clusters * sub_dim` centroid values.
    pub fn new(
        subspaces: usize,
        clusters: usize,
        sub_dim: usize,
        centroids: Vec<f32>,
    ) -> Result<Self> {
        ensure(subspaces > 0, || "subspace count must be positive".into())?;
        ensure(sub_dim > 0, || "sub-vector dimensions must be positive".into())?;
        ensure((1..=MAX_QUANTIZED_CLUSTERS).contains(&clusters), || {
            format!("cluster count {clusters} not in [1, {MAX_QUANTIZED_CLUSTERS}]")
        })?;
        ensure(centroids.len() == subspaces * clusters * sub_dim, || {
            format!(
                "expected {} centroid values for {subspaces}x{clusters}x{sub_dim} codebooks, got {}",
                subspaces * clusters * sub_dim,
                centroids.len()
            )
        })?;
        Ok(Self {
            subspaces,
            clusters,
            sub_dim,
            centroids,
            global_centroid: None,
            magnitudes: OnceLock::new(),
        })
    }

    /// Center every vector on `centroid` before assigning codes or building query tables.
    pub fn with_global_centroid(mut self, centroid: Vec<f32>) -> Result<Self> {
        ensure(centroid.len() == self.dimensions(), || {
            format!(
                "global centroid has {} dimensions, codebooks cover {}",
                centroid.len(),
                self.dimensions()
            )
        })?;
        self.global_centroid = Some(centroid);
        Ok(self)
    }

    /// Number of codebooks, `M`. This is also the length of a code in bytes.
    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    /// Number of centroids per codebook, `C`.
    pub fn clusters(&self) -> usize {
        self.clusters
    }

    /// Dimensions of each sub-vector, `D'`.
    pub fn sub_dim(&self) -> usize {
        self.sub_dim
    }

    /// Dimensions of a full vector, `D = M * D'`.
    pub fn dimensions(&self) -> usize {
        self.subspaces * self.sub_dim
    }

    pub fn global_centroid(&self) -> Option<&[f32]> {
        self.global_centroid.as_deref()
    }

    /// All `C * D'` centroid values of codebook `m`.
    pub fn codebook(&self, m: usize) -> &[f32] {
        let len = self.clusters * self.sub_dim;
        &self.centroids[(m * len)..((m + 1) * len)]
    }

    /// Every centroid value, codebook-major.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Centroid `c` of codebook `m`.
    pub fn centroid(&self, m: usize, c: usize) -> &[f32] {
        let start = (m * self.clusters + c) * self.sub_dim;
        &self.centroids[start..(start + self.sub_dim)]
    }

    /// Write sub-vector `m` of `vector`, centered on the global centroid if any, to `out`.
    pub(crate) fn centered_subvector(&self, vector: &[f32], m: usize, out: &mut [f32]) {
        let range = (m * self.sub_dim)..((m + 1) * self.sub_dim);
        out.copy_from_slice(&vector[range.clone()]);
        if let Some(center) = self.global_centroid.as_ref() {
            for (o, c) in out.iter_mut().zip(&center[range]) {
                *o -= c;
            }
        }
    }

    /// Assign `vector` to the nearest centroid in each codebook.
    pub fn encode(&self, vector: &[f32], width: InstructionSet) -> Result<Vec<u8>> {
        let mut code = vec![0u8; self.subspaces];
        self.encode_to(vector, &mut code, width)?;
        Ok(code)
    }

    /// Assign `vector` to the nearest centroid in each codebook, writing one byte per codebook.
    pub fn encode_to(&self, vector: &[f32], out: &mut [u8], width: InstructionSet) -> Result<()> {
        ensure(vector.len() == self.dimensions(), || {
            format!(
                "vector has {} dimensions, codebooks cover {}",
                vector.len(),
                self.dimensions()
            )
        })?;
        ensure(out.len() == self.subspaces, || {
            format!("code buffer has {} bytes, need {}", out.len(), self.subspaces)
        })?;
        let mut sub = vec![0.0f32; self.sub_dim];
        for (m, o) in out.iter_mut().enumerate() {
            self.centered_subvector(vector, m, &mut sub);
            let mut nearest = (0, f32::INFINITY);
            for (c, centroid) in self.codebook(m).chunks_exact(self.sub_dim).enumerate() {
                let d = l2sq(&sub, centroid, width);
                if d < nearest.1 {
                    nearest = (c, d);
                }
            }
            *o = nearest.0 as u8;
        }
        Ok(())
    }

    /// Reconstruct an approximate vector from `code`.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        self.check_code(code)?;
        let mut vector = Vec::with_capacity(self.dimensions());
        for (m, c) in code.iter().enumerate() {
            vector.extend_from_slice(self.centroid(m, *c as usize));
        }
        if let Some(center) = self.global_centroid.as_ref() {
            for (v, c) in vector.iter_mut().zip(center.iter()) {
                *v += c;
            }
        }
        Ok(vector)
    }

    /// Fails unless `code` has one byte per codebook and every byte is a valid cluster.
    pub fn check_code(&self, code: &[u8]) -> Result<()> {
        ensure(code.len() == self.subspaces, || {
            format!("code has {} bytes, need {}", code.len(), self.subspaces)
        })?;
        match code.iter().position(|c| *c as usize >= self.clusters) {
            Some(m) => Err(Error::invalid(format!(
                "code {} in codebook {m} exceeds cluster count {}",
                code[m], self.clusters
            ))),
            None => Ok(()),
        }
    }

    /// Transpose up to [`BATCH_SIZE`] codes into a batch for the lookup engine.
    ///
    /// Lanes past `codes.len()` are filled with cluster 0.
    pub fn pack_batch<C: AsRef<[u8]>>(&self, codes: &[C]) -> Result<Vec<u8>> {
        ensure(codes.len() <= BATCH_SIZE, || {
            format!("cannot pack {} codes into a batch of {BATCH_SIZE}", codes.len())
        })?;
        let mut batch = vec![0u8; self.subspaces * BATCH_SIZE];
        for (lane, code) in codes.iter().enumerate() {
            let code = code.as_ref();
            self.check_code(code)?;
            for (m, c) in code.iter().enumerate() {
                batch[m * BATCH_SIZE + lane] = *c;
            }
        }
        Ok(batch)
    }

    /// Squared magnitudes of every centroid, used to normalize cosine scores.
    ///
    /// Computed on first use and shared by every query against these codebooks.
    pub fn magnitudes(&self) -> &MagnitudeTable {
        self.magnitudes.get_or_init(|| MagnitudeTable::new(self))
    }
}

/// Squared magnitudes of each centroid and their 16-bit quantization.
///
/// Magnitudes do not depend on the query so the quantization range is exact: each codebook is
/// anchored at its smallest magnitude and the scale spans the sum of the per-codebook maxima.
#[derive(Debug, Clone)]
pub struct MagnitudeTable {
    partials: Vec<f32>,
    quantized: QuantizedPartials,
}

impl MagnitudeTable {
    fn new(codebooks: &Codebooks) -> Self {
        let width = InstructionSet::default();
        let mut partials = Vec::with_capacity(codebooks.subspaces * codebooks.clusters);
        let mut mins = Vec::with_capacity(codebooks.subspaces);
        let mut max_sum = 0.0f32;
        for m in 0..codebooks.subspaces {
            let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
            for centroid in codebooks.codebook(m).chunks_exact(codebooks.sub_dim) {
                let mag = dot(centroid, centroid, width);
                min = min.min(mag);
                max = max.max(mag);
                partials.push(mag);
            }
            mins.push(min);
            max_sum += max;
        }
        let params = QuantizationParams::full_range(mins.iter().sum(), max_sum);
        debug!(
            subspaces = codebooks.subspaces,
            clusters = codebooks.clusters,
            delta = params.delta,
            "built centroid magnitude table"
        );
        let quantized = QuantizedPartials::from_anchored(
            codebooks.clusters,
            &partials,
            &mins,
            params,
        );
        Self {
            partials,
            quantized,
        }
    }

    /// Unquantized squared magnitudes, `M` rows of `C`.
    pub fn partials(&self) -> &[f32] {
        &self.partials
    }

    /// Quantized squared magnitudes, `M` rows of [`crate::pq::QUANTIZED_ROW_STRIDE`].
    pub fn quantized(&self) -> &QuantizedPartials {
        &self.quantized
    }

    /// Quantization parameters of [`Self::quantized`]. `base` is the sum of per-codebook minima.
    pub fn params(&self) -> QuantizationParams {
        self.quantized.params()
    }
}

#[cfg(test)]
mod test {
    use super::Codebooks;
    use crate::{
        Error,
        capability::InstructionSet,
        pq::BATCH_SIZE,
        test::{assert_float_near, random_codebooks, random_vector, test_rng},
    };

    #[test]
    fn invalid_layouts() {
        assert!(matches!(
            Codebooks::new(2, 4, 2, vec![0.0; 15]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Codebooks::new(0, 4, 2, vec![]).is_err());
        assert!(Codebooks::new(1, 257, 1, vec![0.0; 257]).is_err());
        assert!(Codebooks::new(1, 0, 1, vec![]).is_err());
        let books = Codebooks::new(2, 4, 2, vec![0.0; 16]).unwrap();
        assert!(books.with_global_centroid(vec![0.0; 3]).is_err());
    }

    #[test]
    fn encode_nearest() {
        // codebook 0: centroids at x = 0, 1, 2, 3; codebook 1: y = 0, 10, 20, 30.
        let centroids = vec![0.0, 1.0, 2.0, 3.0, 0.0, 10.0, 20.0, 30.0];
        let books = Codebooks::new(2, 4, 1, centroids).unwrap();
        let code = books.encode(&[2.2, 9.0], InstructionSet::Width512).unwrap();
        assert_eq!(code, vec![2, 1]);
        assert_eq!(books.decode(&code).unwrap(), vec![2.0, 10.0]);
        assert!(books.decode(&[4, 0]).is_err());
        assert!(books.encode(&[1.0], InstructionSet::Scalar).is_err());
    }

    #[test]
    fn encode_centered() {
        let books = Codebooks::new(1, 2, 2, vec![0.0, 0.0, 1.0, 1.0])
            .unwrap()
            .with_global_centroid(vec![10.0, 10.0])
            .unwrap();
        assert_eq!(books.encode(&[11.0, 11.0], InstructionSet::Scalar).unwrap(), vec![1]);
        assert_eq!(books.encode(&[9.9, 10.2], InstructionSet::Scalar).unwrap(), vec![0]);
        assert_eq!(books.decode(&[1]).unwrap(), vec![11.0, 11.0]);
    }

    #[test]
    fn decode_encode_is_stable() {
        let mut rng = test_rng();
        let books = random_codebooks(&mut rng, 8, 16, 4);
        let v = random_vector(&mut rng, books.dimensions());
        let code = books.encode(&v, InstructionSet::Width512).unwrap();
        let decoded = books.decode(&code).unwrap();
        assert_eq!(books.encode(&decoded, InstructionSet::Scalar).unwrap(), code);
    }

    #[test]
    fn pack_batch_transposes() {
        let books = Codebooks::new(3, 8, 1, (0..24).map(|x| x as f32).collect()).unwrap();
        let codes = [[1u8, 2, 3], [4, 5, 6]];
        let batch = books.pack_batch(&codes).unwrap();
        assert_eq!(batch.len(), 3 * BATCH_SIZE);
        for m in 0..3 {
            assert_eq!(batch[m * BATCH_SIZE], codes[0][m]);
            assert_eq!(batch[m * BATCH_SIZE + 1], codes[1][m]);
            assert!(batch[(m * BATCH_SIZE + 2)..((m + 1) * BATCH_SIZE)]
                .iter()
                .all(|c| *c == 0));
        }
        assert!(books.pack_batch(&[[8u8, 0, 0]]).is_err());
        assert!(books.pack_batch(&vec![[0u8; 3]; BATCH_SIZE + 1]).is_err());
    }

    #[test]
    fn magnitudes() {
        let books = Codebooks::new(2, 2, 2, vec![1.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 0.0]).unwrap();
        let table = books.magnitudes();
        assert_eq!(table.partials(), &[1.0, 4.0, 9.0, 0.0]);
        let params = table.params();
        assert_eq!(params.base, 1.0);
        assert_float_near!((13.0 - 1.0) / 65535.0, params.delta, 1e-6);
        assert!(std::ptr::eq(table, books.magnitudes()));
        let q = table.quantized();
        assert_eq!(q.row(0)[0], 0);
        assert_eq!(q.row(0)[1], ((4.0f32 - 1.0) / params.delta) as u16);
        assert_eq!(q.row(1)[1], 0);
    }
}
