//! Handle based interfaces to engines that hold PQ datasets and graph indices.
//!
//! A backend owns opaque handles for a dataset, prepared queries and indices. Every handle has an
//! explicit release call; [`Scoped`] pairs a handle with its release so that call sites cannot
//! leak one on an early return.
//!
//! [`HostPqBackend`] implements [`PqDatasetBackend`] on the CPU with the kernels in this crate.
//! Graph indices are only described by [`GraphIndexBackend`]; no implementation lives here.

use std::{
    cell::RefCell,
    fs::File,
    io::{self, BufReader, BufWriter},
    mem::ManuallyDrop,
    num::NonZero,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thread_local::ThreadLocal;
use tracing::debug;

use crate::{
    AdcConfig, QuantizationMode, VectorSimilarity,
    input::{Bytes, DerefVectorStore, VectorStore, read_f32_file, write_f32_file},
    pq::{
        BATCH_SIZE, Codebooks, PartialSums, QuantizedPartials,
        gather::assemble_and_sum,
        lookup::{quantized_cosine_kernel, quantized_kernel},
    },
};

/// A backend handle paired with the call that releases it.
///
/// The handle is released when the guard is dropped unless it is taken back with
/// [`Scoped::into_inner`].
pub struct Scoped<'b, B: ?Sized, H> {
    backend: &'b B,
    handle: ManuallyDrop<H>,
    release: fn(&B, H),
}

impl<'b, B: ?Sized, H> Scoped<'b, B, H> {
    pub fn new(backend: &'b B, handle: H, release: fn(&B, H)) -> Self {
        Self {
            backend,
            handle: ManuallyDrop::new(handle),
            release,
        }
    }

    /// Return the handle without releasing it. The caller becomes responsible for releasing it.
    pub fn into_inner(self) -> H {
        let mut this = ManuallyDrop::new(self);
        // Safety: this is never dropped so the handle is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.handle) }
    }
}

impl<B: ?Sized, H> Deref for Scoped<'_, B, H> {
    type Target = H;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<B: ?Sized, H> Drop for Scoped<'_, B, H> {
    fn drop(&mut self) {
        // Safety: the handle is only taken here or in into_inner(), which skips drop.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        (self.release)(self.backend, handle)
    }
}

/// An engine that holds product quantized vectors and scores them against queries by id.
pub trait PqDatasetBackend {
    type Dataset;
    type Query;
    type BatchQuery;

    /// Load the dataset described at `path`.
    fn load_dataset(&self, path: &Path) -> io::Result<Self::Dataset>;

    fn free_dataset(&self, dataset: Self::Dataset);

    /// Prepare `query` for scoring against `dataset`.
    fn prepare_query(&self, dataset: &Self::Dataset, query: &[f32]) -> io::Result<Self::Query>;

    fn free_query(&self, query: Self::Query);

    /// Prepare `query_count` queries packed end to end in `queries`.
    fn prepare_batch_query(
        &self,
        dataset: &Self::Dataset,
        queries: &[f32],
        query_count: usize,
    ) -> io::Result<Self::BatchQuery>;

    fn free_batch_query(&self, query: Self::BatchQuery);

    /// Write the score of each vector in `node_ids` to the matching entry of `similarities`.
    fn compute_similarities(
        &self,
        query: &Self::Query,
        node_ids: &[u32],
        similarities: &mut [f32],
    ) -> io::Result<()>;

    /// Score `degree` ids per query. `node_ids` and `similarities` are query-major.
    fn compute_batch_similarities(
        &self,
        query: &Self::BatchQuery,
        node_ids: &[u32],
        degree: usize,
        similarities: &mut [f32],
    ) -> io::Result<()>;

    fn open_dataset(&self, path: &Path) -> io::Result<Scoped<'_, Self, Self::Dataset>>
    where
        Self: Sized,
    {
        Ok(Scoped::new(self, self.load_dataset(path)?, Self::free_dataset))
    }

    fn open_query(
        &self,
        dataset: &Self::Dataset,
        query: &[f32],
    ) -> io::Result<Scoped<'_, Self, Self::Query>>
    where
        Self: Sized,
    {
        Ok(Scoped::new(
            self,
            self.prepare_query(dataset, query)?,
            Self::free_query,
        ))
    }

    fn open_batch_query(
        &self,
        dataset: &Self::Dataset,
        queries: &[f32],
        query_count: usize,
    ) -> io::Result<Scoped<'_, Self, Self::BatchQuery>>
    where
        Self: Sized,
    {
        Ok(Scoped::new(
            self,
            self.prepare_batch_query(dataset, queries, query_count)?,
            Self::free_batch_query,
        ))
    }
}

/// Parameters for building a graph index.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct GraphBuildParams {
    pub dimensions: NonZero<usize>,
    pub similarity: VectorSimilarity,
    /// Maximum out-degree of each node.
    pub max_edges: NonZero<usize>,
}

/// An engine that builds and searches graph indices over raw vectors.
pub trait GraphIndexBackend {
    type Index;

    /// Build an index over `vectors`, packed end to end with `params.dimensions` each.
    fn build_index(&self, vectors: &[f32], params: &GraphBuildParams) -> io::Result<Self::Index>;

    /// Return up to `k` ids of the vectors closest to `query`, best first.
    fn search(&self, index: &Self::Index, query: &[f32], k: usize) -> io::Result<Vec<u32>>;

    fn save_index(&self, index: &Self::Index, path: &Path) -> io::Result<()>;

    fn load_index(&self, path: &Path) -> io::Result<Self::Index>;

    fn free_index(&self, index: Self::Index);

    fn open_index(&self, path: &Path) -> io::Result<Scoped<'_, Self, Self::Index>>
    where
        Self: Sized,
    {
        Ok(Scoped::new(self, self.load_index(path)?, Self::free_index))
    }
}

/// On-disk description of a PQ dataset. Paths are relative to the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PqDatasetManifest {
    pub subspaces: usize,
    pub clusters: usize,
    pub sub_dim: usize,
    pub similarity: VectorSimilarity,
    /// Little-endian f32 centroids, codebook-major.
    pub centroids: PathBuf,
    /// One byte per codebook per vector.
    pub codes: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_centroid: Option<PathBuf>,
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Codebooks and codes held in host memory.
#[derive(Clone)]
pub struct HostPqDataset {
    codebooks: Arc<Codebooks>,
    codes: Arc<DerefVectorStore<u8, Bytes>>,
    similarity: VectorSimilarity,
}

impl HostPqDataset {
    /// Create a dataset from codes of `codebooks.subspaces()` bytes each, packed end to end.
    pub fn new(codebooks: Codebooks, codes: Vec<u8>, similarity: VectorSimilarity) -> io::Result<Self> {
        Self::from_bytes(codebooks, Bytes::Owned(codes), similarity)
    }

    fn from_bytes(codebooks: Codebooks, codes: Bytes, similarity: VectorSimilarity) -> io::Result<Self> {
        let stride = NonZero::new(codebooks.subspaces())
            .ok_or_else(|| invalid_input("codebooks have no subspaces".into()))?;
        let codes = DerefVectorStore::new(codes, stride)?;
        for code in codes.iter() {
            codebooks.check_code(code)?;
        }
        Ok(Self {
            codebooks: Arc::new(codebooks),
            codes: Arc::new(codes),
            similarity,
        })
    }

    /// Read the manifest at `path` and the files it names.
    pub fn load(path: &Path) -> io::Result<Self> {
        let manifest: PqDatasetManifest =
            serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut codebooks = Codebooks::new(
            manifest.subspaces,
            manifest.clusters,
            manifest.sub_dim,
            read_f32_file(dir.join(&manifest.centroids))?,
        )?;
        if let Some(center) = manifest.global_centroid.as_ref() {
            codebooks = codebooks.with_global_centroid(read_f32_file(dir.join(center))?)?;
        }
        Self::from_bytes(
            codebooks,
            Bytes::map(dir.join(&manifest.codes))?,
            manifest.similarity,
        )
    }

    /// Write a manifest to `path` and the centroid and code files next to it.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let stem = path
            .file_stem()
            .ok_or_else(|| invalid_input(format!("no file name in {}", path.display())))?
            .to_string_lossy();
        let manifest = PqDatasetManifest {
            subspaces: self.codebooks.subspaces(),
            clusters: self.codebooks.clusters(),
            sub_dim: self.codebooks.sub_dim(),
            similarity: self.similarity,
            centroids: format!("{stem}.centroids").into(),
            codes: format!("{stem}.codes").into(),
            global_centroid: self
                .codebooks
                .global_centroid()
                .map(|_| format!("{stem}.center").into()),
        };
        write_f32_file(dir.join(&manifest.centroids), self.codebooks.centroids())?;
        std::fs::write(dir.join(&manifest.codes), self.codes.as_flat())?;
        if let (Some(center), Some(file)) = (
            self.codebooks.global_centroid(),
            manifest.global_centroid.as_ref(),
        ) {
            write_f32_file(dir.join(file), center)?;
        }
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &manifest)?;
        Ok(())
    }

    pub fn codebooks(&self) -> &Codebooks {
        &self.codebooks
    }

    pub fn similarity(&self) -> VectorSimilarity {
        self.similarity
    }

    /// Number of vectors in the dataset.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Fails on the first id that is not a vector of this dataset.
    fn check_ids(&self, ids: &[u32]) -> io::Result<()> {
        match ids.iter().find(|id| **id as usize >= self.codes.len()) {
            Some(id) => Err(invalid_input(format!(
                "node id {id} out of range for {} vectors",
                self.codes.len()
            ))),
            None => Ok(()),
        }
    }

    fn code(&self, id: u32) -> io::Result<&[u8]> {
        let id = id as usize;
        if id < self.codes.len() {
            Ok(&self.codes[id])
        } else {
            Err(invalid_input(format!(
                "node id {id} out of range for {} vectors",
                self.codes.len()
            )))
        }
    }
}

/// A query prepared against a [`HostPqDataset`].
pub struct HostPqQuery {
    dataset: HostPqDataset,
    sums: PartialSums,
    quantized: Option<QuantizedPartials>,
}

impl HostPqQuery {
    fn score_exact(&self, code: &[u8]) -> f32 {
        let clusters = self.sums.clusters();
        let dot = assemble_and_sum(self.sums.table(), clusters, code);
        match self.dataset.similarity {
            VectorSimilarity::Cosine => VectorSimilarity::cosine_score(
                dot,
                assemble_and_sum(self.dataset.codebooks.magnitudes().partials(), clusters, code),
                self.sums.query_magnitude_squared(),
            ),
            s => s.score(dot),
        }
    }
}

/// Scores [`HostPqDataset`]s on the CPU.
///
/// With [`QuantizationMode::FullRange`] each prepared query carries a quantized table and ids are
/// scored 32 at a time with the lookup engine. A prepared query is shared and never adapts, so
/// [`QuantizationMode::Adaptive`] scores every id exactly from the float table.
///
/// Every dataset is scored with the similarity recorded in it, so one backend can serve datasets
/// of different metrics. [`AdcConfig::similarity`] is not consulted; only the quantization mode
/// and the instruction width of the config apply.
///
/// Ids are validated before any similarity is written, so a rejected call leaves the output
/// untouched.
pub struct HostPqBackend {
    config: AdcConfig,
    batches: ThreadLocal<RefCell<Vec<u8>>>,
}

impl HostPqBackend {
    pub fn new(config: AdcConfig) -> Self {
        Self {
            config,
            batches: ThreadLocal::new(),
        }
    }

    fn score_quantized(
        &self,
        query: &HostPqQuery,
        table: &QuantizedPartials,
        node_ids: &[u32],
        similarities: &mut [f32],
    ) -> io::Result<()> {
        let codebooks = &query.dataset.codebooks;
        let mut batch = self.batches.get_or(|| RefCell::new(vec![])).borrow_mut();
        batch.resize(codebooks.subspaces() * BATCH_SIZE, 0);
        let mut scores = [0.0f32; BATCH_SIZE];
        for (ids, out) in node_ids
            .chunks(BATCH_SIZE)
            .zip(similarities.chunks_mut(BATCH_SIZE))
        {
            batch.fill(0);
            for (lane, id) in ids.iter().enumerate() {
                for (m, c) in query.dataset.code(*id)?.iter().enumerate() {
                    batch[m * BATCH_SIZE + lane] = *c;
                }
            }
            match query.dataset.similarity {
                VectorSimilarity::Cosine => {
                    let magnitudes = codebooks.magnitudes().quantized();
                    quantized_cosine_kernel(
                        &batch,
                        table.as_slice(),
                        table.params(),
                        magnitudes.as_slice(),
                        magnitudes.params(),
                        query.sums.query_magnitude_squared(),
                        &mut scores,
                        self.config.width(),
                    )
                }
                s => quantized_kernel(
                    &batch,
                    table.as_slice(),
                    table.params(),
                    s,
                    &mut scores,
                    self.config.width(),
                ),
            }
            out.copy_from_slice(&scores[..out.len()]);
        }
        Ok(())
    }
}

impl Default for HostPqBackend {
    fn default() -> Self {
        Self::new(AdcConfig::default())
    }
}

impl PqDatasetBackend for HostPqBackend {
    type Dataset = HostPqDataset;
    type Query = HostPqQuery;
    type BatchQuery = Vec<HostPqQuery>;

    fn load_dataset(&self, path: &Path) -> io::Result<HostPqDataset> {
        let dataset = HostPqDataset::load(path)?;
        debug!(
            path = %path.display(),
            vectors = dataset.len(),
            subspaces = dataset.codebooks.subspaces(),
            clusters = dataset.codebooks.clusters(),
            "loaded pq dataset"
        );
        Ok(dataset)
    }

    fn free_dataset(&self, dataset: HostPqDataset) {
        drop(dataset)
    }

    fn prepare_query(&self, dataset: &HostPqDataset, query: &[f32]) -> io::Result<HostPqQuery> {
        let sums = PartialSums::new(
            &dataset.codebooks,
            query,
            dataset.similarity,
            self.config.width(),
        )?;
        let quantized = match self.config.quantization {
            QuantizationMode::FullRange => Some(QuantizedPartials::full_range(&sums)?),
            QuantizationMode::Adaptive => None,
        };
        Ok(HostPqQuery {
            dataset: dataset.clone(),
            sums,
            quantized,
        })
    }

    fn free_query(&self, query: HostPqQuery) {
        drop(query)
    }

    fn prepare_batch_query(
        &self,
        dataset: &HostPqDataset,
        queries: &[f32],
        query_count: usize,
    ) -> io::Result<Vec<HostPqQuery>> {
        let dim = dataset.codebooks.dimensions();
        if queries.len() != dim * query_count {
            return Err(invalid_input(format!(
                "{} query values do not hold {query_count} queries of {dim} dimensions",
                queries.len()
            )));
        }
        queries
            .chunks(dim)
            .map(|q| self.prepare_query(dataset, q))
            .collect()
    }

    fn free_batch_query(&self, query: Vec<HostPqQuery>) {
        drop(query)
    }

    fn compute_similarities(
        &self,
        query: &HostPqQuery,
        node_ids: &[u32],
        similarities: &mut [f32],
    ) -> io::Result<()> {
        let similarities = similarities.get_mut(..node_ids.len()).ok_or_else(|| {
            invalid_input(format!("no room for {} similarities", node_ids.len()))
        })?;
        query.dataset.check_ids(node_ids)?;
        match query.quantized.as_ref() {
            Some(table) => self.score_quantized(query, table, node_ids, similarities),
            None => {
                for (id, out) in node_ids.iter().zip(similarities.iter_mut()) {
                    *out = query.score_exact(query.dataset.code(*id)?);
                }
                Ok(())
            }
        }
    }

    fn compute_batch_similarities(
        &self,
        query: &Vec<HostPqQuery>,
        node_ids: &[u32],
        degree: usize,
        similarities: &mut [f32],
    ) -> io::Result<()> {
        let n = query.len() * degree;
        if node_ids.len() < n || similarities.len() < n {
            return Err(invalid_input(format!(
                "{} queries of degree {degree} need {n} ids and similarities, got {} and {}",
                query.len(),
                node_ids.len(),
                similarities.len()
            )));
        }
        if degree == 0 {
            return Ok(());
        }
        for (q, ids) in query.iter().zip(node_ids.chunks(degree)) {
            q.dataset.check_ids(ids)?;
        }
        for ((q, ids), out) in query
            .iter()
            .zip(node_ids.chunks(degree))
            .zip(similarities.chunks_mut(degree))
        {
            self.compute_similarities(q, ids, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, io, path::Path};

    use super::{
        GraphBuildParams, GraphIndexBackend, HostPqBackend, HostPqDataset, PqDatasetBackend,
    };
    use crate::{
        AdcConfig, QuantizationMode, VectorSimilarity,
        capability::InstructionSet,
        pq::AdcScorer,
        test::{assert_float_near, random_codebooks, random_vector, test_rng},
    };

    /// Records every handle it releases.
    #[derive(Default)]
    struct MockBackend {
        freed: RefCell<Vec<String>>,
    }

    impl PqDatasetBackend for MockBackend {
        type Dataset = u32;
        type Query = u32;
        type BatchQuery = u32;

        fn load_dataset(&self, path: &Path) -> io::Result<u32> {
            if path.as_os_str().is_empty() {
                Err(io::Error::from(io::ErrorKind::NotFound))
            } else {
                Ok(7)
            }
        }

        fn free_dataset(&self, dataset: u32) {
            self.freed.borrow_mut().push(format!("dataset {dataset}"));
        }

        fn prepare_query(&self, dataset: &u32, _query: &[f32]) -> io::Result<u32> {
            Ok(*dataset * 10)
        }

        fn free_query(&self, query: u32) {
            self.freed.borrow_mut().push(format!("query {query}"));
        }

        fn prepare_batch_query(&self, dataset: &u32, _q: &[f32], n: usize) -> io::Result<u32> {
            Ok(*dataset * 100 + n as u32)
        }

        fn free_batch_query(&self, query: u32) {
            self.freed.borrow_mut().push(format!("batch {query}"));
        }

        fn compute_similarities(&self, query: &u32, ids: &[u32], out: &mut [f32]) -> io::Result<()> {
            for (id, o) in ids.iter().zip(out.iter_mut()) {
                *o = (*query + *id) as f32;
            }
            Ok(())
        }

        fn compute_batch_similarities(
            &self,
            _query: &u32,
            _ids: &[u32],
            _degree: usize,
            _out: &mut [f32],
        ) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    impl GraphIndexBackend for MockBackend {
        type Index = usize;

        fn build_index(&self, vectors: &[f32], params: &GraphBuildParams) -> io::Result<usize> {
            Ok(vectors.len() / params.dimensions.get())
        }

        fn search(&self, index: &usize, _query: &[f32], k: usize) -> io::Result<Vec<u32>> {
            Ok((0..k.min(*index) as u32).collect())
        }

        fn save_index(&self, _index: &usize, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn load_index(&self, _path: &Path) -> io::Result<usize> {
            Ok(3)
        }

        fn free_index(&self, index: usize) {
            self.freed.borrow_mut().push(format!("index {index}"));
        }
    }

    #[test]
    fn scoped_release_order() {
        let backend = MockBackend::default();
        {
            let dataset = backend.open_dataset(Path::new("d")).unwrap();
            let query = backend.open_query(&dataset, &[]).unwrap();
            let mut out = [0.0f32; 2];
            backend
                .compute_similarities(&query, &[1, 2], &mut out)
                .unwrap();
            assert_eq!(out, [71.0, 72.0]);
            let _batch = backend.open_batch_query(&dataset, &[], 4).unwrap();
            assert!(backend.freed.borrow().is_empty());
        }
        assert_eq!(
            *backend.freed.borrow(),
            ["batch 704", "query 70", "dataset 7"]
        );
    }

    #[test]
    fn scoped_into_inner_skips_release() {
        let backend = MockBackend::default();
        let index = backend.open_index(Path::new("i")).unwrap();
        assert_eq!(backend.search(&index, &[], 10).unwrap(), [0, 1, 2]);
        let raw = index.into_inner();
        assert!(backend.freed.borrow().is_empty());
        backend.free_index(raw);
        assert_eq!(*backend.freed.borrow(), ["index 3"]);
        assert!(backend.open_dataset(Path::new("")).is_err());
        assert_eq!(backend.freed.borrow().len(), 1);
    }

    fn random_dataset(similarity: VectorSimilarity) -> (HostPqDataset, Vec<Vec<f32>>) {
        let mut rng = test_rng();
        let books = random_codebooks(&mut rng, 8, 64, 4);
        let vectors = (0..100)
            .map(|_| random_vector(&mut rng, books.dimensions()))
            .collect::<Vec<_>>();
        let codes = vectors
            .iter()
            .flat_map(|v| books.encode(v, InstructionSet::default()).unwrap())
            .collect();
        let queries = (0..3)
            .map(|_| random_vector(&mut rng, books.dimensions()))
            .collect();
        (HostPqDataset::new(books, codes, similarity).unwrap(), queries)
    }

    #[test]
    fn host_scores_match_scorer() {
        for similarity in VectorSimilarity::all() {
            let (dataset, queries) = random_dataset(similarity);
            let ids = (0..dataset.len() as u32).rev().collect::<Vec<_>>();
            for quantization in [QuantizationMode::Adaptive, QuantizationMode::FullRange] {
                let config = AdcConfig {
                    similarity,
                    quantization,
                    ..AdcConfig::default()
                };
                let backend = HostPqBackend::new(config);
                let scorer = AdcScorer::new(dataset.codebooks(), &queries[0], &config).unwrap();
                let query = backend.open_query(&dataset, &queries[0]).unwrap();
                let mut out = vec![0.0f32; ids.len()];
                backend.compute_similarities(&query, &ids, &mut out).unwrap();
                for (id, actual) in ids.iter().zip(out.iter()) {
                    let expected = scorer.score_code(&dataset.codes[*id as usize]);
                    match quantization {
                        QuantizationMode::Adaptive => assert_eq!(expected, *actual),
                        QuantizationMode::FullRange => assert_float_near!(expected, *actual, 1e-2),
                    }
                }
            }
        }
    }

    #[test]
    fn host_batch_query() {
        let (dataset, queries) = random_dataset(VectorSimilarity::Dot);
        let backend = HostPqBackend::default();
        let packed = queries.concat();
        let batch = backend.open_batch_query(&dataset, &packed, 3).unwrap();
        let ids = [0u32, 5, 9, 1, 2, 3, 99, 98, 97];
        let mut out = [0.0f32; 9];
        backend
            .compute_batch_similarities(&batch, &ids, 3, &mut out)
            .unwrap();
        for (q, query) in queries.iter().enumerate() {
            let single = backend.open_query(&dataset, query).unwrap();
            let mut expected = [0.0f32; 3];
            backend
                .compute_similarities(&single, &ids[(q * 3)..((q + 1) * 3)], &mut expected)
                .unwrap();
            assert_eq!(&out[(q * 3)..((q + 1) * 3)], &expected);
        }
        assert!(backend.open_batch_query(&dataset, &packed, 2).is_err());
        assert!(
            backend
                .compute_batch_similarities(&batch, &ids[..8], 3, &mut out)
                .is_err()
        );
    }

    #[test]
    fn host_rejects_unknown_ids() {
        let (dataset, queries) = random_dataset(VectorSimilarity::Euclidean);
        for quantization in [QuantizationMode::Adaptive, QuantizationMode::FullRange] {
            let backend = HostPqBackend::new(AdcConfig {
                quantization,
                ..AdcConfig::default()
            });
            let query = backend.open_query(&dataset, &queries[0]).unwrap();
            let err = backend
                .compute_similarities(&query, &[3, 100], &mut [0.0; 2])
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        let books = random_codebooks(&mut test_rng(), 2, 4, 2);
        assert!(HostPqDataset::new(books, vec![0, 4], VectorSimilarity::Dot).is_err());
    }

    #[test]
    fn rejected_ids_leave_output_untouched() {
        let (dataset, queries) = random_dataset(VectorSimilarity::Dot);
        let mut ids = (0..40).collect::<Vec<u32>>();
        ids[35] = 100;
        for quantization in [QuantizationMode::Adaptive, QuantizationMode::FullRange] {
            let backend = HostPqBackend::new(AdcConfig {
                quantization,
                ..AdcConfig::default()
            });
            let query = backend.open_query(&dataset, &queries[0]).unwrap();
            let mut out = [-1.0f32; 40];
            assert!(backend.compute_similarities(&query, &ids, &mut out).is_err());
            assert_eq!(out, [-1.0; 40]);

            let batch = backend.open_batch_query(&dataset, &queries[..2].concat(), 2).unwrap();
            let mut out = [-1.0f32; 80];
            let batch_ids = [(0..40).collect::<Vec<u32>>(), ids.clone()].concat();
            assert!(
                backend
                    .compute_batch_similarities(&batch, &batch_ids, 40, &mut out)
                    .is_err()
            );
            assert_eq!(out, [-1.0; 80]);
        }
    }

    #[test]
    fn dataset_similarity_wins() {
        let (dataset, queries) = random_dataset(VectorSimilarity::Euclidean);
        let backend = HostPqBackend::new(AdcConfig {
            similarity: VectorSimilarity::Dot,
            ..AdcConfig::default()
        });
        let config = AdcConfig {
            similarity: VectorSimilarity::Euclidean,
            ..AdcConfig::default()
        };
        let scorer = AdcScorer::new(dataset.codebooks(), &queries[2], &config).unwrap();
        let query = backend.open_query(&dataset, &queries[2]).unwrap();
        let ids = [4u32, 8, 15, 16, 23, 42];
        let mut out = [0.0f32; 6];
        backend.compute_similarities(&query, &ids, &mut out).unwrap();
        for (id, actual) in ids.iter().zip(out.iter()) {
            assert_eq!(scorer.score_code(&dataset.codes[*id as usize]), *actual);
        }
    }

    #[test]
    fn dataset_file_round_trip() {
        let (dataset, queries) = random_dataset(VectorSimilarity::Cosine);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        dataset.save(&path).unwrap();

        let backend = HostPqBackend::default();
        let loaded = backend.open_dataset(&path).unwrap();
        assert_eq!(loaded.len(), dataset.len());
        assert_eq!(loaded.similarity(), VectorSimilarity::Cosine);
        assert_eq!(loaded.codebooks().centroids(), dataset.codebooks().centroids());

        let ids = (0..10).collect::<Vec<u32>>();
        let mut expected = [0.0f32; 10];
        let mut actual = [0.0f32; 10];
        let q = backend.open_query(&dataset, &queries[1]).unwrap();
        backend.compute_similarities(&q, &ids, &mut expected).unwrap();
        let q = backend.open_query(&loaded, &queries[1]).unwrap();
        backend.compute_similarities(&q, &ids, &mut actual).unwrap();
        assert_eq!(expected, actual);
    }
}
