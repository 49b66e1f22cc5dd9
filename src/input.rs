//! Fixed stride vector stores over byte buffers, typically memory mapped files.

use std::{
    fs::File,
    io,
    num::NonZero,
    ops::{Deref, Index},
    path::Path,
};

use memmap2::Mmap;
use stable_deref_trait::StableDeref;

/// A store of vector data indexed by a densely assigned range of values.
pub trait VectorStore: Index<usize> {
    type Elem;

    /// Number of elements in each vector.
    fn elem_stride(&self) -> usize;

    /// Return the number of vectors in the store.
    fn len(&self) -> usize;

    /// Return true if this store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return an iterator over all the vectors in the store.
    fn iter(&self) -> impl Iterator<Item = &[Self::Elem]>;
}

/// Bytes backing a store: either a memory mapped file or an owned buffer.
pub enum Bytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Bytes {
    /// Map the file at `path` read-only.
    pub fn map(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only; callers must not truncate the file while it is mapped.
        Ok(Self::Mapped(unsafe { Mmap::map(&file)? }))
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}

// Safety: neither a mapping nor a Vec's heap buffer moves when the owner does.
unsafe impl StableDeref for Bytes {}

/// A [`VectorStore`] over little-endian values of type `E` written end to end.
pub struct DerefVectorStore<E: 'static, D> {
    // NB: the contents of data is referenced by raw_vectors.
    #[allow(dead_code)]
    data: D,
    raw_vectors: &'static [E],
    stride: usize,
}

impl<E, D> DerefVectorStore<E, D>
where
    E: Copy,
    D: StableDeref<Target = [u8]>,
{
    pub fn new(data: D, stride: NonZero<usize>) -> io::Result<Self> {
        let elem_width = std::mem::size_of::<E>();
        let vectorp = data.as_ptr() as *const E;
        if !vectorp.is_aligned() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("vector data not aligned to element width {elem_width}"),
            ));
        }
        if data.len() % (elem_width * stride.get()) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "vector data of {} bytes does not divide into vectors of {} bytes",
                    data.len(),
                    elem_width * stride.get()
                ),
            ));
        }

        // Safety: StableDeref guarantees the pointer is stable even after a move.
        let raw_vectors: &'static [E] =
            unsafe { std::slice::from_raw_parts(vectorp, data.len() / elem_width) };
        Ok(Self {
            data,
            raw_vectors,
            stride: stride.get(),
        })
    }

    /// All values in the store, end to end.
    pub fn as_flat(&self) -> &[E] {
        self.raw_vectors
    }
}

impl<E, D> VectorStore for DerefVectorStore<E, D> {
    type Elem = E;

    fn elem_stride(&self) -> usize {
        self.stride
    }

    fn len(&self) -> usize {
        self.raw_vectors.len() / self.stride
    }

    fn iter(&self) -> impl Iterator<Item = &[Self::Elem]> {
        self.raw_vectors.chunks(self.stride)
    }
}

impl<E, D> Index<usize> for DerefVectorStore<E, D> {
    type Output = [E];

    fn index(&self, index: usize) -> &Self::Output {
        let start = index * self.stride;
        let end = start + self.stride;
        &self.raw_vectors[start..end]
    }
}

/// Read a file of little-endian f32 values into memory.
pub fn read_f32_file(path: impl AsRef<Path>) -> io::Result<Vec<f32>> {
    let store: DerefVectorStore<f32, Bytes> =
        DerefVectorStore::new(Bytes::map(path)?, NonZero::<usize>::MIN)?;
    Ok(store.as_flat().to_vec())
}

/// Write `values` to `path` as little-endian f32.
pub fn write_f32_file(path: impl AsRef<Path>, values: &[f32]) -> io::Result<()> {
    let bytes = values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<_>>();
    std::fs::write(path, bytes)
}
