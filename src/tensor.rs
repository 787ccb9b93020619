use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::Array2;

use crate::error::{EngineError, EngineResult};

/// Short tensor name as it appears on the wire: up to 8 bytes, NUL-padded.
/// Names used by the engine: `x`, `ah`, `z`, `h`, `lab`, `grad`, `aTg`, `fg`, `bg`.
pub const TENSOR_NAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorName(pub [u8; TENSOR_NAME_LEN]);

impl TensorName {
    pub fn new(s: &str) -> Self {
        assert!(s.len() <= TENSOR_NAME_LEN, "tensor name '{s}' exceeds {TENSOR_NAME_LEN} bytes");
        let mut buf = [0u8; TENSOR_NAME_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(TENSOR_NAME_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl std::fmt::Display for TensorName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named, owning, dense 2-D `f32` tensor.
///
/// Storage is `ndarray::Array2<f32>`, the teacher's tensor backing: the
/// design note calling for "an owning buffer type whose drop releases the
/// allocation" is satisfied directly by `Array2`'s own `Drop` impl, rather
/// than a hand-rolled raw-pointer buffer with a matching manual free.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: TensorName,
    data: Array2<f32>,
}

impl Tensor {
    /// Builder-style construction: validates shape against the provided data
    /// once, at construction, so a tensor is never observed half-built (the
    /// design note's replacement for "set-name-then-set-data" staging).
    pub fn new(name: &str, rows: usize, cols: usize, data: Vec<f32>) -> EngineResult<Self> {
        if data.len() != rows * cols {
            return Err(EngineError::IncompatibleShapes {
                expected: vec![rows, cols],
                found: vec![data.len()],
            });
        }
        let arr = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| EngineError::TensorError(e.to_string()))?;
        Ok(Self { name: TensorName::new(name), data: arr })
    }

    pub fn zeros(name: &str, rows: usize, cols: usize) -> Self {
        Self { name: TensorName::new(name), data: Array2::zeros((rows, cols)) }
    }

    pub fn from_array(name: &str, data: Array2<f32>) -> Self {
        Self { name: TensorName::new(name), data }
    }

    /// Loads a raw little-endian `f32` row-major slab off disk, e.g. the
    /// input feature matrix or label matrix preloaded before the first epoch
    /// (§4.1.1, §4.2.4). Same framing as `adjacency.rs`'s partition reader.
    pub fn load_raw(name: &str, path: &std::path::Path, rows: usize, cols: usize) -> EngineResult<Self> {
        let mut f = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let mut cur = std::io::Cursor::new(&buf);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(cur.read_f32::<LittleEndian>()?);
        }
        Self::new(name, rows, cols, data)
    }

    pub fn name(&self) -> TensorName {
        self.name
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn as_array_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    /// A read-only slice of rows `[lo, hi)`. Row ranges are disjoint across
    /// chunks by construction, so callers never need to coordinate locks to
    /// read/write their own slice (§5, "Shared-resource policy").
    pub fn row_slice(&self, lo: usize, hi: usize) -> ndarray::ArrayView2<'_, f32> {
        self.data.slice(ndarray::s![lo..hi, ..])
    }

    pub fn row_slice_mut(&mut self, lo: usize, hi: usize) -> ndarray::ArrayViewMut2<'_, f32> {
        self.data.slice_mut(ndarray::s![lo..hi, ..])
    }

    /// Row-major flattened bytes, for the wire codec's raw row-slab framing.
    pub fn to_row_major_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * 4);
        for v in self.data.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}
