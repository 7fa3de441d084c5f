//! Dense f32 tensor used by every layer in the crate.
//!
//! The Tensor struct stores row-major (C-contiguous) data with explicit shape
//! and stride tracking. Every operation returns a new tensor; nothing is
//! computed lazily and nothing aliases.
//!
//! # Example
//!
//! ```rust
//! use lowrank_attention::tensor::Tensor;
//!
//! // [batch=2, heads=2, head_dim=3]
//! let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![2, 2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 2, 3]);
//!
//! // Merge heads back into the embedding dimension
//! let merged = t.reshape(&[2, 6]).unwrap();
//! assert_eq!(merged.numel(), 12);
//! ```

use crate::error::{LowRankError, Result};

/// Multi-dimensional f32 tensor with shape information.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor from data and shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the product of shape dimensions doesn't match data length.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![numel],
                got: vec![data.len()],
            });
        }

        Ok(Tensor { data, shape })
    }

    /// Create a tensor filled with zeros.
    ///
    /// Zero-sized dimensions are allowed; `zeros(&[2, 4, 0, 8])` is the empty
    /// cache buffer shape.
    pub fn zeros(shape: &[usize]) -> Tensor {
        let numel: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; numel],
            shape: shape.to_vec(),
        }
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: &[usize], value: f32) -> Tensor {
        let numel: usize = shape.iter().product();
        Tensor {
            data: vec![value; numel],
            shape: shape.to_vec(),
        }
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the total number of elements in the tensor.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Get the number of dimensions (rank) of the tensor.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of dimension `dim`.
    ///
    /// # Errors
    ///
    /// Returns `DimOutOfRange` if `dim >= ndim`.
    pub fn dim(&self, dim: usize) -> Result<usize> {
        self.shape
            .get(dim)
            .copied()
            .ok_or(LowRankError::DimOutOfRange {
                dim,
                ndim: self.ndim(),
            })
    }

    /// Borrow the flat row-major data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Copy the flat row-major data out.
    pub fn to_vec_f32(&self) -> Vec<f32> {
        self.data.clone()
    }

    /// Reshape tensor to a new shape.
    ///
    /// The total number of elements must remain the same.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the new shape has a different total number of elements.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
    /// let reshaped = t.reshape(&[3, 2]).unwrap();
    /// assert_eq!(reshaped.shape(), &[3, 2]);
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let new_numel: usize = new_shape.iter().product();
        if new_numel != self.numel() {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![new_numel],
                got: vec![self.numel()],
            });
        }
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Transpose a 2D tensor: (M, N) -> (N, M).
    ///
    /// # Errors
    ///
    /// Returns `DimOutOfRange` if the tensor is not 2D.
    pub fn transpose(&self) -> Result<Tensor> {
        if self.ndim() != 2 {
            return Err(LowRankError::DimOutOfRange {
                dim: 2,
                ndim: self.ndim(),
            });
        }
        self.transpose_dims(0, 1)
    }

    /// Swap dimensions `dim0` and `dim1`, reordering data to match the new layout.
    ///
    /// # Errors
    ///
    /// Returns `DimOutOfRange` if either dimension index is out of range.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// // [B, L, H, D] -> [B, H, L, D]
    /// let t = Tensor::new(vec![0.0; 2 * 3 * 4 * 5], vec![2, 3, 4, 5]).unwrap();
    /// let tr = t.transpose_dims(1, 2).unwrap();
    /// assert_eq!(tr.shape(), &[2, 4, 3, 5]);
    /// ```
    pub fn transpose_dims(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        let ndim = self.ndim();
        for dim in [dim0, dim1] {
            if dim >= ndim {
                return Err(LowRankError::DimOutOfRange { dim, ndim });
            }
        }
        if dim0 == dim1 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape.clone();
        new_shape.swap(dim0, dim1);

        // Destination strides seen from the source index space.
        let dst_strides = compute_strides(&new_shape);
        let mut src_to_dst = dst_strides.clone();
        src_to_dst.swap(dim0, dim1);

        let mut result = vec![0.0f32; self.numel()];
        let mut multi_idx = vec![0usize; ndim];
        for (flat_src, &value) in self.data.iter().enumerate() {
            if flat_src > 0 {
                increment_index(&mut multi_idx, &self.shape);
            }
            let flat_dst: usize = multi_idx
                .iter()
                .zip(src_to_dst.iter())
                .map(|(&i, &s)| i * s)
                .sum();
            result[flat_dst] = value;
        }

        Tensor::new(result, new_shape)
    }

    /// Remove dimensions of size 1.
    ///
    /// `None` removes every size-1 dimension; `Some(d)` removes only `d` and
    /// fails if its size is not 1.
    pub fn squeeze(&self, dim: Option<usize>) -> Result<Tensor> {
        let new_shape: Vec<usize> = match dim {
            None => self.shape.iter().copied().filter(|&s| s != 1).collect(),
            Some(d) => {
                if self.dim(d)? != 1 {
                    return Err(LowRankError::Msg(format!(
                        "Cannot squeeze dimension {} with size {} (must be 1)",
                        d, self.shape[d]
                    )));
                }
                let mut s = self.shape.clone();
                s.remove(d);
                s
            }
        };
        self.reshape(&new_shape)
    }

    /// Insert a dimension of size 1 at position `dim` (0..=ndim).
    pub fn unsqueeze(&self, dim: usize) -> Result<Tensor> {
        if dim > self.ndim() {
            return Err(LowRankError::DimOutOfRange {
                dim,
                ndim: self.ndim(),
            });
        }
        let mut new_shape = self.shape.clone();
        new_shape.insert(dim, 1);
        self.reshape(&new_shape)
    }

    /// Batched matrix multiplication: `[..., M, K] @ [..., K, N] -> [..., M, N]`.
    ///
    /// Both operands must have the same rank (at least 2) and identical
    /// leading (batch) dimensions. Covers the 2D linear case and the 4D
    /// `[B, H, M, K] @ [B, H, K, N]` multi-head case.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if ranks, batch dims or inner dims disagree.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
    /// let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]).unwrap();
    /// let c = a.matmul(&b).unwrap();
    /// assert_eq!(c.to_vec_f32(), vec![19.0, 22.0, 43.0, 50.0]);
    /// ```
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let lhs_shape = self.shape();
        let rhs_shape = rhs.shape();

        if lhs_shape.len() < 2 || lhs_shape.len() != rhs_shape.len() {
            return Err(LowRankError::ShapeMismatch {
                expected: lhs_shape.to_vec(),
                got: rhs_shape.to_vec(),
            });
        }

        let nd = lhs_shape.len();
        let batch_dims = &lhs_shape[..nd - 2];
        let m = lhs_shape[nd - 2];
        let k = lhs_shape[nd - 1];
        let n = rhs_shape[nd - 1];

        if batch_dims != &rhs_shape[..nd - 2] || rhs_shape[nd - 2] != k {
            return Err(LowRankError::ShapeMismatch {
                expected: lhs_shape.to_vec(),
                got: rhs_shape.to_vec(),
            });
        }

        let batch: usize = batch_dims.iter().product();
        let mut result = vec![0.0f32; batch * m * n];

        // PERF: naive triple loop per batch slice; i-k-j order keeps rhs rows hot.
        for b in 0..batch {
            let a = &self.data[b * m * k..(b + 1) * m * k];
            let w = &rhs.data[b * k * n..(b + 1) * k * n];
            let out = &mut result[b * m * n..(b + 1) * m * n];
            for i in 0..m {
                for kk in 0..k {
                    let a_val = a[i * k + kk];
                    if a_val == 0.0 {
                        continue;
                    }
                    let w_row = &w[kk * n..(kk + 1) * n];
                    let out_row = &mut out[i * n..(i + 1) * n];
                    for (o, &w_val) in out_row.iter_mut().zip(w_row.iter()) {
                        *o += a_val * w_val;
                    }
                }
            }
        }

        let mut out_shape = batch_dims.to_vec();
        out_shape.push(m);
        out_shape.push(n);
        Tensor::new(result, out_shape)
    }

    /// Element-wise addition with NumPy-style broadcasting.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        broadcast_binary_op(self, rhs, |a, b| a + b)
    }

    /// Element-wise multiplication with NumPy-style broadcasting.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// // [2, 1] * [3] -> [2, 3]
    /// let col = Tensor::new(vec![1.0, 2.0], vec![2, 1]).unwrap();
    /// let row = Tensor::new(vec![1.0, 10.0, 100.0], vec![3]).unwrap();
    /// let outer = col.mul(&row).unwrap();
    /// assert_eq!(outer.to_vec_f32(), vec![1.0, 10.0, 100.0, 2.0, 20.0, 200.0]);
    /// ```
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        broadcast_binary_op(self, rhs, |a, b| a * b)
    }

    /// Element-wise division with NumPy-style broadcasting.
    ///
    /// Division by zero follows IEEE 754.
    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        broadcast_binary_op(self, rhs, |a, b| a / b)
    }

    /// Multiply all elements by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Apply a unary function to every element.
    pub fn map(&self, mut f: impl FnMut(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Replace elements with `value` wherever the broadcast `mask` is exactly zero.
    ///
    /// The mask must broadcast to this tensor's shape without enlarging it.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let scores = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
    /// let mask = Tensor::new(vec![1.0, 0.0], vec![2]).unwrap();
    /// let filled = scores.masked_fill(&mask, -1e9).unwrap();
    /// assert_eq!(filled.to_vec_f32(), vec![1.0, -1e9, 3.0, -1e9]);
    /// ```
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Result<Tensor> {
        let out = broadcast_binary_op(self, mask, |x, m| if m == 0.0 { value } else { x })?;
        if out.shape() != self.shape() {
            return Err(LowRankError::ShapeMismatch {
                expected: self.shape.clone(),
                got: mask.shape.clone(),
            });
        }
        Ok(out)
    }

    /// Reduce sum along a dimension, removing it from the shape.
    ///
    /// Reducing a 1D tensor yields shape `[1]`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
    /// assert_eq!(t.sum(0).unwrap().to_vec_f32(), vec![5.0, 7.0, 9.0]);
    /// assert_eq!(t.sum(1).unwrap().to_vec_f32(), vec![6.0, 15.0]);
    /// ```
    pub fn sum(&self, dim: usize) -> Result<Tensor> {
        let (outer, size, inner) = self.split_at(dim)?;
        let mut result = vec![0.0f32; outer * inner];
        for o in 0..outer {
            for k in 0..size {
                let src = &self.data[(o * size + k) * inner..(o * size + k + 1) * inner];
                let dst = &mut result[o * inner..(o + 1) * inner];
                for (d, &s) in dst.iter_mut().zip(src.iter()) {
                    *d += s;
                }
            }
        }

        let mut out_shape = self.shape.clone();
        out_shape.remove(dim);
        if out_shape.is_empty() {
            out_shape.push(1);
        }
        Tensor::new(result, out_shape)
    }

    /// Arithmetic mean along a dimension, removing it from the shape.
    pub fn mean(&self, dim: usize) -> Result<Tensor> {
        let size = self.dim(dim)?;
        Ok(self.sum(dim)?.mul_scalar(1.0 / size as f32))
    }

    /// Numerically stable softmax along `dim`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let t = Tensor::new(vec![0.0, 0.0, 1.0, 1.0], vec![2, 2]).unwrap();
    /// let p = t.softmax(1).unwrap();
    /// assert_eq!(p.to_vec_f32(), vec![0.5, 0.5, 0.5, 0.5]);
    /// ```
    pub fn softmax(&self, dim: usize) -> Result<Tensor> {
        let (outer, size, inner) = self.split_at(dim)?;
        let mut result = self.data.clone();
        for o in 0..outer {
            for i in 0..inner {
                let idx = |k: usize| (o * size + k) * inner + i;
                let max = (0..size)
                    .map(|k| result[idx(k)])
                    .fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0f32;
                for k in 0..size {
                    let e = (result[idx(k)] - max).exp();
                    result[idx(k)] = e;
                    total += e;
                }
                for k in 0..size {
                    result[idx(k)] /= total;
                }
            }
        }
        Tensor::new(result, self.shape.clone())
    }

    /// Concatenate tensors along `dim`.
    ///
    /// All inputs must share rank and every dimension except `dim`.
    /// Zero-length inputs along `dim` are allowed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let empty = Tensor::zeros(&[1, 2, 0, 4]);
    /// let step = Tensor::new(vec![1.0; 8], vec![1, 2, 1, 4]).unwrap();
    /// let grown = Tensor::cat(&[&empty, &step], 2).unwrap();
    /// assert_eq!(grown.shape(), &[1, 2, 1, 4]);
    /// ```
    pub fn cat(tensors: &[&Tensor], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| LowRankError::Msg("cat: empty tensor list".to_string()))?;
        let (outer, _, inner) = first.split_at(dim)?;

        let mut out_shape = first.shape.clone();
        out_shape[dim] = 0;
        for t in tensors {
            let same_rank = t.ndim() == first.ndim();
            let same_other_dims = same_rank
                && t
                    .shape
                    .iter()
                    .zip(first.shape.iter())
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !same_other_dims {
                return Err(LowRankError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: t.shape.clone(),
                });
            }
            out_shape[dim] += t.shape[dim];
        }

        let mut result = Vec::with_capacity(out_shape.iter().product());
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[dim] * inner;
                result.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Tensor::new(result, out_shape)
    }

    /// Take `len` entries along `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        let (outer, size, inner) = self.split_at(dim)?;
        if start + len > size {
            return Err(LowRankError::ShapeMismatch {
                expected: vec![size],
                got: vec![start + len],
            });
        }
        let mut result = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * size + start) * inner;
            result.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut out_shape = self.shape.clone();
        out_shape[dim] = len;
        Tensor::new(result, out_shape)
    }

    /// Gather entries along `dim` in the order given by `indices`.
    ///
    /// Indices may repeat, which is how beam search expands a batch.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lowrank_attention::tensor::Tensor;
    ///
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0], vec![3, 1]).unwrap();
    /// let picked = t.index_select(0, &[2, 0, 0]).unwrap();
    /// assert_eq!(picked.to_vec_f32(), vec![3.0, 1.0, 1.0]);
    /// ```
    pub fn index_select(&self, dim: usize, indices: &[usize]) -> Result<Tensor> {
        let (outer, size, inner) = self.split_at(dim)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(LowRankError::DimOutOfRange {
                dim: bad,
                ndim: size,
            });
        }
        let mut result = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let base = (o * size + i) * inner;
                result.extend_from_slice(&self.data[base..base + inner]);
            }
        }
        let mut out_shape = self.shape.clone();
        out_shape[dim] = indices.len();
        Tensor::new(result, out_shape)
    }

    /// Split the shape around `dim` into `(outer, size, inner)` element counts.
    fn split_at(&self, dim: usize) -> Result<(usize, usize, usize)> {
        let size = self.dim(dim)?;
        let outer = self.shape[..dim].iter().product();
        let inner = self.shape[dim + 1..].iter().product();
        Ok((outer, size, inner))
    }
}

/// Compute broadcast shape from two shapes using NumPy broadcasting rules.
///
/// Shapes are aligned from the right; each pair of dims must be equal or 1.
fn broadcast_shape(a_shape: &[usize], b_shape: &[usize]) -> Result<Vec<usize>> {
    let max_ndim = a_shape.len().max(b_shape.len());
    let mut result = vec![0usize; max_ndim];

    for i in 0..max_ndim {
        let a_dim = a_shape.len().checked_sub(i + 1).map_or(1, |j| a_shape[j]);
        let b_dim = b_shape.len().checked_sub(i + 1).map_or(1, |j| b_shape[j]);

        result[max_ndim - 1 - i] = if a_dim == b_dim || b_dim == 1 {
            a_dim
        } else if a_dim == 1 {
            b_dim
        } else {
            return Err(LowRankError::ShapeMismatch {
                expected: a_shape.to_vec(),
                got: b_shape.to_vec(),
            });
        };
    }

    Ok(result)
}

/// Apply a binary operation element-wise with NumPy-style broadcasting.
fn broadcast_binary_op(a: &Tensor, b: &Tensor, op: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    if a.shape == b.shape {
        let result = a
            .data
            .iter()
            .zip(b.data.iter())
            .map(|(&x, &y)| op(x, y))
            .collect();
        return Tensor::new(result, a.shape.clone());
    }

    let out_shape = broadcast_shape(&a.shape, &b.shape)?;
    let out_numel: usize = out_shape.iter().product();
    let ndim = out_shape.len();

    let pad = |shape: &[usize]| {
        let mut s = vec![1; ndim - shape.len()];
        s.extend_from_slice(shape);
        s
    };
    let a_padded = pad(&a.shape);
    let b_padded = pad(&b.shape);

    // Zero stride on broadcast dims so the same source element is reused.
    let effective = |padded: &[usize]| -> Vec<usize> {
        compute_strides(padded)
            .into_iter()
            .zip(padded.iter())
            .map(|(s, &d)| if d == 1 { 0 } else { s })
            .collect()
    };
    let a_strides = effective(&a_padded);
    let b_strides = effective(&b_padded);

    let mut result = Vec::with_capacity(out_numel);
    let mut multi_idx = vec![0usize; ndim];
    for flat_out in 0..out_numel {
        if flat_out > 0 {
            increment_index(&mut multi_idx, &out_shape);
        }
        let a_flat: usize = multi_idx.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let b_flat: usize = multi_idx.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        result.push(op(a.data[a_flat], b.data[b_flat]));
    }

    Tensor::new(result, out_shape)
}

/// Advance a row-major multi-index by one position (odometer style).
fn increment_index(multi_idx: &mut [usize], shape: &[usize]) {
    for d in (0..shape.len()).rev() {
        multi_idx[d] += 1;
        if multi_idx[d] < shape[d] {
            return;
        }
        multi_idx[d] = 0;
    }
}

/// Compute row-major (C-contiguous) strides for a given shape.
///
/// ```ignore
/// compute_strides(&[2, 3, 4]) => [12, 4, 1]
/// compute_strides(&[]) => []
/// ```
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let ndim = shape.len();
    let mut strides = vec![1; ndim];
    for i in (0..ndim.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
