use super::{RetentionRate, SparseFilter};
use crate::{
    error::{Result, ServerErr},
    storage::VectorBuffer,
};

/// A sparse `(index, value)` representation of a dense buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Returns the amount of stored pairs.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterates over the stored `(index, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .iter()
            .zip(&self.values)
            .map(|(&i, &v)| (i as usize, v))
    }

    /// Expands these pairs into a dense buffer.
    ///
    /// # Arguments
    /// * `len` - The length of the dense buffer.
    ///
    /// # Returns
    /// The dense buffer or an error if any index is out of bounds.
    pub fn to_dense(&self, len: usize) -> Result<VectorBuffer> {
        decode(&self.indices, &self.values, len)
    }
}

/// Expands `(index, value)` pairs into a zero filled dense buffer.
///
/// # Arguments
/// * `indices` - The coordinates to set.
/// * `values` - The value for each coordinate in `indices`.
/// * `len` - The length of the dense buffer.
///
/// # Returns
/// The dense buffer, a `DimensionMismatch` if `indices` and `values` differ in length or an
/// `IndexOutOfBounds` if any index doesn't fit in `len`.
pub fn decode(indices: &[u32], values: &[f32], len: usize) -> Result<VectorBuffer> {
    if indices.len() != values.len() {
        return Err(ServerErr::DimensionMismatch {
            expected: indices.len(),
            got: values.len(),
        });
    }

    let mut out = VectorBuffer::zeros(len);
    let dense = out.as_mut_slice();

    for (&i, &v) in indices.iter().zip(values) {
        let index = i as usize;
        let slot = dense
            .get_mut(index)
            .ok_or(ServerErr::IndexOutOfBounds { index, len })?;

        *slot = v;
    }

    Ok(out)
}

/// Compresses dense buffers into sparse pairs under a pluggable selection policy.
#[derive(Debug, Clone, Default)]
pub struct SparseCodec<F: SparseFilter> {
    filter: F,
}

impl<F: SparseFilter> SparseCodec<F> {
    /// Creates a new `SparseCodec`.
    ///
    /// # Arguments
    /// * `filter` - The policy deciding which coordinates are kept.
    ///
    /// # Returns
    /// A new `SparseCodec` instance.
    pub fn new(filter: F) -> Self {
        Self { filter }
    }

    /// Sparsifies `buf` in place and returns what survived.
    ///
    /// Dropped coordinates are zeroed in `buf`, so afterwards it holds exactly what was encoded.
    /// Kept coordinates that are already zero are not emitted.
    ///
    /// # Arguments
    /// * `buf` - The dense buffer to compress.
    /// * `rate` - The fraction of the buffer to keep.
    ///
    /// # Returns
    /// The kept `(index, value)` pairs in ascending index order.
    pub fn encode(&self, buf: &mut [f32], rate: RetentionRate) -> SparseVector {
        let kept = self.filter.select(buf, rate);
        let mut sparse = SparseVector {
            indices: Vec::with_capacity(kept.len()),
            values: Vec::with_capacity(kept.len()),
        };

        let mut kept = kept.iter().peekable();

        for (i, x) in buf.iter_mut().enumerate() {
            if kept.next_if_eq(&&i).is_none() {
                *x = 0.;
            } else if *x != 0. {
                sparse.indices.push(i as u32);
                sparse.values.push(*x);
            }
        }

        sparse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsification::{MagnitudeMass, TopK};

    fn rate(r: f32) -> RetentionRate {
        RetentionRate::new(r).unwrap()
    }

    #[test]
    fn test_full_rate_is_lossless() {
        let codec = SparseCodec::new(TopK);
        let inputs = [
            vec![0., 0., 0.],
            vec![1.5, -2., 0., 3.25],
            vec![f32::MIN_POSITIVE, -1e30, 7.],
        ];

        for x in inputs {
            let mut buf = x.clone();
            let sparse = codec.encode(&mut buf, RetentionRate::FULL);
            let decoded = sparse.to_dense(x.len()).unwrap();

            assert_eq!(*decoded, *x);
            assert_eq!(buf, x);
        }
    }

    #[test]
    fn test_lossy_rate_zeroes_exactly_the_dropped_set() {
        let codec = SparseCodec::new(TopK);
        let x = vec![0.5, -4., 1., 0.25, 3., -2.];

        let mut buf = x.clone();
        let sparse = codec.encode(&mut buf, rate(0.5));
        let decoded = sparse.to_dense(x.len()).unwrap();

        assert_eq!(sparse.indices, vec![1, 4, 5]);

        for (i, (&d, &orig)) in decoded.iter().zip(&x).enumerate() {
            if sparse.indices.contains(&(i as u32)) {
                assert_eq!(d, orig);
            } else {
                assert_eq!(d, 0.);
            }
        }

        assert_eq!(buf, *decoded);
    }

    #[test]
    fn test_encoding_is_reproducible() {
        let codec = SparseCodec::new(MagnitudeMass);
        let x = vec![1., 1., -1., 2., 0.5, -2.];

        let first = codec.encode(&mut x.clone(), rate(0.4));
        let second = codec.encode(&mut x.clone(), rate(0.4));
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_validates_indices() {
        let err = decode(&[0, 4], &[1., 2.], 4).unwrap_err();
        assert!(matches!(err, ServerErr::IndexOutOfBounds { index: 4, len: 4 }));

        let err = decode(&[0], &[1., 2.], 4).unwrap_err();
        assert!(matches!(err, ServerErr::DimensionMismatch { .. }));
    }

    #[test]
    fn test_decode_scenario() {
        let dense = decode(&[0], &[2.], 4).unwrap();
        assert_eq!(*dense, [2., 0., 0., 0.]);
    }
}
