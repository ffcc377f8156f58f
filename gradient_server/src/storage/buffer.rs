use std::ops::Deref;

use rayon::prelude::*;

use crate::error::{Result, ServerErr};

/// The amount of coordinates each rayon task handles in elementwise operations.
const CHUNK_SIZE: usize = 1 << 14;

/// A fixed length flattened model or gradient.
///
/// Every binary operation requires both operands to have the same length, the length of a
/// buffer never changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorBuffer(Box<[f32]>);

impl VectorBuffer {
    /// Creates a new zero filled `VectorBuffer`.
    ///
    /// # Arguments
    /// * `len` - The amount of coordinates.
    ///
    /// # Returns
    /// A new `VectorBuffer` instance.
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.; len].into_boxed_slice())
    }

    /// Returns the buffer's coordinates as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    /// Computes `a - b` into a new buffer.
    ///
    /// # Arguments
    /// * `a` - The minuend.
    /// * `b` - The subtrahend.
    ///
    /// # Returns
    /// The difference or a `DimensionMismatch` error.
    pub fn difference(a: &[f32], b: &[f32]) -> Result<Self> {
        let mut out = Self::from(a.to_vec());
        out.sub(b)?;
        Ok(out)
    }

    /// Performs `self += scale * other`.
    ///
    /// # Arguments
    /// * `other` - The buffer to add.
    /// * `scale` - The factor applied to `other`.
    ///
    /// # Returns
    /// A `DimensionMismatch` error if the lengths differ.
    pub fn add(&mut self, other: &[f32], scale: f32) -> Result<()> {
        self.zip_with(other, |acc, x| *acc += scale * x)
    }

    /// Performs `self -= other`.
    ///
    /// # Arguments
    /// * `other` - The buffer to subtract.
    ///
    /// # Returns
    /// A `DimensionMismatch` error if the lengths differ.
    pub fn sub(&mut self, other: &[f32]) -> Result<()> {
        self.zip_with(other, |acc, x| *acc -= x)
    }

    /// Overwrites this buffer with `other`.
    ///
    /// # Arguments
    /// * `other` - The buffer to copy from.
    ///
    /// # Returns
    /// A `DimensionMismatch` error if the lengths differ.
    pub fn copy_from(&mut self, other: &[f32]) -> Result<()> {
        self.check_len(other.len())?;
        self.0.copy_from_slice(other);
        Ok(())
    }

    /// Sets every coordinate to zero.
    pub fn zero(&mut self) {
        self.0.fill(0.);
    }

    /// Consumes the buffer returning its coordinates.
    pub fn into_vec(self) -> Vec<f32> {
        self.0.into_vec()
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if self.0.len() != got {
            return Err(ServerErr::DimensionMismatch {
                expected: self.0.len(),
                got,
            });
        }

        Ok(())
    }

    fn zip_with<F>(&mut self, other: &[f32], op: F) -> Result<()>
    where
        F: Fn(&mut f32, f32) + Send + Sync,
    {
        self.check_len(other.len())?;

        self.0
            .par_chunks_mut(CHUNK_SIZE)
            .zip(other.par_chunks(CHUNK_SIZE))
            .for_each(|(dst, src)| dst.iter_mut().zip(src).for_each(|(d, s)| op(d, *s)));

        Ok(())
    }
}

impl From<Vec<f32>> for VectorBuffer {
    fn from(value: Vec<f32>) -> Self {
        Self(value.into_boxed_slice())
    }
}

impl Deref for VectorBuffer {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
