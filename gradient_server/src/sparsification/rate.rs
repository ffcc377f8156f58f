use crate::error::{Result, ServerErr};

/// The fraction of a buffer kept by a sparsification pass, always in `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RetentionRate(f32);

impl RetentionRate {
    /// Keeps everything, encoding is lossless at this rate.
    pub const FULL: Self = Self(1.);

    /// Creates a new `RetentionRate`.
    ///
    /// # Arguments
    /// * `rate` - The fraction to keep.
    ///
    /// # Returns
    /// A new `RetentionRate` or an `InvalidSpec` error if `rate` is outside `(0, 1]`.
    pub fn new(rate: f32) -> Result<Self> {
        if !(rate > 0. && rate <= 1.) {
            return Err(ServerErr::InvalidSpec(format!(
                "retention rate must be in (0, 1], got {rate}"
            )));
        }

        Ok(Self(rate))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}
