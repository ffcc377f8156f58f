use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::ParamGen;
use crate::error::{Result, ServerErr};

fn invalid_distribution(err: impl ToString) -> ServerErr {
    ServerErr::InvalidSpec(err.to_string())
}

fn check_fan(fan: usize) -> Result<()> {
    if fan == 0 {
        return Err(ServerErr::InvalidSpec("fan must be at least 1".into()));
    }

    Ok(())
}

/// A parameter generator that follows a certain probabilistic distribution.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: R,
    distribution: D,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample the random numbers from.
    pub fn new(rng: R, distribution: D) -> Self {
        Self { rng, distribution }
    }
}

impl<R: Rng> RandParamGen<R, Uniform<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An `InvalidSpec` error if the range is invalid (low >= high).
    pub fn uniform(rng: R, low: f32, high: f32) -> Result<Self> {
        let distribution = Uniform::new(low, high).map_err(invalid_distribution)?;
        Ok(Self::new(rng, distribution))
    }

    /// Creates a new `RandParamGen` parameter generator using Xavier uniform initialization.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `fan_in` - The number of input units in the weight tensor.
    /// * `fan_out` - The number of output units in the weight tensor.
    ///
    /// # Returns
    /// An `InvalidSpec` error if both fans are zero.
    pub fn xavier_uniform(rng: R, fan_in: usize, fan_out: usize) -> Result<Self> {
        check_fan(fan_in + fan_out)?;
        let range = (6. / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(rng, -range, range)
    }
}

impl<R: Rng> RandParamGen<R, Normal<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a normal distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An `InvalidSpec` error if `std_dev` is negative or Nan.
    pub fn normal(rng: R, mean: f32, std_dev: f32) -> Result<Self> {
        let distribution = Normal::new(mean, std_dev).map_err(invalid_distribution)?;
        Ok(Self::new(rng, distribution))
    }

    /// Creates a new `RandParamGen` parameter generator using Kaiming normal initialization.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `fan_in` - The number of input units in the weight tensor.
    ///
    /// # Returns
    /// An `InvalidSpec` error if `fan_in` is zero.
    pub fn kaiming(rng: R, fan_in: usize) -> Result<Self> {
        check_fan(fan_in)?;
        let std_dev = (2. / fan_in as f32).sqrt();
        Self::normal(rng, 0., std_dev)
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<R, D> {
    fn generate(&mut self, n: usize) -> Vec<f32> {
        let Self { rng, distribution } = self;
        (0..n).map(|_| distribution.sample(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn seeded_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn exact() {
        const SIZE: usize = 10;

        let mut param_gen = RandParamGen::uniform(seeded_rng(), -1., 1.).unwrap();
        let sample = param_gen.generate(SIZE);

        assert_eq!(sample.len(), SIZE);
        assert!(sample.iter().all(|x| (-1. ..1.).contains(x)));
    }

    #[test]
    fn seeded_is_reproducible() {
        let first = RandParamGen::normal(seeded_rng(), 0., 1.).unwrap().generate(16);
        let second = RandParamGen::normal(seeded_rng(), 0., 1.).unwrap().generate(16);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_ranges() {
        assert!(RandParamGen::uniform(seeded_rng(), 1., -1.).is_err());
        assert!(RandParamGen::normal(seeded_rng(), 0., -1.).is_err());
        assert!(RandParamGen::xavier_uniform(seeded_rng(), 0, 0).is_err());
        assert!(RandParamGen::kaiming(seeded_rng(), 0).is_err());
    }
}
