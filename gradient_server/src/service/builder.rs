use comms::specs::server::{DistributionSpec, FilterSpec, ParamGenSpec, ServerSpec};
use log::info;
use rand::{SeedableRng, rngs::StdRng};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{GradientServer, ParameterServer, Server};
use crate::{
    error::{Result, ServerErr},
    initialization::{ConstParamGen, ParamGen, RandParamGen},
    sparsification::{MagnitudeMass, RetentionRate, SparseFilter, TopK},
    storage::{GradientWarehouse, VectorBuffer},
    tracking::CheckpointPolicy,
};

/// Resolves the concrete `RandParamGen` for a distribution and hands it to `callback`.
///
/// Every distribution yields a different `RandParamGen` type, so the match arms can't be unified
/// into a single value without boxing.
///
/// # Arguments
/// * `rng` - A random number generator.
/// * `dist_spec` - A specification for a distribution.
/// * `callback` - The closure to call passing in the created param gen.
macro_rules! with_distribution {
    ($rng:expr, $dist_spec:expr, $callback:expr) => {
        match $dist_spec {
            DistributionSpec::Uniform { low, high } => {
                let param_gen = RandParamGen::uniform($rng, low, high)?;
                ($callback)(param_gen)
            }
            DistributionSpec::XavierUniform { fan_in, fan_out } => {
                let param_gen = RandParamGen::xavier_uniform($rng, fan_in, fan_out)?;
                ($callback)(param_gen)
            }
            DistributionSpec::Normal { mean, std_dev } => {
                let param_gen = RandParamGen::normal($rng, mean, std_dev)?;
                ($callback)(param_gen)
            }
            DistributionSpec::Kaiming { fan_in } => {
                let param_gen = RandParamGen::kaiming($rng, fan_in)?;
                ($callback)(param_gen)
            }
        }
    };
}

/// Builds `Server`s given a specification.
#[derive(Debug, Default)]
pub struct ServerBuilder;

impl ServerBuilder {
    /// Creates a new `ServerBuilder`.
    ///
    /// # Returns
    /// A new `ServerBuilder` instance.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Server` following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the gradient server.
    ///
    /// # Returns
    /// A new Server or an `InvalidSpec` error.
    pub fn build<R, W>(&self, spec: ServerSpec) -> Result<Box<dyn Server<R, W>>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.validate(&spec)?;
        let initial = self.resolve_initial_model(&spec)?;
        self.resolve_filter(spec, initial)
    }

    /// Checks the parts of the spec no other component validates.
    fn validate(&self, spec: &ServerSpec) -> Result<()> {
        if spec.workers < 2 {
            return Err(ServerErr::InvalidSpec(format!(
                "at least one worker is needed besides the server, got a world size of {}",
                spec.workers
            )));
        }

        if spec.params == 0 {
            return Err(ServerErr::InvalidSpec("the model can't be empty".into()));
        }

        if u32::try_from(spec.params).is_err() {
            return Err(ServerErr::InvalidSpec(format!(
                "{} parameters can't be addressed by sparse indices",
                spec.params
            )));
        }

        Ok(())
    }

    /// Generates a random number generator given (or not) a seed.
    ///
    /// # Arguments
    /// * `seed` - An optional seed for the rng.
    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    /// Generates the initial model with the spec's `ParamGen`.
    ///
    /// # Arguments
    /// * `spec` - The specification of the gradient server.
    ///
    /// # Returns
    /// The initial model or an `InvalidSpec` error if the distribution is invalid.
    fn resolve_initial_model(&self, spec: &ServerSpec) -> Result<VectorBuffer> {
        let params = match spec.param_gen {
            ParamGenSpec::Const { value } => {
                let param_gen = ConstParamGen::new(value);
                self.generate(param_gen, spec.params)
            }
            ParamGenSpec::Rand { distribution } => {
                let rng = self.generate_rng(spec.seed);
                with_distribution!(rng, distribution, |param_gen| {
                    self.generate(param_gen, spec.params)
                })
            }
        };

        Ok(VectorBuffer::from(params))
    }

    /// Draws `n` parameters from a resolved `ParamGen`.
    fn generate<PG: ParamGen>(&self, mut param_gen: PG, n: usize) -> Vec<f32> {
        param_gen.generate(n)
    }

    /// Resolves the `SparseFilter` for this server.
    ///
    /// # Arguments
    /// * `spec` - The specification of the gradient server.
    /// * `initial` - The initial model.
    ///
    /// # Returns
    /// A new server.
    fn resolve_filter<R, W>(
        &self,
        spec: ServerSpec,
        initial: VectorBuffer,
    ) -> Result<Box<dyn Server<R, W>>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match spec.sparsification.filter {
            FilterSpec::TopK => self.terminate_build(spec, initial, TopK),
            FilterSpec::MagnitudeMass => self.terminate_build(spec, initial, MagnitudeMass),
        }
    }

    /// Terminates the entire build and finally instanciates all the entities.
    ///
    /// # Arguments
    /// * `spec` - The specification of the gradient server.
    /// * `initial` - The initial model.
    /// * `filter` - A resolved sparsification filter.
    ///
    /// # Returns
    /// A new server.
    fn terminate_build<R, W, F>(
        &self,
        spec: ServerSpec,
        initial: VectorBuffer,
        filter: F,
    ) -> Result<Box<dyn Server<R, W>>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: SparseFilter + 'static,
    {
        let rate = RetentionRate::new(spec.sparsification.retention_rate)?;
        let policy = CheckpointPolicy::new(&spec.checkpoint, spec.workers)?;
        let warehouse = GradientWarehouse::new(initial);

        info!(
            workers = spec.workers,
            params = spec.params,
            retention_rate = rate.get();
            "gradient server built"
        );

        let server = GradientServer::new(
            warehouse,
            spec.workers,
            policy,
            filter,
            rate,
            spec.learning_rate,
        );

        Ok(Box::new(ParameterServer::new(server)))
    }
}
