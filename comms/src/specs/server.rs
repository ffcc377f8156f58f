use serde::{Deserialize, Serialize};

/// The specification for the random distribution of a `RandParamGen`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionSpec {
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
    XavierUniform { fan_in: usize, fan_out: usize },
    Kaiming { fan_in: usize },
}

/// The specification for the `ParamGen` that builds the initial model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGenSpec {
    Const { value: f32 },
    Rand { distribution: DistributionSpec },
}

impl Default for ParamGenSpec {
    fn default() -> Self {
        Self::Const { value: 0. }
    }
}

/// The specification for the periodic checkpoint schedule.
///
/// A checkpoint fires on a message from `primary_rank` whenever the highest version seen so far
/// satisfies `max_version % period == phase` and the message's own version is past `warmup`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSpec {
    pub primary_rank: usize,
    pub period: u64,
    pub phase: u64,
    pub warmup: u64,
}

impl Default for CheckpointSpec {
    fn default() -> Self {
        Self {
            primary_rank: 1,
            period: 100,
            phase: 1,
            warmup: 20,
        }
    }
}

/// The specification for the `SparseFilter` selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    /// Keeps the `ceil(len * rate)` largest coordinates by magnitude.
    #[default]
    TopK,
    /// Keeps the largest coordinates until `rate` of the total absolute mass is covered.
    MagnitudeMass,
}

/// The specification for the server side sparsification of outbound residuals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsificationSpec {
    pub filter: FilterSpec,
    pub retention_rate: f32,
}

impl Default for SparsificationSpec {
    fn default() -> Self {
        Self {
            filter: FilterSpec::TopK,
            retention_rate: 0.02,
        }
    }
}

fn default_learning_rate() -> f32 {
    0.1
}

/// The specification for the `Server` trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// The world size, workers hold ranks `1..workers`.
    pub workers: usize,
    /// The amount of parameters of the flattened model.
    pub params: usize,
    #[serde(default)]
    pub checkpoint: CheckpointSpec,
    #[serde(default)]
    pub sparsification: SparsificationSpec,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub param_gen: ParamGenSpec,
    #[serde(default)]
    pub seed: Option<u64>,
}
