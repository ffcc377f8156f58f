/// A `ParamGen` generates values for the initial state of the model's parameters.
pub trait ParamGen {
    /// Should generate exactly `n` parameters.
    ///
    /// # Arguments
    /// * `n` - The amount of parameters to generate.
    ///
    /// # Returns
    /// The generated parameters.
    fn generate(&mut self, n: usize) -> Vec<f32>;
}
