//! Dense Stage
//!
//! Building block shared by the policy and value networks: a linear map,
//! optional layer normalization, ReLU and optional dropout.

use burn::module::Param;
use burn::nn::{
    Dropout, DropoutConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig, Relu,
};
use burn::prelude::*;

/// Shape and extras of one dense stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub d_input: usize,
    pub d_output: usize,
    pub normalize: bool,
    pub dropout: bool,
}

impl StageSpec {
    /// Linear + layer norm + ReLU
    pub const fn normalized(d_input: usize, d_output: usize) -> Self {
        Self {
            d_input,
            d_output,
            normalize: true,
            dropout: false,
        }
    }

    /// Linear + ReLU
    pub const fn plain(d_input: usize, d_output: usize) -> Self {
        Self {
            d_input,
            d_output,
            normalize: false,
            dropout: false,
        }
    }

    pub const fn with_dropout(mut self) -> Self {
        self.dropout = true;
        self
    }

    /// Initialize the stage; dropout is only added for a positive probability
    pub fn init<B: Backend>(&self, dropout: f64, device: &B::Device) -> DenseStage<B> {
        DenseStage {
            linear: xavier_linear(self.d_input, self.d_output, device),
            norm: self
                .normalize
                .then(|| LayerNormConfig::new(self.d_output).init(device)),
            dropout: (self.dropout && dropout > 0.0).then(|| DropoutConfig::new(dropout).init()),
            activation: Relu::new(),
        }
    }
}

/// One hidden stage of a network
#[derive(Module, Debug)]
pub struct DenseStage<B: Backend> {
    linear: Linear<B>,
    norm: Option<LayerNorm<B>>,
    dropout: Option<Dropout>,
    activation: Relu,
}

impl<B: Backend> DenseStage<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = self.activation.forward(x);
        // Dropout is a no-op outside autodiff backends
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }
}

/// Linear layer with Xavier-uniform weights and zero bias
pub fn xavier_linear<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output)
        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
        .init(device);
    linear.bias = Some(Param::from_tensor(Tensor::zeros([d_output], device)));
    linear
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_xavier_linear_has_zero_bias_and_bounded_weights() {
        let device = Default::default();
        let linear: Linear<TestBackend> = xavier_linear(20, 8, &device);

        let bias: Vec<f32> = linear
            .bias
            .as_ref()
            .unwrap()
            .val()
            .to_data()
            .iter::<f32>()
            .collect();
        assert!(bias.iter().all(|&b| b == 0.0));

        let limit = (6.0f32 / (20.0 + 8.0)).sqrt();
        let weights: Vec<f32> = linear.weight.val().to_data().iter::<f32>().collect();
        assert!(weights.iter().all(|w| w.abs() <= limit + 1e-6));
        assert!(weights.iter().any(|&w| w != 0.0));
    }

    #[test]
    fn test_stage_output_is_non_negative() {
        let device = Default::default();
        let stage: DenseStage<TestBackend> =
            StageSpec::normalized(4, 6).with_dropout().init(0.1, &device);

        let x = Tensor::<TestBackend, 2>::random(
            [3, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let out = stage.forward(x);

        assert_eq!(out.dims(), [3, 6]);
        assert!(out.to_data().iter::<f32>().all(|v| v >= 0.0));
    }
}
