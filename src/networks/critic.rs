//! Value Network (Critic)
//!
//! Q-function over state-action pairs. States and actions are embedded in
//! separate branches before the joint layers.

use burn::nn::Linear;
use burn::prelude::*;

use super::stage::{xavier_linear, DenseStage, StageSpec};

/// Value network configuration
#[derive(Config, Debug)]
pub struct ValueNetworkConfig {
    /// State features
    pub state_dim: usize,
    /// Action components
    pub action_dim: usize,
    /// Hidden layer width
    #[config(default = "256")]
    pub hidden_dim: usize,
    /// Dropout probability in the first joint stage
    #[config(default = "0.1")]
    pub dropout: f64,
}

impl ValueNetworkConfig {
    fn half(&self) -> usize {
        self.hidden_dim / 2
    }

    /// State branch stages
    pub fn state_stages(&self) -> Vec<StageSpec> {
        let half = self.half();
        vec![
            StageSpec::normalized(self.state_dim, half),
            StageSpec::normalized(half, half),
        ]
    }

    /// Action branch stage
    pub fn action_stage(&self) -> StageSpec {
        StageSpec::plain(self.action_dim, self.half())
    }

    /// Stages applied to the concatenated branches
    pub fn joint_stages(&self) -> Vec<StageSpec> {
        let half = self.half();
        vec![
            StageSpec::normalized(2 * half, self.hidden_dim).with_dropout(),
            StageSpec::normalized(self.hidden_dim, half),
        ]
    }

    /// Initialize the value network
    pub fn init<B: Backend>(&self, device: &B::Device) -> ValueNetwork<B> {
        let build = |specs: Vec<StageSpec>| -> Vec<DenseStage<B>> {
            specs
                .iter()
                .map(|spec| spec.init(self.dropout, device))
                .collect()
        };

        ValueNetwork {
            state_stages: build(self.state_stages()),
            action_stage: self.action_stage().init(self.dropout, device),
            joint_stages: build(self.joint_stages()),
            head: xavier_linear(self.half(), 1, device),
        }
    }
}

/// Q-value estimator
#[derive(Module, Debug)]
pub struct ValueNetwork<B: Backend> {
    state_stages: Vec<DenseStage<B>>,
    action_stage: DenseStage<B>,
    joint_stages: Vec<DenseStage<B>>,
    head: Linear<B>,
}

impl<B: Backend> ValueNetwork<B> {
    /// Forward pass returning one Q-value per row, shape `[batch, 1]`
    pub fn forward(&self, state: Tensor<B, 2>, action: Tensor<B, 2>) -> Tensor<B, 2> {
        let state_features = self
            .state_stages
            .iter()
            .fold(state, |x, stage| stage.forward(x));
        let action_features = self.action_stage.forward(action);

        let combined = Tensor::cat(vec![state_features, action_features], 1);
        let hidden = self
            .joint_stages
            .iter()
            .fold(combined, |x, stage| stage.forward(x));
        self.head.forward(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_value_output_shape() {
        let device = Default::default();
        let value: ValueNetwork<TestBackend> =
            ValueNetworkConfig::new(20, 2).with_hidden_dim(32).init(&device);

        let state = Tensor::<TestBackend, 2>::ones([5, 20], &device);
        let action = Tensor::<TestBackend, 2>::zeros([5, 2], &device);

        assert_eq!(value.forward(state, action).dims(), [5, 1]);
    }

    #[test]
    fn test_branch_widths_meet_at_hidden_dim() {
        let config = ValueNetworkConfig::new(20, 2).with_hidden_dim(64);

        assert_eq!(config.state_stages()[1].d_output, 32);
        assert_eq!(config.action_stage().d_output, 32);
        assert!(!config.action_stage().normalize);
        assert_eq!(config.joint_stages()[0].d_input, 64);
    }
}
