//! Policy Network (Actor)
//!
//! Deterministic policy mapping market states to bounded actions.

use burn::nn::Linear;
use burn::prelude::*;

use super::stage::{xavier_linear, DenseStage, StageSpec};

/// Policy network configuration
#[derive(Config, Debug)]
pub struct PolicyNetworkConfig {
    /// Input dimension (state features)
    pub state_dim: usize,
    /// Output dimension (action components)
    pub action_dim: usize,
    /// Hidden layer width
    #[config(default = "256")]
    pub hidden_dim: usize,
    /// Dropout probability after the first two stages
    #[config(default = "0.1")]
    pub dropout: f64,
}

impl PolicyNetworkConfig {
    /// Hidden stages in forward order
    pub fn stages(&self) -> Vec<StageSpec> {
        let hidden = self.hidden_dim;
        vec![
            StageSpec::normalized(self.state_dim, hidden).with_dropout(),
            StageSpec::normalized(hidden, hidden).with_dropout(),
            StageSpec::normalized(hidden, hidden / 2),
        ]
    }

    /// Initialize the policy network
    pub fn init<B: Backend>(&self, device: &B::Device) -> PolicyNetwork<B> {
        let stages = self
            .stages()
            .iter()
            .map(|spec| spec.init(self.dropout, device))
            .collect();
        let head = xavier_linear(self.hidden_dim / 2, self.action_dim, device);

        PolicyNetwork { stages, head }
    }
}

/// Policy network with a tanh output layer
#[derive(Module, Debug)]
pub struct PolicyNetwork<B: Backend> {
    stages: Vec<DenseStage<B>>,
    head: Linear<B>,
}

impl<B: Backend> PolicyNetwork<B> {
    /// Forward pass returning actions in [-1, 1]
    pub fn forward(&self, state: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = self
            .stages
            .iter()
            .fold(state, |x, stage| stage.forward(x));
        self.head.forward(hidden).tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_policy_output_shape_and_bounds() {
        let device = Default::default();
        let policy: PolicyNetwork<TestBackend> =
            PolicyNetworkConfig::new(20, 2).with_hidden_dim(32).init(&device);

        let state = Tensor::<TestBackend, 2>::random([8, 20], Distribution::Normal(0.0, 10.0), &device);
        let actions = policy.forward(state);

        assert_eq!(actions.dims(), [8, 2]);
        assert!(actions
            .to_data()
            .iter::<f32>()
            .all(|a| (-1.0..=1.0).contains(&a)));
    }

    #[test]
    fn test_policy_layout() {
        let config = PolicyNetworkConfig::new(20, 2).with_hidden_dim(64);
        let stages = config.stages();

        assert_eq!(stages.len(), 3);
        assert_eq!(stages[2].d_output, 32);
        assert!(stages[0].dropout && stages[1].dropout && !stages[2].dropout);
    }
}
