//! LSTM over `(batch, time, channel)` amplitude sequences.
//!
//! The network reads one multi-channel sample per time step and predicts the
//! next one: an LSTM layer followed by a linear projection from the hidden
//! width back to the channel count.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig, LstmState};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Forward pass over a sequence with optional carried recurrent state.
pub trait SequenceModel<B: Backend> {
    /// Recurrent state handed from one call to the next.
    type State;

    /// Width of every input and output step.
    fn channels(&self) -> usize;

    /// Map `[batch, time, channels]` inputs to predictions of the same shape,
    /// starting from `state` (zeros when `None`).
    fn forward_sequence(
        &self,
        input: Tensor<B, 3>,
        state: Option<Self::State>,
    ) -> (Tensor<B, 3>, Self::State);
}

/// Hyperparameters needed to rebuild an [`LstmModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LstmModelConfig {
    /// Input and output width.
    pub channels: usize,
    /// Width of the hidden and cell state.
    pub hidden_size: usize,
    /// Time steps per training example, when trained from a fixed corpus.
    pub unroll_length: Option<usize>,
}

impl LstmModelConfig {
    pub fn new(channels: usize, hidden_size: usize) -> Self {
        Self {
            channels,
            hidden_size,
            unroll_length: None,
        }
    }

    pub fn with_unroll_length(mut self, unroll_length: usize) -> Self {
        self.unroll_length = Some(unroll_length);
        self
    }

    /// Initialize a model with fresh parameters on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LstmModel<B> {
        LstmModel {
            lstm: LstmConfig::new(self.channels, self.hidden_size, true).init(device),
            projection: LinearConfig::new(self.hidden_size, self.channels).init(device),
        }
    }
}

/// Next-sample predictor.
#[derive(Module, Debug)]
pub struct LstmModel<B: Backend> {
    lstm: Lstm<B>,
    projection: Linear<B>,
}

impl<B: Backend> SequenceModel<B> for LstmModel<B> {
    type State = LstmState<B, 2>;

    fn channels(&self) -> usize {
        self.projection.weight.val().dims()[1]
    }

    fn forward_sequence(
        &self,
        input: Tensor<B, 3>,
        state: Option<Self::State>,
    ) -> (Tensor<B, 3>, Self::State) {
        let (hidden, state) = self.lstm.forward(input, state);
        (self.projection.forward(hidden), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f64>;

    fn ramp(device: &NdArrayDevice, batch: usize, steps: usize, channels: usize) -> Tensor<TestBackend, 3> {
        let values: Vec<f64> = (0..batch * steps * channels)
            .map(|i| (i as f64) / 100.0)
            .collect();
        Tensor::from_data(TensorData::new(values, [batch, steps, channels]), device)
    }

    #[test]
    fn output_matches_input_shape() {
        let device = NdArrayDevice::default();
        let model = LstmModelConfig::new(2, 8).init::<TestBackend>(&device);
        assert_eq!(model.channels(), 2);

        let (out, state) = model.forward_sequence(ramp(&device, 3, 5, 2), None);
        assert_eq!(out.dims(), [3, 5, 2]);
        assert_eq!(state.hidden.dims(), [3, 8]);
        assert_eq!(state.cell.dims(), [3, 8]);
    }

    #[test]
    fn carried_state_equals_one_long_pass() {
        let device = NdArrayDevice::default();
        let model = LstmModelConfig::new(2, 4).init::<TestBackend>(&device);
        let input = ramp(&device, 1, 6, 2);

        let (full, _) = model.forward_sequence(input.clone(), None);
        let (_, state) = model.forward_sequence(input.clone().narrow(1, 0, 4), None);
        let (tail, _) = model.forward_sequence(input.narrow(1, 4, 2), Some(state));

        let expected = full.narrow(1, 4, 2).into_data().to_vec::<f64>().unwrap();
        let actual = tail.into_data().to_vec::<f64>().unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-9, "{a} vs {e}");
        }
    }
}
