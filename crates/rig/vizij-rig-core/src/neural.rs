//! Small feed-forward networks driving the ML control region.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::definition::NeuralNetworkData;
use crate::error::{RigError, RigResult};

/// Layer activation kinds that can appear in rig data. Only `Linear` and `Relu`
/// are evaluated; the others fail with [`RigError::UnsupportedActivation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationFunction {
    Linear,
    Relu,
    LeakyRelu,
    Tanh,
    Sigmoid,
}

#[derive(Clone, Debug)]
pub struct NetworkLayer {
    weights: DMatrix<f64>,
    biases: DVector<f64>,
    activation: ActivationFunction,
    activation_params: Vec<f64>,
}

impl NetworkLayer {
    #[inline]
    pub fn weights(&self) -> &DMatrix<f64> {
        &self.weights
    }

    #[inline]
    pub fn biases(&self) -> &DVector<f64> {
        &self.biases
    }

    #[inline]
    pub fn activation(&self) -> ActivationFunction {
        self.activation
    }

    #[inline]
    pub fn activation_params(&self) -> &[f64] {
        &self.activation_params
    }
}

/// Output of one network evaluation. `jacobian` is `outputs x inputs` in the
/// network's own input order.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkOutput {
    pub values: DVector<f64>,
    pub jacobian: Option<DMatrix<f64>>,
}

#[derive(Clone, Debug)]
pub struct NeuralNetwork {
    input_indices: Vec<usize>,
    output_indices: Vec<usize>,
    layers: Vec<NetworkLayer>,
    /// `(control index, network input)` sorted by control index.
    sorted_inputs: Vec<(usize, usize)>,
}

impl NeuralNetwork {
    /// Build network `index` from rig data. Inputs must address the control
    /// vector (`< total_count`), outputs must fall in `ml_region`.
    pub fn from_data(
        index: usize,
        data: &NeuralNetworkData,
        total_count: usize,
        ml_region: Range<usize>,
    ) -> RigResult<Self> {
        let input_indices: Vec<usize> = data.input_indices.iter().map(|&i| i as usize).collect();
        let output_indices: Vec<usize> =
            data.output_indices.iter().map(|&i| i as usize).collect();

        if let Some(&bad) = input_indices.iter().find(|&&i| i >= total_count) {
            return Err(RigError::config(format!(
                "neural network {index} reads control {bad}, control count is {total_count}"
            )));
        }
        if let Some(&bad) = output_indices.iter().find(|&&i| !ml_region.contains(&i)) {
            return Err(RigError::config(format!(
                "neural network {index} writes control {bad} outside the ml region {ml_region:?}"
            )));
        }
        if data.layers.is_empty() {
            return Err(RigError::config(format!(
                "neural network {index} has no layers"
            )));
        }

        let mut layers = Vec::with_capacity(data.layers.len());
        let mut width = input_indices.len();
        for (layer_index, layer) in data.layers.iter().enumerate() {
            let outputs = layer.biases.len();
            if layer.weights.len() != outputs * width {
                return Err(RigError::config(format!(
                    "neural network {index} layer {layer_index}: {} weights for a {outputs}x{width} layer",
                    layer.weights.len()
                )));
            }
            let weights = DMatrix::from_row_iterator(
                outputs,
                width,
                layer.weights.iter().map(|&w| w as f64),
            );
            layers.push(NetworkLayer {
                weights,
                biases: DVector::from_iterator(outputs, layer.biases.iter().map(|&b| b as f64)),
                activation: layer.activation,
                activation_params: layer.activation_params.iter().map(|&p| p as f64).collect(),
            });
            width = outputs;
        }
        if width != output_indices.len() {
            return Err(RigError::config(format!(
                "neural network {index} produces {width} values for {} outputs",
                output_indices.len()
            )));
        }

        let mut sorted_inputs: Vec<(usize, usize)> = input_indices
            .iter()
            .enumerate()
            .map(|(net_input, &control)| (control, net_input))
            .collect();
        sorted_inputs.sort_unstable();

        Ok(Self {
            input_indices,
            output_indices,
            layers,
            sorted_inputs,
        })
    }

    #[inline]
    pub fn input_indices(&self) -> &[usize] {
        &self.input_indices
    }

    #[inline]
    pub fn output_indices(&self) -> &[usize] {
        &self.output_indices
    }

    #[inline]
    pub fn layers(&self) -> &[NetworkLayer] {
        &self.layers
    }

    #[inline]
    pub fn sorted_inputs(&self) -> &[(usize, usize)] {
        &self.sorted_inputs
    }

    /// Forward pass over the inputs gathered from `controls`. `network` only
    /// labels errors.
    pub fn evaluate(
        &self,
        network: usize,
        controls: &DVector<f64>,
        with_jacobian: bool,
    ) -> RigResult<NetworkOutput> {
        let mut x = DVector::from_iterator(
            self.input_indices.len(),
            self.input_indices.iter().map(|&i| controls[i]),
        );
        let mut jacobian = with_jacobian.then(|| DMatrix::identity(x.len(), x.len()));

        for (layer_index, layer) in self.layers.iter().enumerate() {
            let mut y = &layer.weights * &x + &layer.biases;
            if let Some(j) = jacobian.as_mut() {
                *j = &layer.weights * &*j;
            }
            match layer.activation {
                ActivationFunction::Linear => {}
                ActivationFunction::Relu => {
                    for row in 0..y.len() {
                        if y[row] < 0.0 {
                            y[row] = 0.0;
                            if let Some(j) = jacobian.as_mut() {
                                j.row_mut(row).fill(0.0);
                            }
                        }
                    }
                }
                kind => {
                    return Err(RigError::UnsupportedActivation {
                        network,
                        layer: layer_index,
                        kind,
                    })
                }
            }
            x = y;
        }

        Ok(NetworkOutput {
            values: x,
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NeuralNetworkLayerData;

    fn layer(
        weights: &[f32],
        biases: &[f32],
        activation: ActivationFunction,
    ) -> NeuralNetworkLayerData {
        NeuralNetworkLayerData {
            weights: weights.to_vec(),
            biases: biases.to_vec(),
            activation,
            activation_params: Vec::new(),
        }
    }

    fn network(layers: Vec<NeuralNetworkLayerData>) -> NeuralNetworkData {
        NeuralNetworkData {
            input_indices: vec![1, 0],
            output_indices: vec![4, 5],
            layers,
        }
    }

    #[test]
    fn linear_layer_is_affine_with_weight_jacobian() {
        let data = network(vec![layer(
            &[1.0, 2.0, 0.0, -1.0],
            &[0.5, 0.0],
            ActivationFunction::Linear,
        )]);
        let net = NeuralNetwork::from_data(0, &data, 6, 4..6).unwrap();
        // inputs gathered as [c1, c0] = [3, 1]
        let controls = DVector::from_vec(vec![1.0, 3.0, 0.0, 0.0, 0.0, 0.0]);
        let out = net.evaluate(0, &controls, true).unwrap();
        assert_eq!(out.values.as_slice(), &[5.5, -1.0]);
        let j = out.jacobian.unwrap();
        assert_eq!(j[(0, 1)], 2.0);
        assert_eq!(j[(1, 1)], -1.0);
        assert_eq!(net.sorted_inputs(), &[(0, 1), (1, 0)]);
    }

    #[test]
    fn relu_zeroes_negative_outputs_and_their_jacobian_rows() {
        let data = network(vec![layer(
            &[1.0, 0.0, 0.0, 1.0],
            &[0.0, -10.0],
            ActivationFunction::Relu,
        )]);
        let net = NeuralNetwork::from_data(0, &data, 6, 4..6).unwrap();
        let controls = DVector::from_vec(vec![2.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let out = net.evaluate(0, &controls, true).unwrap();
        assert_eq!(out.values.as_slice(), &[1.0, 0.0]);
        let j = out.jacobian.unwrap();
        assert_eq!(j[(0, 0)], 1.0);
        assert!(j.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn jacobian_chains_through_layers() {
        let data = network(vec![
            layer(&[2.0, 0.0, 0.0, 3.0], &[0.0, 0.0], ActivationFunction::Linear),
            layer(&[1.0, 1.0, 0.0, 1.0], &[0.0, 0.0], ActivationFunction::Linear),
        ]);
        let net = NeuralNetwork::from_data(0, &data, 6, 4..6).unwrap();
        let out = net.evaluate(0, &DVector::zeros(6), true).unwrap();
        let j = out.jacobian.unwrap();
        assert_eq!(j[(0, 0)], 2.0);
        assert_eq!(j[(0, 1)], 3.0);
        assert_eq!(j[(1, 1)], 3.0);
    }

    #[test]
    fn unsupported_activation_is_reported_at_evaluation() {
        let data = network(vec![layer(
            &[1.0, 0.0, 0.0, 1.0],
            &[0.0, 0.0],
            ActivationFunction::Tanh,
        )]);
        let net = NeuralNetwork::from_data(3, &data, 6, 4..6).unwrap();
        let err = net.evaluate(3, &DVector::zeros(6), false).unwrap_err();
        assert_eq!(
            err,
            RigError::UnsupportedActivation {
                network: 3,
                layer: 0,
                kind: ActivationFunction::Tanh
            }
        );
    }

    #[test]
    fn rejects_outputs_outside_ml_region_and_bad_shapes() {
        let identity = layer(&[1.0, 0.0, 0.0, 1.0], &[0.0, 0.0], ActivationFunction::Linear);
        let data = network(vec![identity]);
        assert!(NeuralNetwork::from_data(0, &data, 6, 2..4).is_err());
        let short = network(vec![layer(&[1.0], &[0.0, 0.0], ActivationFunction::Linear)]);
        assert!(NeuralNetwork::from_data(0, &short, 6, 4..6).is_err());
    }

    #[test]
    fn activation_names_round_trip_through_serde() {
        let kind: ActivationFunction = serde_json::from_str("\"leakyRelu\"").unwrap();
        assert_eq!(kind, ActivationFunction::LeakyRelu);
        assert_eq!(serde_json::to_string(&ActivationFunction::Relu).unwrap(), "\"relu\"");
    }
}
