use ndarray::{Array1, Array2, Axis, Zip};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};

/// One fully connected layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Weight matrix shaped `(inputs, units)`.
    pub weights: Array2<f32>,
    /// Bias per unit.
    pub bias: Array1<f32>,
}

impl DenseLayer {
    fn he_uniform(rng: &mut SmallRng, inputs: usize, units: usize) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let limit = (6.0 / inputs.max(1) as f32).sqrt();
        Self {
            weights: Array2::from_shape_fn((inputs, units), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(units),
        }
    }

    fn units(&self) -> usize {
        self.bias.len()
    }
}

/// Feed-forward price regressor: ReLU hidden layers and one linear output.
///
/// Inputs are standardized with statistics learned from the training split and
/// targets are divided by their training mean, so the stored network serves raw
/// encoder output and returns prices directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceNetwork {
    layers: Vec<DenseLayer>,
    feature_mean: Array1<f32>,
    feature_std: Array1<f32>,
    target_scale: f32,
}

impl PriceNetwork {
    /// Creates a network with He-uniform weights drawn from `seed`.
    #[must_use]
    pub fn new(input_width: usize, hidden: &[usize], seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut inputs = input_width;
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        for &units in hidden.iter().chain(std::iter::once(&1)) {
            layers.push(DenseLayer::he_uniform(&mut rng, inputs, units.max(1)));
            inputs = units.max(1);
        }
        Self {
            layers,
            feature_mean: Array1::zeros(input_width),
            feature_std: Array1::ones(input_width),
            target_scale: 1.0,
        }
    }

    /// Width of the feature vectors the network accepts.
    #[must_use]
    pub fn input_width(&self) -> usize {
        self.feature_mean.len()
    }

    /// Units per hidden layer.
    #[must_use]
    pub fn hidden_units(&self) -> Vec<usize> {
        self.layers[..self.layers.len().saturating_sub(1)]
            .iter()
            .map(DenseLayer::units)
            .collect()
    }

    /// Learns input standardization and target scale from training data.
    pub fn fit_normalization(&mut self, x: &Array2<f32>, y: &Array1<f32>) {
        if x.nrows() == 0 {
            return;
        }
        if let Some(mean) = x.mean_axis(Axis(0)) {
            self.feature_mean = mean;
        }
        self.feature_std = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std.is_finite() && std > 1e-6 { std } else { 1.0 });
        self.target_scale = y
            .mean()
            .filter(|mean| mean.is_finite() && *mean > 0.0)
            .unwrap_or(1.0);
    }

    /// Applies the stored standardization.
    #[must_use]
    pub fn standardize(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut scaled = x.to_owned();
        scaled -= &self.feature_mean;
        scaled /= &self.feature_std;
        scaled
    }

    /// Targets divided by the stored scale.
    #[must_use]
    pub fn scale_targets(&self, y: &Array1<f32>) -> Array1<f32> {
        y.mapv(|value| value / self.target_scale)
    }

    /// Checks that layer shapes chain from the input width to one output unit.
    pub fn validate(&self) -> MonitorResult<()> {
        let shape_error = |detail: String| Err(MonitorError::ShapeMismatch(detail));
        if self.layers.is_empty() {
            return shape_error("network has no layers".into());
        }
        if self.feature_std.len() != self.feature_mean.len() {
            return shape_error(format!(
                "standardization has {} means but {} deviations",
                self.feature_mean.len(),
                self.feature_std.len()
            ));
        }
        if !(self.target_scale.is_finite() && self.target_scale > 0.0) {
            return shape_error(format!("target scale {} is not positive", self.target_scale));
        }
        let mut inputs = self.input_width();
        for (idx, layer) in self.layers.iter().enumerate() {
            let (rows, cols) = layer.weights.dim();
            if rows != inputs || cols != layer.units() {
                return shape_error(format!(
                    "layer {idx} weights are {rows}x{cols}, expected {inputs}x{}",
                    layer.units()
                ));
            }
            inputs = cols;
        }
        if inputs == 1 {
            Ok(())
        } else {
            shape_error(format!("output layer has {inputs} units"))
        }
    }

    fn ensure_width(&self, x: &Array2<f32>) -> MonitorResult<()> {
        if x.ncols() == self.input_width() {
            Ok(())
        } else {
            Err(MonitorError::ShapeMismatch(format!(
                "network expects {} features, got {}",
                self.input_width(),
                x.ncols()
            )))
        }
    }

    /// Activations of every layer for already standardized input; the first
    /// entry is the input itself.
    fn propagate(&self, input: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_owned());
        let last = self.layers.len().saturating_sub(1);
        for (idx, layer) in self.layers.iter().enumerate() {
            let mut z = activations[idx].dot(&layer.weights);
            z += &layer.bias;
            if idx < last {
                z.mapv_inplace(|v| v.max(0.0));
            }
            activations.push(z);
        }
        activations
    }

    /// Predicted prices for raw encoder output.
    pub fn predict(&self, x: &Array2<f32>) -> MonitorResult<Array1<f32>> {
        self.validate()?;
        self.ensure_width(x)?;
        let activations = self.propagate(&self.standardize(x));
        let scale = self.target_scale;
        Ok(activations
            .last()
            .map(|output| output.column(0).mapv(|v| v * scale))
            .unwrap_or_else(|| Array1::zeros(x.nrows())))
    }

    /// One optimizer step on a standardized batch with scaled targets.
    /// Returns the batch MAPE before the update.
    #[allow(clippy::cast_precision_loss)]
    pub fn train_batch(&mut self, x: &Array2<f32>, y: &Array1<f32>, optimizer: &mut Adam) -> f32 {
        let rows = x.nrows();
        if rows == 0 {
            return 0.0;
        }
        let activations = self.propagate(x);
        let Some(output) = activations.last() else {
            return 0.0;
        };
        let n = rows as f32;
        let mut loss = 0.0;
        let mut delta = Array2::<f32>::zeros((rows, 1));
        for (row, (&target, &predicted)) in y.iter().zip(output.column(0).iter()).enumerate() {
            let diff = predicted - target;
            loss += diff.abs() / target;
            delta[[row, 0]] = diff.signum() / target / n;
        }

        optimizer.advance();
        for idx in (0..self.layers.len()).rev() {
            let inputs = &activations[idx];
            let grad_w = inputs.t().dot(&delta);
            let grad_b = delta.sum_axis(Axis(0));
            if idx > 0 {
                let mut upstream = delta.dot(&self.layers[idx].weights.t());
                Zip::from(&mut upstream)
                    .and(inputs)
                    .for_each(|g, &a| {
                        if a <= 0.0 {
                            *g = 0.0;
                        }
                    });
                delta = upstream;
            }
            optimizer.apply(idx, &mut self.layers[idx], &grad_w, &grad_b);
        }
        loss / n
    }
}

#[derive(Debug, Clone)]
struct Moments {
    weights_m: Array2<f32>,
    weights_v: Array2<f32>,
    bias_m: Array1<f32>,
    bias_v: Array1<f32>,
}

/// Adam optimizer state for one [`PriceNetwork`].
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    moments: Vec<Moments>,
}

impl Adam {
    /// Zeroed moments shaped after `network`.
    #[must_use]
    pub fn new(network: &PriceNetwork, learning_rate: f32) -> Self {
        let moments = network
            .layers
            .iter()
            .map(|layer| Moments {
                weights_m: Array2::zeros(layer.weights.raw_dim()),
                weights_v: Array2::zeros(layer.weights.raw_dim()),
                bias_m: Array1::zeros(layer.bias.len()),
                bias_v: Array1::zeros(layer.bias.len()),
            })
            .collect();
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            moments,
        }
    }

    fn advance(&mut self) {
        self.step = self.step.saturating_add(1);
    }

    fn apply(&mut self, idx: usize, layer: &mut DenseLayer, grad_w: &Array2<f32>, grad_b: &Array1<f32>) {
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr = self.learning_rate * (1.0 - b2.powi(self.step)).sqrt() / (1.0 - b1.powi(self.step));
        let moments = &mut self.moments[idx];

        Zip::from(&mut layer.weights)
            .and(&mut moments.weights_m)
            .and(&mut moments.weights_v)
            .and(grad_w)
            .for_each(|w, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *w -= lr * *m / (v.sqrt() + eps);
            });
        Zip::from(&mut layer.bias)
            .and(&mut moments.bias_m)
            .and(&mut moments.bias_v)
            .and(grad_b)
            .for_each(|b, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *b -= lr * *m / (v.sqrt() + eps);
            });
    }
}
