//! Gradient-descent fitting of a W-matrix on paired hidden states.
//!
//! Full-batch descent on the mean squared reconstruction error. After a
//! warm-up phase, every update is followed by pulling each weight matrix
//! towards the nearest scaled orthogonal matrix `s·U·Vᵀ` (from its SVD,
//! `s` = mean singular value), which keeps the map close to norm- and
//! angle-preserving even when widths differ.

use crate::activation::Activation;
use crate::config::AlignmentConfig;
use crate::error::{ProtocolError, Result};
use crate::wmatrix::{Layer, WMatrix};
use nalgebra::{DMatrix, DVector};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A source hidden state and the target model's hidden state for the same input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingPair {
    pub source: Vec<f32>,
    pub target: Vec<f32>,
}

impl TrainingPair {
    pub fn new(source: Vec<f32>, target: Vec<f32>) -> Self {
        Self { source, target }
    }
}

pub(crate) struct FitOutcome {
    pub matrix: WMatrix,
    pub iterations: usize,
    pub converged: bool,
    pub final_loss: f32,
    /// False when too few pairs were supplied to hold any out, in which case
    /// epsilon is measured on the training pairs.
    pub held_out: bool,
    pub information_retention: f32,
}

pub(crate) fn fit<R: Rng + ?Sized>(
    source_model: &str,
    target_model: &str,
    pairs: &[TrainingPair],
    activation: Activation,
    config: &AlignmentConfig,
    rng: &mut R,
) -> Result<FitOutcome> {
    let (source_dim, target_dim) = validate_pairs(pairs)?;

    let mut order: Vec<usize> = (0..pairs.len()).collect();
    order.shuffle(rng);
    let holdout = (pairs.len() as f32 * config.holdout_fraction).floor() as usize;
    let held_out = holdout > 0 && holdout < pairs.len();
    let (train_idx, eval_idx) = if held_out {
        let (eval, train) = order.split_at(holdout);
        (train.to_vec(), eval.to_vec())
    } else {
        (order.clone(), order)
    };

    let init = WMatrix::initialize(
        source_model,
        target_model,
        source_dim,
        target_dim,
        activation,
        config,
        rng,
    )?;
    let mut weights: Vec<DMatrix<f32>> = init.layers().iter().map(to_dmatrix).collect();
    let mut biases: Vec<DVector<f32>> = init
        .layers()
        .iter()
        .map(|l| DVector::from_column_slice(l.bias()))
        .collect();

    let n = train_idx.len();
    let x = DMatrix::from_fn(source_dim, n, |r, c| pairs[train_idx[c]].source[r]);
    let y = DMatrix::from_fn(target_dim, n, |r, c| pairs[train_idx[c]].target[r]);
    let last = weights.len() - 1;
    let lr = config.learning_rate;
    let warmup = (config.max_iterations as f32 * config.warmup_fraction).ceil() as usize;

    let mut iterations = 0;
    let mut converged = false;
    let mut final_loss = f32::INFINITY;

    while iterations < config.max_iterations {
        // Forward pass, keeping pre-activations for the backward pass.
        let mut inputs: Vec<DMatrix<f32>> = Vec::with_capacity(weights.len());
        let mut pre: Vec<DMatrix<f32>> = Vec::with_capacity(weights.len());
        let mut a = x.clone();
        for (l, (w, b)) in weights.iter().zip(biases.iter()).enumerate() {
            let mut z = w * &a;
            for mut col in z.column_iter_mut() {
                col += b;
            }
            inputs.push(a);
            a = if l < last {
                z.map(|v| activation.apply(v))
            } else {
                z.clone()
            };
            pre.push(z);
        }

        let residual = &a - &y;
        final_loss = residual.norm_squared() / (n * target_dim) as f32;
        if !final_loss.is_finite() {
            warn!(iterations, "training diverged; epsilon will report 1.0");
            break;
        }
        if final_loss <= config.tolerance {
            converged = true;
            break;
        }

        // Backward pass. `delta` is dL/dA of the current layer.
        let mut delta = residual / n as f32;
        for l in (0..=last).rev() {
            if l < last {
                let d_act = pre[l].map(|v| activation.derivative(v));
                delta.component_mul_assign(&d_act);
            }
            let grad_w = &delta * inputs[l].transpose();
            let grad_b = delta.column_sum();
            let next = weights[l].transpose() * &delta;

            weights[l] -= grad_w * lr;
            biases[l] -= grad_b * lr;
            if iterations >= warmup {
                project_scaled_orthogonal(&mut weights[l], config.orthogonality);
            }

            delta = next;
        }

        iterations += 1;
    }

    let layers = weights
        .iter()
        .zip(biases.iter())
        .map(|(w, b)| from_dmatrix(w, b))
        .collect::<Result<Vec<_>>>()?;
    let unscored = WMatrix::from_parts(source_model, target_model, activation, layers.clone(), 1.0)?;
    let epsilon = held_out_epsilon(&unscored, pairs, &eval_idx)?;
    let matrix = WMatrix::from_parts(source_model, target_model, activation, layers, epsilon)?;
    let information_retention = information_retention(&matrix, pairs)?;

    debug!(
        source_model,
        target_model,
        iterations,
        converged,
        final_loss,
        epsilon,
        held_out,
        information_retention,
        "training finished"
    );

    Ok(FitOutcome {
        matrix,
        iterations,
        converged,
        final_loss,
        held_out,
        information_retention,
    })
}

fn validate_pairs(pairs: &[TrainingPair]) -> Result<(usize, usize)> {
    let first = pairs
        .first()
        .ok_or_else(|| ProtocolError::EmptySequence("no training pairs".into()))?;
    let (source_dim, target_dim) = (first.source.len(), first.target.len());
    if source_dim == 0 {
        return Err(ProtocolError::InvalidDimension {
            field: "sourceDim",
            value: 0,
        });
    }
    if target_dim == 0 {
        return Err(ProtocolError::InvalidDimension {
            field: "targetDim",
            value: 0,
        });
    }
    for pair in pairs {
        if pair.source.len() != source_dim {
            return Err(ProtocolError::mismatch(source_dim, pair.source.len()));
        }
        if pair.target.len() != target_dim {
            return Err(ProtocolError::mismatch(target_dim, pair.target.len()));
        }
        if pair.source.iter().chain(pair.target.iter()).any(|v| !v.is_finite()) {
            return Err(ProtocolError::NonFiniteValue("training pair".into()));
        }
    }
    Ok((source_dim, target_dim))
}

/// Mean relative reconstruction error `‖f(x) − y‖ / ‖y‖`, clamped to [0, 1].
fn held_out_epsilon(matrix: &WMatrix, pairs: &[TrainingPair], idx: &[usize]) -> Result<f32> {
    let mut total = 0.0_f64;
    for &i in idx {
        let pair = &pairs[i];
        let aligned = matrix.forward(&pair.source)?;
        let err: f32 = aligned
            .iter()
            .zip(pair.target.iter())
            .map(|(a, t)| (a - t) * (a - t))
            .sum::<f32>()
            .sqrt();
        let norm = crate::math::l2_norm(&pair.target).max(1e-12);
        total += (err / norm) as f64;
    }
    let mean = (total / idx.len().max(1) as f64) as f32;
    Ok(if mean.is_finite() { mean.clamp(0.0, 1.0) } else { 1.0 })
}

/// `exp(−KL)` between the normalized singular value spectra of the source
/// vectors and of their aligned images; 1.0 when the map preserves the
/// relative energy of every direction.
fn information_retention(matrix: &WMatrix, pairs: &[TrainingPair]) -> Result<f32> {
    let source = DMatrix::from_fn(pairs.len(), matrix.source_dim(), |r, c| pairs[r].source[c]);
    let aligned_rows = pairs
        .iter()
        .map(|p| matrix.forward(&p.source))
        .collect::<Result<Vec<_>>>()?;
    let aligned = DMatrix::from_fn(pairs.len(), matrix.target_dim(), |r, c| aligned_rows[r][c]);

    let (Some(p), Some(q)) = (normalized_spectrum(source), normalized_spectrum(aligned)) else {
        return Ok(0.0);
    };
    let len = p.len().max(q.len());
    let kl: f64 = (0..len)
        .map(|i| {
            let pi = p.get(i).copied().unwrap_or(0.0);
            let qi = q.get(i).copied().unwrap_or(0.0);
            pi * ((pi + 1e-10) / (qi + 1e-10)).ln()
        })
        .sum();
    let retention = (-kl).exp() as f32;
    Ok(if retention.is_finite() { retention.clamp(0.0, 1.0) } else { 0.0 })
}

/// Singular values in descending order, scaled to sum to one.
fn normalized_spectrum(m: DMatrix<f32>) -> Option<Vec<f64>> {
    let Some(svd) = m.try_svd(false, false, f32::EPSILON * 5.0, 0) else {
        warn!("SVD did not converge; information retention unavailable");
        return None;
    };
    let mut values: Vec<f64> = svd.singular_values.iter().map(|s| *s as f64).collect();
    values.sort_by(|a, b| b.total_cmp(a));
    let total: f64 = values.iter().sum();
    if !(total > 0.0) {
        return None;
    }
    Some(values.into_iter().map(|s| s / total).collect())
}

fn project_scaled_orthogonal(w: &mut DMatrix<f32>, strength: f32) {
    if strength <= 0.0 {
        return;
    }
    let Some(svd) = w.clone().try_svd(true, true, f32::EPSILON * 5.0, 0) else {
        warn!(rows = w.nrows(), cols = w.ncols(), "SVD did not converge; skipping projection");
        return;
    };
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return;
    };
    let scale = svd.singular_values.mean();
    let q = u * v_t * scale;
    if strength >= 1.0 {
        *w = q;
    } else {
        *w = &*w * (1.0 - strength) + q * strength;
    }
}

fn to_dmatrix(layer: &Layer) -> DMatrix<f32> {
    DMatrix::from_row_slice(layer.output_dim(), layer.input_dim(), layer.weights())
}

fn from_dmatrix(w: &DMatrix<f32>, b: &DVector<f32>) -> Result<Layer> {
    let (rows, cols) = w.shape();
    let mut weights = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            weights.push(w[(r, c)]);
        }
    }
    Layer::new(cols, rows, weights, b.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::StandardNormal;

    fn gaussian(rng: &mut StdRng, n: usize) -> Vec<f32> {
        (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
    }

    /// Random orthogonal matrix from the SVD of a Gaussian matrix.
    fn random_rotation(rng: &mut StdRng, d: usize) -> DMatrix<f32> {
        let g = DMatrix::from_fn(d, d, |_, _| rng.sample::<f32, _>(StandardNormal));
        let svd = g.svd(true, true);
        svd.u.unwrap() * svd.v_t.unwrap()
    }

    fn rotated_pairs(rng: &mut StdRng, d: usize, n: usize) -> Vec<TrainingPair> {
        let q = random_rotation(rng, d);
        (0..n)
            .map(|_| {
                let x = gaussian(rng, d);
                let y = &q * DVector::from_column_slice(&x);
                TrainingPair::new(x, y.iter().copied().collect())
            })
            .collect()
    }

    #[test]
    fn test_recovers_rotation() {
        let mut rng = StdRng::seed_from_u64(11);
        let pairs = rotated_pairs(&mut rng, 8, 80);
        let config = AlignmentConfig::default();

        let out = fit("src", "dst", &pairs, Activation::Tanh, &config, &mut rng).unwrap();
        assert_eq!(out.matrix.transformation_path(), vec![8, 8]);
        assert!(out.matrix.epsilon() < 0.01, "epsilon {}", out.matrix.epsilon());
        assert!(out.final_loss < 1e-3);
        assert!(out.held_out);
        // A rotation keeps the singular spectrum intact.
        assert!(out.information_retention > 0.99, "retention {}", out.information_retention);
    }

    #[test]
    fn test_collapsing_map_loses_information() {
        let mut rng = StdRng::seed_from_u64(13);
        // Every target is the same vector, so the aligned spectrum has rank one.
        let pairs: Vec<TrainingPair> = (0..40)
            .map(|_| TrainingPair::new(gaussian(&mut rng, 6), vec![1.0, 0.5, -0.5, 0.25, 0.0, 2.0]))
            .collect();
        let out = fit("a", "b", &pairs, Activation::Tanh, &AlignmentConfig::default(), &mut rng).unwrap();
        assert!(out.information_retention < 0.8, "retention {}", out.information_retention);
    }

    #[test]
    fn test_few_pairs_are_not_held_out() {
        let mut rng = StdRng::seed_from_u64(4);
        let pairs = rotated_pairs(&mut rng, 3, 4);
        let config = AlignmentConfig {
            max_iterations: 20,
            ..Default::default()
        };
        let out = fit("a", "b", &pairs, Activation::Tanh, &config, &mut rng).unwrap();
        assert!(!out.held_out);
        assert!((0.0..=1.0).contains(&out.matrix.epsilon()));
    }

    #[test]
    fn test_rejects_non_finite_pairs() {
        let mut rng = StdRng::seed_from_u64(2);
        let pairs = vec![TrainingPair::new(vec![1.0, f32::NAN], vec![1.0])];
        assert!(matches!(
            fit("a", "b", &pairs, Activation::Tanh, &AlignmentConfig::default(), &mut rng),
            Err(ProtocolError::NonFiniteValue(_))
        ));
    }

    #[test]
    fn test_multi_layer_reports_bounded_epsilon() {
        let mut rng = StdRng::seed_from_u64(3);
        let pairs: Vec<TrainingPair> = (0..40)
            .map(|_| TrainingPair::new(gaussian(&mut rng, 8), gaussian(&mut rng, 12)))
            .collect();
        let config = AlignmentConfig {
            max_iterations: 50,
            ..Default::default()
        };

        let out = fit("a", "b", &pairs, Activation::Gelu, &config, &mut rng).unwrap();
        assert_eq!(out.matrix.transformation_path(), vec![8, 10, 12]);
        let eps = out.matrix.epsilon();
        assert!((0.0..=1.0).contains(&eps));
        assert!(out.iterations <= 50);
    }

    #[test]
    fn test_seeded_training_is_deterministic() {
        let mut data_rng = StdRng::seed_from_u64(5);
        let pairs = rotated_pairs(&mut data_rng, 6, 30);
        let config = AlignmentConfig {
            max_iterations: 40,
            ..Default::default()
        };

        let a = fit("a", "b", &pairs, Activation::Tanh, &config, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = fit("a", "b", &pairs, Activation::Tanh, &config, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.matrix, b.matrix);
    }

    #[test]
    fn test_rejects_bad_pairs() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = AlignmentConfig::default();
        assert!(matches!(
            fit("a", "b", &[], Activation::Tanh, &config, &mut rng),
            Err(ProtocolError::EmptySequence(_))
        ));

        let pairs = vec![
            TrainingPair::new(vec![1.0, 2.0], vec![1.0]),
            TrainingPair::new(vec![1.0], vec![1.0]),
        ];
        assert!(matches!(
            fit("a", "b", &pairs, Activation::Tanh, &config, &mut rng),
            Err(ProtocolError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_projection_yields_orthogonal_columns() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut w = DMatrix::from_fn(6, 4, |_, _| rng.sample::<f32, _>(StandardNormal));
        project_scaled_orthogonal(&mut w, 1.0);
        let gram = w.transpose() * &w;
        let s2 = gram[(0, 0)];
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { s2 } else { 0.0 };
                assert!((gram[(i, j)] - expected).abs() < 1e-3 * s2.max(1.0));
            }
        }
    }
}
