use ndarray::{Array2, Axis, Zip};

use crate::backend::Backend;
use crate::error::EngineResult;

/// Reference CPU backend. Kernels follow the teacher's `CPUBackend`: plain
/// `ndarray` dot products for matmul, `Zip::par_for_each` for elementwise
/// activations so row-parallel work actually uses the `rayon` thread pool
/// the crate depends on.
#[derive(Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    #[tracing::instrument(skip(self, a, b), name = "kernel_matmul")]
    fn matmul_t(&self, a: &Array2<f32>, b: &Array2<f32>, trans_a: bool, trans_b: bool) -> EngineResult<Array2<f32>> {
        let lhs = if trans_a { a.t().to_owned() } else { a.clone() };
        let rhs = if trans_b { b.t().to_owned() } else { b.clone() };
        Ok(lhs.dot(&rhs))
    }

    fn tanh(&self, x: &Array2<f32>) -> EngineResult<Array2<f32>> {
        let mut res = x.clone();
        Zip::from(&mut res).par_for_each(|v| *v = v.tanh());
        Ok(res)
    }

    fn tanh_backward(&self, y: &Array2<f32>, grad_output: &Array2<f32>) -> EngineResult<Array2<f32>> {
        let mut res = grad_output.clone();
        Zip::from(&mut res).and(y).par_for_each(|g, &yi| *g *= 1.0 - yi * yi);
        Ok(res)
    }

    fn softmax_rows(&self, logits: &Array2<f32>) -> EngineResult<Array2<f32>> {
        let mut res = logits.clone();
        for mut row in res.axis_iter_mut(Axis(0)) {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
        Ok(res)
    }

    fn cross_entropy(&self, probs: &Array2<f32>, labels: &Array2<f32>) -> EngineResult<(f32, f32)> {
        let rows = probs.nrows() as f32;
        let mut loss = 0.0;
        let mut correct = 0.0;
        for (p_row, l_row) in probs.axis_iter(Axis(0)).zip(labels.axis_iter(Axis(0))) {
            let label_idx = l_row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap_or(0);
            loss -= (p_row[label_idx].max(1e-12)).ln();

            let pred_idx = p_row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap_or(0);
            if pred_idx == label_idx {
                correct += 1.0;
            }
        }
        Ok((correct / rows, loss / rows))
    }

    fn cross_entropy_grad(&self, probs: &Array2<f32>, labels: &Array2<f32>) -> EngineResult<Array2<f32>> {
        let rows = probs.nrows() as f32;
        Ok((probs - labels) / rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_matches_plain_dot() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let out = CpuBackend.matmul_t(&a, &b, false, false).unwrap();
        assert_eq!(out, a.dot(&b));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Array2::from_shape_vec((1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let out = CpuBackend.softmax_rows(&x).unwrap();
        let sum: f32 = out.row(0).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_zero_loss_for_confident_correct_prediction() {
        let probs = Array2::from_shape_vec((1, 2), vec![0.999_999, 0.000_001]).unwrap();
        let labels = Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).unwrap();
        let (acc, loss) = CpuBackend.cross_entropy(&probs, &labels).unwrap();
        assert_eq!(acc, 1.0);
        assert!(loss < 1e-5);
    }

    #[test]
    fn cross_entropy_grad_reduces_to_probs_minus_labels_over_n() {
        let probs = Array2::from_shape_vec((2, 2), vec![0.6, 0.4, 0.3, 0.7]).unwrap();
        let labels = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let grad = CpuBackend.cross_entropy_grad(&probs, &labels).unwrap();
        let expected = (&probs - &labels) / 2.0;
        assert!((grad.clone() - expected).iter().all(|x| x.abs() < 1e-6));
    }
}
