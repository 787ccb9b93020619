pub mod cpu;

use ndarray::Array2;

use crate::error::EngineResult;

/// Trait defining the physical execution of the per-vertex NN arithmetic a
/// compute worker runs once a chunk has been dispatched to it: one matmul
/// plus an activation for a hidden layer, or softmax+loss on the final
/// layer. Generalized from the teacher's `Backend` trait (which dispatched
/// full conv/pool kernels for CNNs) down to the dense-GEMM-plus-activation
/// kernels a GCN layer actually needs, so the scheduler stays backend
/// agnostic across `Mode::Cpu` and `Mode::Gpu`.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// `a * b`, optionally transposing either operand first.
    fn matmul_t(&self, a: &Array2<f32>, b: &Array2<f32>, trans_a: bool, trans_b: bool) -> EngineResult<Array2<f32>>;

    fn tanh(&self, x: &Array2<f32>) -> EngineResult<Array2<f32>>;
    fn tanh_backward(&self, y: &Array2<f32>, grad_output: &Array2<f32>) -> EngineResult<Array2<f32>>;

    /// Row-wise softmax, used on the final layer's logits.
    fn softmax_rows(&self, logits: &Array2<f32>) -> EngineResult<Array2<f32>>;

    /// Mean cross-entropy loss and per-row accuracy (fraction of rows whose
    /// argmax matches the one-hot label's argmax) for one chunk.
    fn cross_entropy(&self, probs: &Array2<f32>, labels: &Array2<f32>) -> EngineResult<(f32, f32)>;

    /// Gradient of mean cross-entropy w.r.t. the pre-softmax logits, which
    /// for softmax+cross-entropy reduces to `(probs - labels) / rows`.
    fn cross_entropy_grad(&self, probs: &Array2<f32>, labels: &Array2<f32>) -> EngineResult<Array2<f32>>;
}

pub fn default_backend() -> Box<dyn Backend> {
    Box::new(cpu::CpuBackend)
}
