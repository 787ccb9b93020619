use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::tensor::Tensor;

/// The per-layer tensor map: the stable address space the wire protocol
/// references by short name (`x`, `ah`, `z`, `h`, `lab`, `grad`, `aTg`,
/// `fg`, `bg`).
///
/// Reuse across epochs follows the teacher's `BufferPool` pattern
/// (`graph::buffer_pool` in the source corpus): a tensor already present
/// with the right shape is returned as-is instead of being reallocated,
/// generalized here from a flat `Vec<Option<Tensor>>` indexed by buffer id
/// to a name-keyed map since each layer owns its own independent slab.
#[derive(Default)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self { tensors: HashMap::new() }
    }

    /// Returns the existing tensor for `name` if its shape already matches,
    /// otherwise allocates a fresh zeroed one and installs it. This is the
    /// "allocated once at engine start and reused every epoch" behavior for
    /// intermediate tensors (`ah`, `z`, `h`, `grad`, `aTg`).
    pub fn get_or_alloc(&mut self, name: &str, rows: usize, cols: usize) -> &mut Tensor {
        let needs_alloc = match self.tensors.get(name) {
            Some(t) => t.rows() != rows || t.cols() != cols,
            None => true,
        };
        if needs_alloc {
            self.tensors.insert(name.to_string(), Tensor::zeros(name, rows, cols));
        }
        self.tensors.get_mut(name).expect("just inserted")
    }

    pub fn insert(&mut self, tensor: Tensor) {
        self.tensors.insert(tensor.name().as_str().to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> EngineResult<&Tensor> {
        self.tensors.get(name).ok_or_else(|| EngineError::UnknownTensor { name: name.to_string() })
    }

    pub fn get_mut(&mut self, name: &str) -> EngineResult<&mut Tensor> {
        self.tensors
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownTensor { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

/// One `TensorMap` per layer, indexed by layer number. Mirrors the source
/// engine's `std::vector<TensorMap> savedNNTensors`.
#[derive(Default)]
pub struct LayeredTensorMaps {
    layers: Vec<TensorMap>,
}

impl LayeredTensorMaps {
    pub fn with_layers(num_layers: usize) -> Self {
        Self { layers: (0..num_layers).map(|_| TensorMap::new()).collect() }
    }

    pub fn layer(&self, layer: u32) -> EngineResult<&TensorMap> {
        self.layers
            .get(layer as usize)
            .ok_or_else(|| EngineError::ProtocolViolation { reason: format!("no tensor map for layer {layer}") })
    }

    pub fn layer_mut(&mut self, layer: u32) -> EngineResult<&mut TensorMap> {
        self.layers
            .get_mut(layer as usize)
            .ok_or_else(|| EngineError::ProtocolViolation { reason: format!("no tensor map for layer {layer}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_alloc_reuses_matching_shape() {
        let mut tm = TensorMap::new();
        {
            let t = tm.get_or_alloc("ah", 4, 2);
            t.as_array_mut()[[0, 0]] = 7.0;
        }
        let t = tm.get_or_alloc("ah", 4, 2);
        assert_eq!(t.as_array()[[0, 0]], 7.0, "same-shape reuse must not reallocate");
    }

    #[test]
    fn get_or_alloc_reallocates_on_shape_change() {
        let mut tm = TensorMap::new();
        tm.get_or_alloc("ah", 4, 2).as_array_mut()[[0, 0]] = 7.0;
        let t = tm.get_or_alloc("ah", 8, 2);
        assert_eq!(t.as_array()[[0, 0]], 0.0);
    }

    #[test]
    fn unknown_tensor_errors() {
        let tm = TensorMap::new();
        assert!(matches!(tm.get("zzz"), Err(EngineError::UnknownTensor { .. })));
    }
}
