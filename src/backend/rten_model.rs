use ndarray::{ArrayD, IxDyn};
use rten::{Model, NodeId};
use rten_tensor::Tensor;
use rten_tensor::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::detection::inference::{NamedTensor, PredictionBackend};
use crate::error::BackendError;

/// Runs a `.rten` model exported from a trained network
pub struct RtenBackend {
    model: Option<Model>,
    input_name: String,
}

impl RtenBackend {
    /// Load a model from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let model = Model::load_file(path).map_err(|e| BackendError::Load(format!("{}: {e}", path.display())))?;
        let input_name = model
            .input_ids()
            .first()
            .and_then(|&id| model.node_info(id))
            .and_then(|info| info.name().map(str::to_string))
            .ok_or_else(|| BackendError::Load(format!("{}: model has no named input", path.display())))?;
        debug!(model = %path.display(), input = %input_name, "loaded model");
        Ok(Self {
            model: Some(model),
            input_name,
        })
    }

    fn output_names(model: &Model) -> Vec<(NodeId, String)> {
        model
            .output_ids()
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let name = model
                    .node_info(id)
                    .and_then(|info| info.name().map(str::to_string))
                    .unwrap_or_else(|| format!("output_{i}"));
                (id, name)
            })
            .collect()
    }
}

impl PredictionBackend for RtenBackend {
    fn input_name(&self) -> &str {
        &self.input_name
    }

    fn predict(&self, inputs: Vec<NamedTensor>) -> Result<Vec<NamedTensor>, BackendError> {
        let model = self.model.as_ref().ok_or(BackendError::Closed)?;

        let tensors = inputs
            .into_iter()
            .map(|(name, array)| {
                let id = model
                    .find_node(&name)
                    .ok_or_else(|| BackendError::Inference(format!("model has no input named '{name}'")))?;
                let shape = array.shape().to_vec();
                let data = array.as_standard_layout().iter().copied().collect::<Vec<f32>>();
                Ok((id, Tensor::from_data(&shape, data)))
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        let run_inputs = tensors.iter().map(|(id, tensor)| (*id, tensor.view().into())).collect();

        let outputs = Self::output_names(model);
        let output_ids: Vec<NodeId> = outputs.iter().map(|(id, _)| *id).collect();
        let values = model
            .run(run_inputs, &output_ids, None)
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        values
            .into_iter()
            .zip(outputs)
            .map(|(value, (_, name))| {
                let tensor: Tensor<f32> = value
                    .try_into()
                    .map_err(|_| BackendError::Inference(format!("output '{name}' is not a float tensor")))?;
                let shape = tensor.shape().to_vec();
                let array = ArrayD::from_shape_vec(IxDyn(&shape), tensor.to_vec()).map_err(|e| BackendError::Shape {
                    shape: shape.clone(),
                    reason: e.to_string(),
                })?;
                Ok((name, array))
            })
            .collect()
    }

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.model = None;
        Ok(())
    }
}
