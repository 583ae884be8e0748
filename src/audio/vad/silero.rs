// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Silero VAD neural-network inference.
//!
//! Wraps the Silero VAD ONNX model for single-call speech probability
//! inference. Input: 512 f32 samples at 16 kHz. Output: speech probability
//! in `[0.0, 1.0]`. The recurrent hidden and cell states are carried
//! between calls and owned exclusively by this wrapper.

use std::path::Path;

use ndarray::{Array1, Array2, Array3, Ix3};
use ort::session::Session;
use ort::value::Tensor;

use crate::audio::vad::{SpeechDetector, VadError, VAD_SAMPLE_RATE, VAD_WINDOW_SAMPLES};

/// LSTM state shape per buffer: `[2, 1, 64]`.
const STATE_LAYERS: usize = 2;
const STATE_SIZE: usize = 64;

/// Default on-disk location of the VAD model, relative to the process
/// working directory. The model is required at startup; there is no
/// download fallback for it.
pub const SILERO_VAD_MODEL_PATH: &str = "models/silero_vad.onnx";

/// Silero VAD inference wrapper.
///
/// Maintains the LSTM hidden (`h`) and cell (`c`) states across calls.
/// Each [`probability`](SpeechDetector::probability) call accepts exactly
/// [`VAD_WINDOW_SAMPLES`] (512) normalized f32 samples at 16 kHz.
pub struct SileroVad {
    session: Session,
    /// LSTM hidden state carried between inference calls - shape `[2, 1, 64]`.
    hidden: Array3<f32>,
    /// LSTM cell state carried between inference calls - shape `[2, 1, 64]`.
    cell: Array3<f32>,
    /// Sample rate passed to the model (always 16000).
    sample_rate: i64,
}

impl SileroVad {
    /// Load the model from [`SILERO_VAD_MODEL_PATH`].
    pub fn new() -> Result<Self, VadError> {
        Self::from_path(Path::new(SILERO_VAD_MODEL_PATH))
    }

    /// Create from a local ONNX model path.
    pub fn from_path(model_path: &Path) -> Result<Self, VadError> {
        if !model_path.exists() {
            return Err(VadError::Model(format!(
                "model file not found at {}",
                model_path.display()
            )));
        }
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        Ok(Self {
            session,
            hidden: Array3::<f32>::zeros((STATE_LAYERS, 1, STATE_SIZE)),
            cell: Array3::<f32>::zeros((STATE_LAYERS, 1, STATE_SIZE)),
            sample_rate: VAD_SAMPLE_RATE as i64,
        })
    }
}

impl SpeechDetector for SileroVad {
    fn probability(&mut self, window: &[f32]) -> Result<f32, VadError> {
        if window.len() != VAD_WINDOW_SAMPLES {
            return Err(VadError::InvalidInput(format!(
                "expected {} samples, got {}",
                VAD_WINDOW_SAMPLES,
                window.len()
            )));
        }

        // input: [1, 512]
        let input_tensor = Array2::from_shape_vec((1, VAD_WINDOW_SAMPLES), window.to_vec())
            .map_err(|e| VadError::InvalidInput(e.to_string()))?;
        let input_value = Tensor::from_array(input_tensor)?;

        // h / c: [2, 1, 64] - carried from the previous call
        let h_value = Tensor::from_array(self.hidden.clone())?;
        let c_value = Tensor::from_array(self.cell.clone())?;

        // sr: [1]
        let sr_value = Tensor::from_array(Array1::from_vec(vec![self.sample_rate]))?;

        let outputs = self.session.run(ort::inputs![
            "input" => input_value,
            "h" => h_value,
            "c" => c_value,
            "sr" => sr_value,
        ])?;

        let probability = outputs["output"]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);

        // Carry the updated recurrent state into the next call.
        self.hidden = outputs["hn"]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix3>()
            .map_err(|e| VadError::InvalidInput(format!("hidden state shape error: {e}")))?;
        self.cell = outputs["cn"]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix3>()
            .map_err(|e| VadError::InvalidInput(format!("cell state shape error: {e}")))?;

        Ok(probability)
    }

    fn reset(&mut self) {
        self.hidden = Array3::<f32>::zeros((STATE_LAYERS, 1, STATE_SIZE));
        self.cell = Array3::<f32>::zeros((STATE_LAYERS, 1, STATE_SIZE));
    }
}
