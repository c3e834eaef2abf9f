//! In-process landmark extraction with the SCRFD ONNX model.

use crate::detector::{Detector, DetectorError, Frame};
use crate::model_cell::{InitPolicy, ModelCell};
use crate::scrfd::ScrfdModel;
use crate::types::FaceDetection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalDetector {
    model_path: PathBuf,
    inference_timeout: Duration,
    model: ModelCell<Arc<Mutex<ScrfdModel>>>,
}

impl LocalDetector {
    /// Create the detector. The model is loaded on first use.
    pub fn new(model_path: impl Into<PathBuf>, policy: InitPolicy, inference_timeout: Duration) -> Self {
        Self {
            model_path: model_path.into(),
            inference_timeout,
            model: ModelCell::new("scrfd", policy),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    async fn model(&self) -> Result<&Arc<Mutex<ScrfdModel>>, DetectorError> {
        self.model
            .get_or_load(|| {
                let path = self.model_path.clone();
                async move {
                    let model = tokio::task::spawn_blocking(move || ScrfdModel::load(&path))
                        .await
                        .map_err(|e| DetectorError::InferenceFailed(format!("model loader task: {e}")))??;
                    Ok(Arc::new(Mutex::new(model)))
                }
            })
            .await
    }
}

impl Detector for LocalDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<FaceDetection>, DetectorError> {
        let model = Arc::clone(self.model().await?);
        let image = frame.image().clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("model lock poisoned".into()))?;
            model.detect(&image)
        });

        // A timed-out task keeps running on the blocking pool; its result is dropped.
        let detections = tokio::time::timeout(self.inference_timeout, task)
            .await
            .map_err(|_| DetectorError::InferenceTimeout(self.inference_timeout))?
            .map_err(|e| DetectorError::InferenceFailed(format!("inference task: {e}")))??;

        tracing::debug!(
            faces = detections.len(),
            width = frame.width(),
            height = frame.height(),
            "local detection finished"
        );
        Ok(detections)
    }

    async fn warm_up(&self) -> Result<(), DetectorError> {
        self.model().await.map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.model.is_loaded()
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
