//! Landmark extraction delegated to the recognition HTTP service.
//!
//! The service receives the frame as base64 and answers with boxes plus
//! either landmarks or a ready encoding per face. Landmarks are normalized
//! locally; a supplied encoding is used as is. Scoring always happens here.

use crate::detector::{Detector, DetectorError, Frame};
use crate::model_cell::{InitPolicy, ModelCell};
use crate::types::{BoundingBox, Encoding, FaceDetection, Landmark};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    success: bool,
    #[serde(default, alias = "data")]
    faces: Vec<RemoteFace>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteFace {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "box")]
    bbox: RemoteBox,
    #[serde(default = "full_confidence")]
    confidence: f32,
    #[serde(default)]
    landmarks: Vec<Vec<f64>>,
    #[serde(default)]
    encoding: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RemoteBox {
    top: f32,
    right: f32,
    bottom: f32,
    left: f32,
}

fn full_confidence() -> f32 {
    1.0
}

pub struct RemoteDetector {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    ready: ModelCell<()>,
}

impl RemoteDetector {
    pub fn new(
        base_url: impl Into<String>,
        policy: InitPolicy,
        request_timeout: Duration,
    ) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
            ready: ModelCell::new("remote", policy),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request_error(&self, e: reqwest::Error) -> DetectorError {
        if e.is_timeout() {
            DetectorError::InferenceTimeout(self.request_timeout)
        } else {
            DetectorError::Http(e)
        }
    }

    /// Check `/health` once per process, with the same bounded retries
    /// as a local model load.
    async fn ensure_ready(&self) -> Result<(), DetectorError> {
        self.ready
            .get_or_load(|| async {
                let response = self
                    .client
                    .get(self.url("/health"))
                    .send()
                    .await
                    .map_err(|e| self.request_error(e))?
                    .error_for_status()?;
                tracing::info!(url = %self.base_url, status = %response.status(), "remote detector reachable");
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

impl Detector for RemoteDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<FaceDetection>, DetectorError> {
        self.ensure_ready().await?;

        let image = {
            let bytes = frame.encoded()?;
            base64::engine::general_purpose::STANDARD.encode(bytes.as_ref())
        };

        let response = self
            .client
            .post(self.url("/detect-faces"))
            .json(&DetectRequest { image: &image })
            .send()
            .await
            .map_err(|e| self.request_error(e))?
            .error_for_status()?;

        let body: DetectResponse = response.json().await.map_err(|e| self.request_error(e))?;
        let detections = into_detections(body)?;
        tracing::debug!(faces = detections.len(), url = %self.base_url, "remote detection finished");
        Ok(detections)
    }

    async fn warm_up(&self) -> Result<(), DetectorError> {
        self.ensure_ready().await
    }

    fn is_ready(&self) -> bool {
        self.ready.is_loaded()
    }

    fn backend(&self) -> &'static str {
        "remote"
    }
}

fn into_detections(body: DetectResponse) -> Result<Vec<FaceDetection>, DetectorError> {
    if !body.success {
        return Err(DetectorError::Remote(
            body.message.unwrap_or_else(|| "request rejected".into()),
        ));
    }

    let mut detections = body
        .faces
        .into_iter()
        .enumerate()
        .map(|(i, face)| {
            let label = face.id.unwrap_or_else(|| format!("#{i}"));
            if face.landmarks.is_empty() && face.encoding.is_none() {
                return Err(DetectorError::InferenceFailed(format!(
                    "remote face {label} has neither landmarks nor an encoding"
                )));
            }
            let landmarks = face
                .landmarks
                .iter()
                .map(|p| match p.as_slice() {
                    [x, y] => Ok(Landmark::new(*x, *y)),
                    [x, y, z] => Ok(Landmark { x: *x, y: *y, z: Some(*z) }),
                    _ => Err(DetectorError::InferenceFailed(format!(
                        "remote face {label}: landmark with {} components",
                        p.len()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let encoding = face
                .encoding
                .map(Encoding::checked)
                .transpose()
                .map_err(|e| DetectorError::InferenceFailed(format!("remote face {label}: {e}")))?;

            let b = face.bbox;
            Ok(FaceDetection {
                bbox: BoundingBox::from_corners((b.left, b.top), (b.right, b.bottom)),
                confidence: face.confidence,
                landmarks,
                encoding,
            })
        })
        .collect::<Result<Vec<_>, DetectorError>>()?;

    if !agree(detections.iter().filter(|d| d.encoding.is_none()).map(|d| d.landmarks.len())) {
        return Err(DetectorError::InferenceFailed(
            "remote faces disagree on landmark count".into(),
        ));
    }
    if !agree(detections.iter().filter_map(|d| d.encoding.as_ref()).map(Encoding::len)) {
        return Err(DetectorError::InferenceFailed(
            "remote faces disagree on encoding length".into(),
        ));
    }

    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(detections)
}

fn agree(mut lengths: impl Iterator<Item = usize>) -> bool {
    match lengths.next() {
        Some(first) => lengths.all(|n| n == first),
        None => true,
    }
}
