//! Landmark extraction interface and the frame type it consumes.
//!
//! Enrollment and matching call a single [`Detector`]; which backend sits
//! behind it (in-process ONNX or the remote HTTP service) is a
//! configuration choice expressed by [`AnyDetector`].

use crate::local::LocalDetector;
use crate::remote::RemoteDetector;
use crate::types::FaceDetection;
use image::{ImageFormat, RgbImage};
use std::borrow::Cow;
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detection unavailable after {attempts} attempt(s): {reason}")]
    ModelUnavailable { attempts: u32, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("inference did not complete within {0:?}")]
    InferenceTimeout(Duration),
    #[error("remote detector: {0}")]
    Remote(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A decoded still image: camera frame, uploaded photo or in-memory canvas.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    /// Bytes the frame was decoded from, if any.
    encoded: Option<Vec<u8>>,
}

impl Frame {
    /// Decode an encoded image (JPEG, PNG, ...), keeping the original bytes.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, DetectorError> {
        let image = image::load_from_memory(&bytes)?.to_rgb8();
        Self::checked(image, Some(bytes))
    }

    /// Wrap an already decoded RGB bitmap.
    pub fn from_rgb(image: RgbImage) -> Result<Self, DetectorError> {
        Self::checked(image, None)
    }

    fn checked(image: RgbImage, encoded: Option<Vec<u8>>) -> Result<Self, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::InvalidInput(format!(
                "frame has zero dimension ({}x{})",
                image.width(),
                image.height()
            )));
        }
        Ok(Self { image, encoded })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Encoded bytes for upload or persistence; PNG-encodes bitmaps that
    /// never had an encoded form.
    pub fn encoded(&self) -> Result<Cow<'_, [u8]>, DetectorError> {
        if let Some(bytes) = &self.encoded {
            return Ok(Cow::Borrowed(bytes));
        }
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(Cow::Owned(buf.into_inner()))
    }
}

/// Produces landmark-bearing face detections for a frame.
///
/// An empty result means "no face", never a failure. Every detection from
/// one backend carries the same number of landmarks in the same order.
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Vec<FaceDetection>, DetectorError>> + Send;

    /// Force model initialization ahead of the first request.
    fn warm_up(&self) -> impl Future<Output = Result<(), DetectorError>> + Send;

    /// Whether the model (or remote service) has been initialized.
    fn is_ready(&self) -> bool;

    fn backend(&self) -> &'static str;
}

/// Detector selected by configuration.
pub enum AnyDetector {
    Local(LocalDetector),
    Remote(RemoteDetector),
}

impl Detector for AnyDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<FaceDetection>, DetectorError> {
        match self {
            AnyDetector::Local(d) => d.detect(frame).await,
            AnyDetector::Remote(d) => d.detect(frame).await,
        }
    }

    async fn warm_up(&self) -> Result<(), DetectorError> {
        match self {
            AnyDetector::Local(d) => d.warm_up().await,
            AnyDetector::Remote(d) => d.warm_up().await,
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            AnyDetector::Local(d) => d.is_ready(),
            AnyDetector::Remote(d) => d.is_ready(),
        }
    }

    fn backend(&self) -> &'static str {
        match self {
            AnyDetector::Local(d) => d.backend(),
            AnyDetector::Remote(d) => d.backend(),
        }
    }
}
