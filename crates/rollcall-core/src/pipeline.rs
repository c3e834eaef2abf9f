//! Enrollment, recognition and attendance procedures.
//!
//! Recognition walks `DetectingFaces -> (NoFaces | FacesFound) ->
//! ExtractingEncodings -> ScoringAgainstGallery -> ResultsReady`; each
//! transition is logged at debug level. Nothing is shared between calls
//! except the detector's lazily loaded model.

use crate::detector::{Detector, DetectorError, Frame};
use crate::matcher::{self, FaceOutcome, Gallery, MatchConfig};
use crate::normalize::face_encoding;
use crate::store::{StoreError, StudentStore};
use crate::student::{AttendanceRecord, NewStudent, SessionInfo, StudentMetadata, StudentRecord, ValidationError};
use crate::types::{BoundingBox, EncodingError, FaceDetection, MatchResult};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Caller-facing classification of a failed procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retake the picture.
    NoFace,
    /// Detection backend could not be initialized; retry later.
    ModelUnavailable,
    /// Inference took too long; safe to retry once.
    Timeout,
    InvalidInput,
    /// Detection backend answered with an error.
    Detection,
    /// Stored encodings are inconsistent with the active detector.
    DataError,
    Storage,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Invalid(_) => FailureKind::InvalidInput,
            PipelineError::NoFaceDetected => FailureKind::NoFace,
            PipelineError::Detector(e) => match e {
                DetectorError::ModelNotFound(_) | DetectorError::ModelUnavailable { .. } => {
                    FailureKind::ModelUnavailable
                }
                DetectorError::InferenceTimeout(_) => FailureKind::Timeout,
                DetectorError::InvalidInput(_) | DetectorError::Image(_) => FailureKind::InvalidInput,
                DetectorError::InferenceFailed(_)
                | DetectorError::Remote(_)
                | DetectorError::Http(_)
                | DetectorError::Ort(_) => FailureKind::Detection,
            },
            PipelineError::Encoding(EncodingError::InvalidInput(_)) => FailureKind::InvalidInput,
            PipelineError::Encoding(_) => FailureKind::DataError,
            PipelineError::Storage(_) => FailureKind::Storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    /// Valid empty frame; invite a retake.
    NoFacesDetected,
    FacesFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    /// Position in detection order (highest confidence first).
    pub face: usize,
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(flatten)]
    pub outcome: FaceOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub status: RecognitionStatus,
    pub faces: Vec<FaceReport>,
}

impl Recognition {
    fn no_faces() -> Self {
        Self {
            status: RecognitionStatus::NoFacesDetected,
            faces: Vec::new(),
        }
    }

    /// Recognized students, in face order.
    pub fn matches(&self) -> impl Iterator<Item = &MatchResult> {
        self.faces.iter().filter_map(|f| f.outcome.matched())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceReport {
    pub session: SessionInfo,
    pub recognition: Recognition,
    pub records: Vec<AttendanceRecord>,
}

/// Face enrollment and recognition over an injected detector and store.
///
/// Built once at startup and shared by reference; holds no per-call state.
pub struct AttendanceService<D, S> {
    detector: D,
    store: S,
    config: MatchConfig,
}

impl<D: Detector, S: StudentStore> AttendanceService<D, S> {
    pub fn new(detector: D, store: S, config: MatchConfig) -> Self {
        Self {
            detector,
            store,
            config,
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Register a student from one captured image.
    ///
    /// Uses the highest-confidence face when several are present. The
    /// student row, encoding and image are persisted in one store call.
    pub async fn enroll(&self, metadata: StudentMetadata, frame: &Frame) -> Result<StudentRecord, PipelineError> {
        let metadata = metadata.validated()?;

        let detections = self.detector.detect(frame).await?;
        let face = best_face(&detections).ok_or(PipelineError::NoFaceDetected)?;
        if detections.len() > 1 {
            tracing::warn!(
                student = %metadata.student_id,
                faces = detections.len(),
                confidence = face.confidence,
                "several faces in enrollment image, using the most confident"
            );
        }

        let encoding = face_encoding(face)?;
        let image = frame.encoded()?.into_owned();

        let record = self
            .store
            .insert_student(NewStudent {
                metadata,
                encoding: encoding.to_storage_string(),
                image,
            })
            .await?;

        tracing::info!(
            student = %record.metadata.student_id,
            dims = encoding.len(),
            backend = self.detector.backend(),
            "student enrolled"
        );
        Ok(record)
    }

    /// Match every face in `frame` against the enrolled gallery.
    pub async fn recognize(&self, frame: &Frame) -> Result<Recognition, PipelineError> {
        tracing::debug!(stage = "detecting_faces", width = frame.width(), height = frame.height());
        let detections = self.detector.detect(frame).await?;
        if detections.is_empty() {
            tracing::info!("no faces detected");
            return Ok(Recognition::no_faces());
        }

        let gallery = Gallery::from_entries(self.store.gallery().await?)?;

        tracing::debug!(stage = "extracting_encodings", faces = detections.len());
        let encodings: Vec<_> = detections.iter().map(face_encoding).collect();

        tracing::debug!(stage = "scoring_against_gallery", gallery = gallery.len());
        let outcomes = matcher::assign(&encodings, &gallery, &self.config)?;

        let faces: Vec<FaceReport> = detections
            .into_iter()
            .zip(outcomes)
            .enumerate()
            .map(|(face, (detection, outcome))| FaceReport {
                face,
                bbox: detection.bbox,
                confidence: detection.confidence,
                outcome,
            })
            .collect();

        let recognition = Recognition {
            status: RecognitionStatus::FacesFound,
            faces,
        };
        tracing::debug!(stage = "results_ready");
        tracing::info!(
            faces = recognition.faces.len(),
            recognized = recognition.matches().count(),
            "recognition finished"
        );
        Ok(recognition)
    }

    /// Recognize `frame` and persist one attendance record per match.
    pub async fn take_attendance(
        &self,
        session: SessionInfo,
        frame: &Frame,
    ) -> Result<AttendanceReport, PipelineError> {
        let mut session = session.validated()?;
        let now = chrono::Utc::now().to_rfc3339();
        session.started_at.get_or_insert_with(|| now.clone());

        let recognition = self.recognize(frame).await?;
        let records: Vec<AttendanceRecord> = recognition
            .matches()
            .map(|m| AttendanceRecord {
                session_id: session.session_id.clone(),
                student_id: m.student_id.clone(),
                timestamp: now.clone(),
                confidence: m.score,
            })
            .collect();

        self.store
            .record_attendance(session.clone(), records.clone())
            .await?;

        tracing::info!(session = %session.session_id, present = records.len(), "attendance recorded");
        Ok(AttendanceReport {
            session,
            recognition,
            records,
        })
    }
}

/// Highest confidence wins; the earliest detection wins ties.
fn best_face(detections: &[FaceDetection]) -> Option<&FaceDetection> {
    detections
        .iter()
        .reduce(|best, d| if d.confidence > best.confidence { d } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Landmark;

    fn det(confidence: f32) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
            confidence,
            landmarks: vec![Landmark::new(0.0, 0.0), Landmark::new(1.0, 1.0)],
            encoding: None,
        }
    }

    #[test]
    fn test_best_face() {
        assert!(best_face(&[]).is_none());
        let dets = [det(0.6), det(0.9), det(0.9), det(0.7)];
        let best = best_face(&dets).unwrap();
        assert!(std::ptr::eq(best, &dets[1]));
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(PipelineError::NoFaceDetected.kind(), FailureKind::NoFace);
        assert_eq!(
            PipelineError::from(DetectorError::ModelUnavailable { attempts: 3, reason: "x".into() }).kind(),
            FailureKind::ModelUnavailable
        );
        assert_eq!(
            PipelineError::from(DetectorError::InferenceTimeout(std::time::Duration::from_secs(5))).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            PipelineError::from(EncodingError::DimensionMismatch { left: 10, right: 936 }).kind(),
            FailureKind::DataError
        );
        assert_eq!(
            PipelineError::from(StoreError::Backend("disk full".into())).kind(),
            FailureKind::Storage
        );
    }
}
