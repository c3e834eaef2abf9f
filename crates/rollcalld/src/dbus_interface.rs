use rollcall_core::detector::{AnyDetector, Detector, Frame};
use rollcall_core::pipeline::{AttendanceService, FailureKind, PipelineError};
use rollcall_core::store::{StoreError, StudentStore};
use rollcall_core::student::{SessionFilter, SessionInfo, StudentMetadata};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub type Service = AttendanceService<AnyDetector, SqliteStore>;

/// Errors returned over D-Bus. The error name tells the caller which
/// remedy applies: retake the picture, retry later, or fix the request.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.rollcall.Attendance1.Error")]
pub enum AttendanceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NoFaceDetected(String),
    ModelUnavailable(String),
    Timeout(String),
    InvalidInput(String),
    DetectionFailed(String),
    DataError(String),
    StorageFailure(String),
}

impl From<PipelineError> for AttendanceError {
    fn from(e: PipelineError) -> Self {
        let message = e.to_string();
        match e.kind() {
            FailureKind::NoFace => AttendanceError::NoFaceDetected(message),
            FailureKind::ModelUnavailable => AttendanceError::ModelUnavailable(message),
            FailureKind::Timeout => AttendanceError::Timeout(message),
            FailureKind::InvalidInput => AttendanceError::InvalidInput(message),
            FailureKind::Detection => AttendanceError::DetectionFailed(message),
            FailureKind::DataError => AttendanceError::DataError(message),
            FailureKind::Storage => AttendanceError::StorageFailure(message),
        }
    }
}

impl From<StoreError> for AttendanceError {
    fn from(e: StoreError) -> Self {
        AttendanceError::StorageFailure(e.to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, AttendanceError> {
    serde_json::to_string(value).map_err(|e| AttendanceError::DataError(e.to_string()))
}

fn from_json<'a, T: serde::Deserialize<'a>>(what: &str, json: &'a str) -> Result<T, AttendanceError> {
    serde_json::from_str(json).map_err(|e| AttendanceError::InvalidInput(format!("{what}: {e}")))
}

fn decode_frame(image: Vec<u8>) -> Result<Frame, AttendanceError> {
    Frame::decode(image).map_err(|e| PipelineError::from(e).into())
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceInterface {
    service: Arc<Service>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Register a student from JSON metadata and an encoded image.
    async fn enroll(&self, student_json: &str, image: Vec<u8>) -> Result<String, AttendanceError> {
        let metadata: StudentMetadata = from_json("student", student_json)?;
        tracing::info!(student = %metadata.student_id, bytes = image.len(), "enroll requested");

        let frame = decode_frame(image)?;
        let record = self.service.enroll(metadata, &frame).await.map_err(|e| {
            tracing::warn!(error = %e, kind = ?e.kind(), "enroll failed");
            AttendanceError::from(e)
        })?;
        to_json(&record)
    }

    /// Recognize the faces in an image and record them against a session.
    async fn take_attendance(&self, session_json: &str, image: Vec<u8>) -> Result<String, AttendanceError> {
        let session: SessionInfo = from_json("session", session_json)?;
        tracing::info!(session = %session.session_id, bytes = image.len(), "attendance requested");

        let frame = decode_frame(image)?;
        let report = self.service.take_attendance(session, &frame).await.map_err(|e| {
            tracing::warn!(error = %e, kind = ?e.kind(), "attendance failed");
            AttendanceError::from(e)
        })?;
        to_json(&report)
    }

    async fn list_students(&self) -> Result<String, AttendanceError> {
        to_json(&self.service.store().students().await?)
    }

    /// Sessions with attendance counts, newest first. Empty strings and a
    /// zero limit leave that criterion unset; dates are YYYY-MM-DD or RFC 3339.
    async fn list_sessions(
        &self,
        search: &str,
        since: &str,
        until: &str,
        limit: u32,
    ) -> Result<String, AttendanceError> {
        let filter = SessionFilter::from_args(search, since, until, limit)
            .map_err(|e| AttendanceError::InvalidInput(e.to_string()))?;
        to_json(&self.service.store().session_summaries(filter).await?)
    }

    async fn session_attendance(&self, session_id: &str) -> Result<String, AttendanceError> {
        to_json(&self.service.store().session_attendance(session_id.to_string()).await?)
    }

    async fn student_attendance(&self, student_id: &str) -> Result<String, AttendanceError> {
        to_json(&self.service.store().student_attendance(student_id.to_string()).await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, AttendanceError> {
        let detector = self.service.detector();
        let config = self.service.config();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": detector.backend(),
            "model_ready": detector.is_ready(),
            "similarity_threshold": config.threshold,
            "allow_duplicate_matches": config.allow_duplicates,
        }))
    }
}
