//! rollcall-core — Landmark encodings, gallery matching and attendance.
//!
//! Faces are located by a [`Detector`] (in-process SCRFD or a remote HTTP
//! service), reduced to translation- and scale-invariant landmark encodings,
//! and matched against enrolled students by cosine similarity.

pub mod detector;
pub mod local;
pub mod matcher;
pub mod model_cell;
pub mod normalize;
pub mod pipeline;
pub mod remote;
pub mod scrfd;
pub mod store;
pub mod student;
pub mod types;

pub use detector::{AnyDetector, Detector, DetectorError, Frame};
pub use matcher::{FaceOutcome, Gallery, MatchConfig};
pub use pipeline::{AttendanceReport, AttendanceService, FailureKind, PipelineError, Recognition};
pub use store::{MemoryStore, StoreError, StudentStore};
pub use student::{AttendanceRecord, SessionInfo, StudentMetadata, StudentRecord};
pub use types::{BoundingBox, Encoding, EncodingError, FaceDetection, Landmark, MatchResult};
