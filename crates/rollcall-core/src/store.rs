//! Storage collaborator interface.

use crate::student::{
    AttendanceRecord, GalleryEntry, NewStudent, SessionFilter, SessionInfo, SessionSummary, StudentRecord,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student {0} is already registered")]
    DuplicateStudent(String),
    #[error("unknown student {0}")]
    UnknownStudent(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Persistence for students, sessions and attendance.
///
/// `insert_student` and `record_attendance` are each a single transaction:
/// either everything they were given is stored or nothing is.
pub trait StudentStore: Send + Sync {
    /// Every student with a non-null encoding.
    fn gallery(&self) -> impl Future<Output = Result<Vec<GalleryEntry>, StoreError>> + Send;

    /// Store metadata, encoding and image together. Rejects existing ids.
    fn insert_student(
        &self,
        student: NewStudent,
    ) -> impl Future<Output = Result<StudentRecord, StoreError>> + Send;

    /// Upsert the session and store one record per recognized student.
    fn record_attendance(
        &self,
        session: SessionInfo,
        records: Vec<AttendanceRecord>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn students(&self) -> impl Future<Output = Result<Vec<StudentRecord>, StoreError>> + Send;

    fn sessions(&self) -> impl Future<Output = Result<Vec<SessionInfo>, StoreError>> + Send;

    /// Sessions with their attendance counts, selected and ordered by `filter`.
    fn session_summaries(
        &self,
        filter: SessionFilter,
    ) -> impl Future<Output = Result<Vec<SessionSummary>, StoreError>> + Send;

    fn session_attendance(
        &self,
        session_id: String,
    ) -> impl Future<Output = Result<Vec<AttendanceRecord>, StoreError>> + Send;

    fn student_attendance(
        &self,
        student_id: String,
    ) -> impl Future<Output = Result<Vec<AttendanceRecord>, StoreError>> + Send;
}

#[derive(Default)]
struct MemoryState {
    students: BTreeMap<String, StudentRecord>,
    sessions: BTreeMap<String, SessionInfo>,
    /// (session id, student id) -> record
    attendance: BTreeMap<(String, String), AttendanceRecord>,
}

/// Process-local store, for tests and single-run tooling.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state)
    }
}

impl StudentStore for MemoryStore {
    async fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(self.with_state(|s| {
            s.students
                .values()
                .filter_map(|r| {
                    Some(GalleryEntry {
                        student_id: r.metadata.student_id.clone(),
                        name: r.metadata.display_name(),
                        encoding: r.encoding.clone()?,
                    })
                })
                .collect()
        }))
    }

    async fn insert_student(&self, student: NewStudent) -> Result<StudentRecord, StoreError> {
        self.with_state(|s| {
            let id = student.metadata.student_id.clone();
            if s.students.contains_key(&id) {
                return Err(StoreError::DuplicateStudent(id));
            }
            let record = StudentRecord {
                metadata: student.metadata,
                encoding: Some(student.encoding),
                image_ref: format!("memory:{id}"),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            s.students.insert(id, record.clone());
            Ok(record)
        })
    }

    async fn record_attendance(
        &self,
        session: SessionInfo,
        records: Vec<AttendanceRecord>,
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            if let Some(r) = records.iter().find(|r| !s.students.contains_key(&r.student_id)) {
                return Err(StoreError::UnknownStudent(r.student_id.clone()));
            }
            s.sessions.entry(session.session_id.clone()).or_insert(session);
            for record in records {
                let key = (record.session_id.clone(), record.student_id.clone());
                match s.attendance.get(&key) {
                    Some(existing) if existing.confidence >= record.confidence => {}
                    _ => {
                        s.attendance.insert(key, record);
                    }
                }
            }
            Ok(())
        })
    }

    async fn students(&self) -> Result<Vec<StudentRecord>, StoreError> {
        Ok(self.with_state(|s| s.students.values().cloned().collect()))
    }

    async fn sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        Ok(self.with_state(|s| s.sessions.values().cloned().collect()))
    }

    async fn session_summaries(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, StoreError> {
        let summaries = self.with_state(|s| {
            s.sessions
                .values()
                .map(|session| SessionSummary {
                    student_count: s
                        .attendance
                        .keys()
                        .filter(|(session_id, _)| *session_id == session.session_id)
                        .count(),
                    session: session.clone(),
                })
                .collect()
        });
        Ok(filter.apply(summaries))
    }

    async fn session_attendance(&self, session_id: String) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.with_state(|s| {
            s.attendance
                .values()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect()
        }))
    }

    async fn student_attendance(&self, student_id: String) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.with_state(|s| {
            s.attendance
                .values()
                .filter(|r| r.student_id == student_id)
                .cloned()
                .collect()
        }))
    }
}
