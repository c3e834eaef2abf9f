//! rollcall-store — SQLite persistence for students, sessions and attendance.
//!
//! All statements run on the single background thread owned by
//! `tokio_rusqlite::Connection`; enrollment and attendance writes are each
//! one transaction.

pub mod schema;

use rollcall_core::store::{StoreError, StudentStore};
use rollcall_core::student::{
    AttendanceRecord, GalleryEntry, NewStudent, SessionFilter, SessionInfo, SessionSummary, StudentMetadata,
    StudentRecord,
};
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio_rusqlite::Connection;

pub struct SqliteStore {
    conn: Connection,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Content address for a stored image.
pub fn image_ref(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(backend)?;
        }
        let conn = Connection::open(path).await.map_err(backend)?;
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            Ok(())
        })
        .await
        .map_err(backend)?;

        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "student database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        let version = conn
            .call(|conn| Ok(schema::migrate(conn)?))
            .await
            .map_err(backend)?;
        tracing::debug!(version, "schema ready");
        Ok(Self { conn })
    }

    /// Raw bytes of a student's enrollment image.
    pub async fn student_image(&self, student_id: String) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT i.data FROM students s
                         JOIN student_images i ON i.image_ref = s.image_ref
                         WHERE s.student_id = ?1",
                        params![student_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(backend)
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        metadata: StudentMetadata {
            student_id: row.get("student_id")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            email: row.get("email")?,
            phone: row.get("phone")?,
            department: row.get("department")?,
            batch: row.get("batch")?,
            semester: row.get("semester")?,
        },
        encoding: row.get("face_encoding")?,
        image_ref: row.get("image_ref")?,
        created_at: row.get("created_at")?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        session_id: row.get("session_id")?,
        student_id: row.get("student_id")?,
        timestamp: row.get("timestamp")?,
        confidence: row.get("confidence")?,
    })
}

const STUDENT_COLUMNS: &str = "student_id, first_name, last_name, email, phone, department, \
                               batch, semester, face_encoding, image_ref, created_at";

impl StudentStore for SqliteStore {
    async fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, first_name, last_name, face_encoding FROM students
                     WHERE face_encoding IS NOT NULL ORDER BY student_id",
                )?;
                let entries = stmt
                    .query_map([], |row| {
                        let first: String = row.get(1)?;
                        let last: String = row.get(2)?;
                        Ok(GalleryEntry {
                            student_id: row.get(0)?,
                            name: format!("{} {}", first.trim(), last.trim()),
                            encoding: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
            .map_err(backend)
    }

    async fn insert_student(&self, student: NewStudent) -> Result<StudentRecord, StoreError> {
        let image_ref = image_ref(&student.image);
        let record = StudentRecord {
            metadata: student.metadata,
            encoding: Some(student.encoding),
            image_ref,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let image = student.image;

        let inserted = record.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let m = &inserted.metadata;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM students WHERE student_id = ?1)",
                    params![m.student_id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(Err(StoreError::DuplicateStudent(m.student_id.clone())));
                }

                tx.execute(
                    "INSERT OR IGNORE INTO student_images (image_ref, data) VALUES (?1, ?2)",
                    params![inserted.image_ref, image],
                )?;
                tx.execute(
                    &format!(
                        "INSERT INTO students ({STUDENT_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        m.student_id,
                        m.first_name,
                        m.last_name,
                        m.email,
                        m.phone,
                        m.department,
                        m.batch,
                        m.semester,
                        inserted.encoding,
                        inserted.image_ref,
                        inserted.created_at,
                    ],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(backend)??;

        tracing::debug!(student = %record.metadata.student_id, image = %record.image_ref, "student stored");
        Ok(record)
    }

    async fn record_attendance(
        &self,
        session: SessionInfo,
        records: Vec<AttendanceRecord>,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO attendance_sessions (session_id, name, started_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(session_id) DO NOTHING",
                    params![session.session_id, session.name, session.started_at],
                )?;

                {
                    let mut known = tx.prepare("SELECT EXISTS(SELECT 1 FROM students WHERE student_id = ?1)")?;
                    let mut upsert = tx.prepare(
                        "INSERT INTO attendance_records (id, session_id, student_id, timestamp, confidence)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(session_id, student_id) DO UPDATE SET
                             timestamp = excluded.timestamp,
                             confidence = excluded.confidence
                         WHERE excluded.confidence > attendance_records.confidence",
                    )?;
                    for r in &records {
                        let exists: bool = known.query_row(params![r.student_id], |row| row.get(0))?;
                        if !exists {
                            // Dropping the transaction rolls back the session row too.
                            return Ok(Err(StoreError::UnknownStudent(r.student_id.clone())));
                        }
                        upsert.execute(params![
                            uuid::Uuid::new_v4().to_string(),
                            r.session_id,
                            r.student_id,
                            r.timestamp,
                            r.confidence,
                        ])?;
                    }
                }

                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(backend)?
    }

    async fn students(&self) -> Result<Vec<StudentRecord>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY student_id"))?;
                let rows = stmt
                    .query_map([], student_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)
    }

    async fn sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, name, started_at FROM attendance_sessions
                     ORDER BY started_at, session_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SessionInfo {
                            session_id: row.get(0)?,
                            name: row.get(1)?,
                            started_at: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)
    }

    async fn session_summaries(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, StoreError> {
        let summaries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.session_id, s.name, s.started_at, COUNT(r.student_id)
                     FROM attendance_sessions s
                     LEFT JOIN attendance_records r ON r.session_id = s.session_id
                     GROUP BY s.session_id
                     ORDER BY s.started_at DESC, s.session_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SessionSummary {
                            session: SessionInfo {
                                session_id: row.get(0)?,
                                name: row.get(1)?,
                                started_at: row.get(2)?,
                            },
                            student_count: row.get::<_, i64>(3)? as usize,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;

        // Stored times may carry different offsets, so the date bounds and
        // final ordering are applied on parsed values.
        Ok(filter.apply(summaries))
    }

    async fn session_attendance(&self, session_id: String) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, student_id, timestamp, confidence FROM attendance_records
                     WHERE session_id = ?1 ORDER BY student_id",
                )?;
                let rows = stmt
                    .query_map(params![session_id], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)
    }

    async fn student_attendance(&self, student_id: String) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, student_id, timestamp, confidence FROM attendance_records
                     WHERE student_id = ?1 ORDER BY timestamp, session_id",
                )?;
                let rows = stmt
                    .query_map(params![student_id], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_student(id: &str, image: &[u8]) -> NewStudent {
        NewStudent {
            metadata: StudentMetadata {
                student_id: id.into(),
                first_name: "Alan".into(),
                last_name: "Turing".into(),
                email: "alan@example.edu".into(),
                phone: Some("555-0100".into()),
                department: Some("Mathematics".into()),
                batch: Some("2026".into()),
                semester: None,
            },
            encoding: "0.5,-0.5,1".into(),
            image: image.to_vec(),
        }
    }

    fn record(session: &str, student: &str, confidence: f64) -> AttendanceRecord {
        AttendanceRecord {
            session_id: session.into(),
            student_id: student.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            confidence,
        }
    }

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.into(),
            name: "Compilers".into(),
            started_at: Some("2026-03-02T09:00:00+00:00".into()),
        }
    }

    #[test]
    fn test_image_ref_is_content_address() {
        let a = image_ref(b"abc");
        assert_eq!(a, "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_ne!(a, image_ref(b"abd"));
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let stored = store.insert_student(new_student("T1", b"png")).await.unwrap();

        let students = store.students().await.unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0], stored);
        assert_eq!(students[0].metadata.department.as_deref(), Some("Mathematics"));

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery[0].name, "Alan Turing");
        assert_eq!(gallery[0].encoding, "0.5,-0.5,1");

        assert_eq!(store.student_image("T1".into()).await.unwrap().as_deref(), Some(&b"png"[..]));
        assert_eq!(store.student_image("nobody".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reregistration_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_student(new_student("T1", b"one")).await.unwrap();
        let err = store.insert_student(new_student("T1", b"two")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStudent(id) if id == "T1"));
        assert_eq!(store.student_image("T1".into()).await.unwrap().as_deref(), Some(&b"one"[..]));
    }

    #[tokio::test]
    async fn test_shared_image_stored_once() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_student(new_student("T1", b"same")).await.unwrap();
        store.insert_student(new_student("T2", b"same")).await.unwrap();
        assert_eq!(store.students().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attendance_upsert_keeps_best_confidence() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_student(new_student("T1", b"a")).await.unwrap();
        store.insert_student(new_student("T2", b"b")).await.unwrap();

        store
            .record_attendance(session("C1"), vec![record("C1", "T1", 0.81), record("C1", "T2", 0.9)])
            .await
            .unwrap();
        store.record_attendance(session("C1"), vec![record("C1", "T1", 0.95)]).await.unwrap();
        store.record_attendance(session("C1"), vec![record("C1", "T1", 0.75)]).await.unwrap();

        let rows = store.session_attendance("C1".into()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].student_id, "T1");
        assert_eq!(rows[0].confidence, 0.95);

        assert_eq!(store.sessions().await.unwrap(), vec![session("C1")]);
        assert_eq!(store.student_attendance("T2".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_student_rolls_back() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_student(new_student("T1", b"a")).await.unwrap();

        let err = store
            .record_attendance(session("C2"), vec![record("C2", "T1", 0.9), record("C2", "ghost", 0.9)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownStudent(id) if id == "ghost"));
        assert!(store.sessions().await.unwrap().is_empty());
        assert!(store.student_attendance("T1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_attendance_opens_session() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.record_attendance(session("C3"), vec![]).await.unwrap();
        assert_eq!(store.sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_summaries_newest_first_with_counts() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_student(new_student("T1", b"a")).await.unwrap();
        store.insert_student(new_student("T2", b"b")).await.unwrap();

        let at = |id: &str, name: &str, started_at: &str| SessionInfo {
            session_id: id.into(),
            name: name.into(),
            started_at: Some(started_at.into()),
        };
        store
            .record_attendance(
                at("C1", "Compilers", "2026-03-02T09:00:00+00:00"),
                vec![record("C1", "T1", 0.9), record("C1", "T2", 0.8)],
            )
            .await
            .unwrap();
        store
            .record_attendance(at("C2", "Compilers lab", "2026-03-04T14:00:00+00:00"), vec![record("C2", "T2", 0.9)])
            .await
            .unwrap();
        store
            .record_attendance(at("D1", "Databases", "2026-03-03T09:00:00+00:00"), vec![])
            .await
            .unwrap();

        let all = store.session_summaries(SessionFilter::default()).await.unwrap();
        let rows: Vec<(&str, usize)> = all
            .iter()
            .map(|s| (s.session.session_id.as_str(), s.student_count))
            .collect();
        assert_eq!(rows, [("C2", 1), ("D1", 0), ("C1", 2)]);

        let filter = SessionFilter::from_args("compilers", "", "2026-03-03", 0).unwrap();
        let filtered = store.session_summaries(filter).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].session.session_id, "C1");
    }
}
