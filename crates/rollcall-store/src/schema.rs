//! Table layout and forward-only migrations, tracked with `user_version`.

use rusqlite::Connection;

/// Each entry moves the database from version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE students (
        student_id    TEXT PRIMARY KEY,
        first_name    TEXT NOT NULL,
        last_name     TEXT NOT NULL,
        email         TEXT NOT NULL,
        phone         TEXT,
        department    TEXT,
        batch         TEXT,
        semester      TEXT,
        face_encoding TEXT,
        image_ref     TEXT NOT NULL REFERENCES student_images(image_ref),
        created_at    TEXT NOT NULL
    );

    CREATE TABLE student_images (
        image_ref TEXT PRIMARY KEY,
        data      BLOB NOT NULL
    );

    CREATE TABLE attendance_sessions (
        session_id TEXT PRIMARY KEY,
        name       TEXT NOT NULL,
        started_at TEXT
    );

    CREATE TABLE attendance_records (
        id         TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES attendance_sessions(session_id),
        student_id TEXT NOT NULL REFERENCES students(student_id),
        timestamp  TEXT NOT NULL,
        confidence REAL NOT NULL,
        UNIQUE (session_id, student_id)
    );

    CREATE INDEX attendance_records_student ON attendance_records(student_id);
    ",
];

pub const SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Apply every migration newer than the database's `user_version`.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.pragma_update(None, "foreign_keys", true)?;

    let current: usize = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    for (version, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        tracing::info!(version = version + 1, "applied schema migration");
    }
    Ok(SCHEMA_VERSION.max(current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
