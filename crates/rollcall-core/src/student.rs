//! Student, session and attendance records exchanged with storage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("invalid email address: {0}")]
    Email(String),
    #[error("invalid date {0:?} (expected YYYY-MM-DD or RFC 3339)")]
    Date(String),
}

/// Identity and contact fields supplied at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentMetadata {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub batch: Option<String>,
    #[serde(default)]
    pub semester: Option<String>,
}

impl StudentMetadata {
    /// Trim every field, drop blank optional ones, then validate. The
    /// returned value is what gets stored.
    pub fn validated(self) -> Result<Self, ValidationError> {
        let metadata = StudentMetadata {
            student_id: self.student_id.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: trimmed(self.phone),
            department: trimmed(self.department),
            batch: trimmed(self.batch),
            semester: trimmed(self.semester),
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Reject records the registration form would not have accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("student_id", &self.student_id)?;
        require("first_name", &self.first_name)?;
        require("last_name", &self.last_name)?;
        require("email", &self.email)?;

        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(ValidationError::Email(email.to_string())),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Missing(field))
    } else {
        Ok(())
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Everything persisted by one enrollment, written atomically.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub metadata: StudentMetadata,
    /// Serialized [`Encoding`](crate::Encoding).
    pub encoding: String,
    /// Encoded image bytes as captured.
    pub image: Vec<u8>,
}

/// A stored student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(flatten)]
    pub metadata: StudentMetadata,
    pub encoding: Option<String>,
    /// Content address of the stored image (`sha256:<hex>`).
    pub image_ref: String,
    pub created_at: String,
}

/// Gallery row: the minimum needed to score and name a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub student_id: String,
    pub name: String,
    pub encoding: String,
}

/// Attendance session supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    /// RFC 3339 start time; filled with the current time when omitted.
    #[serde(default)]
    pub started_at: Option<String>,
}

impl SessionInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("session_id", &self.session_id)?;
        require("name", &self.name)
    }

    /// Trimmed copy, validated.
    pub fn validated(self) -> Result<Self, ValidationError> {
        let session = SessionInfo {
            session_id: self.session_id.trim().to_string(),
            name: self.name.trim().to_string(),
            started_at: trimmed(self.started_at),
        };
        session.validate()?;
        Ok(session)
    }

    fn started(&self) -> Option<DateTime<Utc>> {
        let started_at = self.started_at.as_deref()?;
        DateTime::parse_from_rfc3339(started_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A session together with how many students were marked present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub student_count: usize,
}

/// Selection applied to session listings.
///
/// `search` matches the session name or id, case-insensitively. The
/// date bounds are inclusive; sessions without a parsable start time are
/// excluded once either bound is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    pub search: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Build from request strings, where empty means "not set". A bare
    /// `until` date covers the whole day.
    pub fn from_args(search: &str, since: &str, until: &str, limit: u32) -> Result<Self, ValidationError> {
        let search = search.trim();
        Ok(Self {
            search: (!search.is_empty()).then(|| search.to_string()),
            since: parse_bound(since, false)?,
            until: parse_bound(until, true)?,
            limit: (limit > 0).then_some(limit as usize),
        })
    }

    pub fn matches(&self, session: &SessionInfo) -> bool {
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !session.name.to_lowercase().contains(&needle)
                && !session.session_id.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        let Some(started) = session.started() else {
            return false;
        };
        self.since.map_or(true, |since| started >= since) && self.until.map_or(true, |until| started <= until)
    }

    /// Keep matching sessions, newest first, truncated to `limit`.
    pub fn apply(&self, summaries: Vec<SessionSummary>) -> Vec<SessionSummary> {
        let mut kept: Vec<SessionSummary> = summaries
            .into_iter()
            .filter(|s| self.matches(&s.session))
            .collect();
        // Undated sessions sort last; the id keeps the order stable.
        kept.sort_by(|a, b| {
            b.session
                .started()
                .cmp(&a.session.started())
                .then_with(|| a.session.session_id.cmp(&b.session.session_id))
        });
        if let Some(limit) = self.limit {
            kept.truncate(limit);
        }
        kept
    }
}

fn parse_bound(text: &str, end_of_day: bool) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(t.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| ValidationError::Date(text.to_string()))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| Some(t.and_utc()))
        .ok_or_else(|| ValidationError::Date(text.to_string()))
}

/// One recognized student in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub session_id: String,
    pub student_id: String,
    pub timestamp: String,
    /// Similarity score of the match that produced this record.
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> StudentMetadata {
        StudentMetadata {
            student_id: "S1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.edu".into(),
            phone: None,
            department: Some("CS".into()),
            batch: None,
            semester: None,
        }
    }

    #[test]
    fn test_valid_metadata() {
        assert_eq!(metadata().validate(), Ok(()));
        assert_eq!(metadata().display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_missing_fields() {
        let mut m = metadata();
        m.student_id = "  ".into();
        assert_eq!(m.validate(), Err(ValidationError::Missing("student_id")));

        let mut m = metadata();
        m.last_name.clear();
        assert_eq!(m.validate(), Err(ValidationError::Missing("last_name")));
    }

    #[test]
    fn test_bad_email() {
        let mut m = metadata();
        m.email = "ada.example.edu".into();
        assert!(matches!(m.validate(), Err(ValidationError::Email(_))));
        m.email = "@example.edu".into();
        assert!(matches!(m.validate(), Err(ValidationError::Email(_))));
    }

    #[test]
    fn test_metadata_json_optional_fields() {
        let m: StudentMetadata = serde_json::from_str(
            r#"{"student_id":"S2","first_name":"Alan","last_name":"Turing","email":"alan@example.edu"}"#,
        )
        .unwrap();
        assert_eq!(m.phone, None);
        assert_eq!(m.validate(), Ok(()));
    }

    #[test]
    fn test_validated_trims_identity() {
        let mut m = metadata();
        m.student_id = " S1 ".into();
        m.email = " ada@example.edu\n".into();
        m.phone = Some("   ".into());
        let m = m.validated().unwrap();
        assert_eq!(m.student_id, "S1");
        assert_eq!(m.email, "ada@example.edu");
        assert_eq!(m.phone, None);

        let s = SessionInfo { session_id: "\tL1 ".into(), name: " Algebra".into(), started_at: None };
        assert_eq!(s.validated().unwrap().session_id, "L1");
    }

    fn summary(id: &str, name: &str, started_at: Option<&str>, student_count: usize) -> SessionSummary {
        SessionSummary {
            session: SessionInfo {
                session_id: id.into(),
                name: name.into(),
                started_at: started_at.map(String::from),
            },
            student_count,
        }
    }

    fn listing() -> Vec<SessionSummary> {
        vec![
            summary("L1", "Algebra", Some("2026-03-01T09:00:00+00:00"), 12),
            summary("L3", "Physics", Some("2026-03-03T23:30:00+00:00"), 4),
            summary("L2", "Linear algebra", Some("2026-03-02T10:00:00+00:00"), 7),
            summary("X", "Makeup", None, 1),
        ]
    }

    fn ids(summaries: &[SessionSummary]) -> Vec<&str> {
        summaries.iter().map(|s| s.session.session_id.as_str()).collect()
    }

    #[test]
    fn test_session_filter_orders_newest_first() {
        let all = SessionFilter::default().apply(listing());
        assert_eq!(ids(&all), ["L3", "L2", "L1", "X"]);

        let top = SessionFilter { limit: Some(2), ..SessionFilter::default() }.apply(listing());
        assert_eq!(ids(&top), ["L3", "L2"]);
    }

    #[test]
    fn test_session_filter_search_and_dates() {
        let by_name = SessionFilter::from_args("ALGEBRA", "", "", 0).unwrap().apply(listing());
        assert_eq!(ids(&by_name), ["L2", "L1"]);

        let by_id = SessionFilter::from_args("x", "", "", 0).unwrap().apply(listing());
        assert_eq!(ids(&by_id), ["X"]);

        // A bare `until` date includes the whole day.
        let window = SessionFilter::from_args("", "2026-03-02", "2026-03-03", 0).unwrap().apply(listing());
        assert_eq!(ids(&window), ["L3", "L2"]);

        let exact = SessionFilter::from_args("", "2026-03-01T09:00:00Z", "2026-03-01T09:00:00Z", 0)
            .unwrap()
            .apply(listing());
        assert_eq!(ids(&exact), ["L1"]);
    }

    #[test]
    fn test_session_filter_rejects_bad_dates() {
        assert!(matches!(SessionFilter::from_args("", "yesterday", "", 0), Err(ValidationError::Date(_))));
        assert!(matches!(SessionFilter::from_args("", "", "2026-02-30", 0), Err(ValidationError::Date(_))));
    }

    #[test]
    fn test_summary_json_is_flat() {
        let json = serde_json::to_value(summary("L1", "Algebra", None, 3)).unwrap();
        assert_eq!(json["session_id"], "L1");
        assert_eq!(json["student_count"], 3);
    }

    #[test]
    fn test_session_validate() {
        let s = SessionInfo { session_id: "".into(), name: "Algebra".into(), started_at: None };
        assert_eq!(s.validate(), Err(ValidationError::Missing("session_id")));
    }
}
