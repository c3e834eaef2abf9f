//! Nearest-match search of detected faces against the enrolled gallery.

use crate::student::GalleryEntry;
use crate::types::{Encoding, EncodingError, MatchResult};
use serde::Serialize;
use std::collections::HashMap;

/// Similarity above which a face is accepted as a gallery student.
pub const DEFAULT_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    /// A face matches only when its best score is strictly greater.
    pub threshold: f64,
    /// Let one student be matched by several faces in the same frame.
    pub allow_duplicates: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            allow_duplicates: false,
        }
    }
}

struct GalleryStudent {
    student_id: String,
    name: String,
    encoding: Encoding,
}

/// Parsed gallery, ordered by student id.
pub struct Gallery {
    students: Vec<GalleryStudent>,
}

/// Best-scoring gallery position for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub score: f64,
}

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceOutcome {
    Matched(MatchResult),
    /// No gallery entry scored above the threshold (or the gallery is empty).
    BelowThreshold { best_score: Option<f64> },
    /// The face's best match was claimed by a higher-scoring face.
    DuplicateOf {
        face: usize,
        student_id: String,
        score: f64,
    },
    /// The face's geometry could not be encoded (e.g. collapsed landmarks).
    Rejected { reason: String },
}

impl FaceOutcome {
    pub fn matched(&self) -> Option<&MatchResult> {
        match self {
            FaceOutcome::Matched(m) => Some(m),
            _ => None,
        }
    }
}

impl Gallery {
    /// Parse every stored encoding once. Equal scores later resolve to
    /// the lowest student id, so the ordering here is the tie-break.
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, EncodingError> {
        let mut students = entries
            .into_iter()
            .map(|entry| {
                let encoding = Encoding::parse(&entry.encoding).map_err(|e| {
                    tracing::error!(student = %entry.student_id, error = %e, "stored encoding is corrupt");
                    EncodingError::Parse(format!("student {}: {e}", entry.student_id))
                })?;
                Ok(GalleryStudent {
                    student_id: entry.student_id,
                    name: entry.name,
                    encoding,
                })
            })
            .collect::<Result<Vec<_>, EncodingError>>()?;

        students.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        Ok(Self { students })
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    /// Highest-scoring entry for `query`, `None` for an empty gallery.
    pub fn best_match(&self, query: &Encoding) -> Result<Option<Candidate>, EncodingError> {
        let mut best: Option<Candidate> = None;

        for (index, student) in self.students.iter().enumerate() {
            let score = query.similarity(&student.encoding).map_err(|e| {
                tracing::error!(
                    student = %student.student_id,
                    query_len = query.len(),
                    stored_len = student.encoding.len(),
                    "encoding dimension mismatch: gallery and detector disagree on landmark model"
                );
                e
            })?;
            // Strict comparison keeps the earliest (lowest id) entry on ties.
            if best.map_or(true, |b| score > b.score) {
                best = Some(Candidate { index, score });
            }
        }

        Ok(best)
    }

    fn result(&self, candidate: Candidate) -> MatchResult {
        let student = &self.students[candidate.index];
        MatchResult {
            student_id: student.student_id.clone(),
            name: student.name.clone(),
            score: candidate.score,
        }
    }
}

/// Match each face independently, then (unless duplicates are allowed)
/// keep each student only on its highest-scoring face.
///
/// A face whose encoding could not be computed becomes
/// [`FaceOutcome::Rejected`] without affecting the others. A dimension
/// mismatch against the gallery is a configuration fault and fails the
/// whole call.
pub fn assign(
    faces: &[Result<Encoding, EncodingError>],
    gallery: &Gallery,
    config: &MatchConfig,
) -> Result<Vec<FaceOutcome>, EncodingError> {
    let mut outcomes = Vec::with_capacity(faces.len());

    for (face, encoding) in faces.iter().enumerate() {
        let query = match encoding {
            Ok(encoding) => encoding,
            Err(e) => {
                tracing::error!(face, error = %e, "face rejected: no usable encoding");
                outcomes.push(FaceOutcome::Rejected { reason: e.to_string() });
                continue;
            }
        };
        let best = gallery.best_match(query)?;
        outcomes.push(match best {
            Some(c) if c.score > config.threshold => FaceOutcome::Matched(gallery.result(c)),
            other => FaceOutcome::BelowThreshold {
                best_score: other.map(|c| c.score),
            },
        });
    }

    if !config.allow_duplicates {
        resolve_duplicates(&mut outcomes);
    }

    Ok(outcomes)
}

fn resolve_duplicates(outcomes: &mut [FaceOutcome]) {
    // student id -> (winning face, score); ties keep the lower face index
    let mut winners: HashMap<String, (usize, f64)> = HashMap::new();
    for (face, outcome) in outcomes.iter().enumerate() {
        if let FaceOutcome::Matched(m) = outcome {
            let entry = winners.entry(m.student_id.clone()).or_insert((face, m.score));
            if m.score > entry.1 {
                *entry = (face, m.score);
            }
        }
    }

    for (face, outcome) in outcomes.iter_mut().enumerate() {
        let (student_id, score) = match outcome {
            FaceOutcome::Matched(m) => (m.student_id.clone(), m.score),
            _ => continue,
        };
        let (winner, _) = winners[&student_id];
        if winner != face {
            tracing::debug!(face, winner, student = %student_id, "dropping duplicate match");
            *outcome = FaceOutcome::DuplicateOf {
                face: winner,
                student_id,
                score,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, values: &[f64]) -> GalleryEntry {
        GalleryEntry {
            student_id: id.into(),
            name: format!("Student {id}"),
            encoding: Encoding::new(values.to_vec()).to_storage_string(),
        }
    }

    fn face(values: &[f64]) -> Result<Encoding, EncodingError> {
        Ok(Encoding::new(values.to_vec()))
    }

    #[test]
    fn test_best_match_scans_whole_gallery() {
        let gallery = Gallery::from_entries(vec![
            entry("1", &[0.0, 1.0, 0.0]),
            entry("2", &[0.0, 0.0, 1.0]),
            entry("3", &[1.0, 0.0, 0.0]),
        ])
        .unwrap();

        let best = gallery.best_match(&Encoding::new(vec![1.0, 0.0, 0.0])).unwrap().unwrap();
        assert_eq!(gallery.result(best).student_id, "3");
        assert!((best.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_gallery() {
        let gallery = Gallery::from_entries(vec![]).unwrap();
        assert!(gallery.is_empty());
        let outcomes = assign(&[face(&[1.0, 0.0])], &gallery, &MatchConfig::default()).unwrap();
        assert_eq!(outcomes, vec![FaceOutcome::BelowThreshold { best_score: None }]);
    }

    #[test]
    fn test_threshold_is_strict() {
        // A perfect score still fails a threshold of exactly 1.0.
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0])]).unwrap();
        let config = MatchConfig { threshold: 1.0, allow_duplicates: false };
        let outcomes = assign(&[face(&[1.0, 0.0])], &gallery, &config).unwrap();
        assert_eq!(outcomes, vec![FaceOutcome::BelowThreshold { best_score: Some(1.0) }]);
    }

    #[test]
    fn test_tie_break_lowest_id() {
        // Insertion order deliberately reversed.
        let gallery = Gallery::from_entries(vec![
            entry("S9", &[1.0, 0.0]),
            entry("S2", &[2.0, 0.0]),
            entry("S5", &[3.0, 0.0]),
        ])
        .unwrap();
        let outcomes = assign(&[face(&[1.0, 0.0])], &gallery, &MatchConfig::default()).unwrap();
        assert_eq!(outcomes[0].matched().unwrap().student_id, "S2");
    }

    #[test]
    fn test_duplicates_resolved_to_highest_score() {
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0])]).unwrap();
        let faces = [face(&[1.0, 0.3]), face(&[1.0, 0.1])];

        let outcomes = assign(&faces, &gallery, &MatchConfig::default()).unwrap();
        assert!(matches!(&outcomes[0], FaceOutcome::DuplicateOf { face: 1, student_id, .. } if student_id == "A"));
        assert_eq!(outcomes[1].matched().unwrap().student_id, "A");
    }

    #[test]
    fn test_duplicates_allowed() {
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0])]).unwrap();
        let faces = [face(&[1.0, 0.3]), face(&[1.0, 0.1])];
        let config = MatchConfig { allow_duplicates: true, ..MatchConfig::default() };

        let outcomes = assign(&faces, &gallery, &config).unwrap();
        assert!(outcomes.iter().all(|o| o.matched().is_some()));
    }

    #[test]
    fn test_duplicate_tie_keeps_first_face() {
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0])]).unwrap();
        let faces = [face(&[2.0, 0.0]), face(&[1.0, 0.0])];
        let outcomes = assign(&faces, &gallery, &MatchConfig::default()).unwrap();
        assert!(outcomes[0].matched().is_some());
        assert!(matches!(outcomes[1], FaceOutcome::DuplicateOf { face: 0, .. }));
    }

    #[test]
    fn test_dimension_mismatch_propagates() {
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
        let err = assign(&[face(&[1.0, 0.0])], &gallery, &MatchConfig::default()).unwrap_err();
        assert_eq!(err, EncodingError::DimensionMismatch { left: 2, right: 4 });
    }

    #[test]
    fn test_unencodable_face_does_not_affect_others() {
        let gallery = Gallery::from_entries(vec![entry("A", &[1.0, 0.0])]).unwrap();
        let faces = [
            Err(EncodingError::InvalidInput("landmarks collapse to a single point".into())),
            face(&[1.0, 0.05]),
        ];

        let outcomes = assign(&faces, &gallery, &MatchConfig::default()).unwrap();
        assert!(matches!(&outcomes[0], FaceOutcome::Rejected { reason } if reason.contains("single point")));
        assert_eq!(outcomes[1].matched().unwrap().student_id, "A");

        let json = serde_json::to_value(&outcomes[0]).unwrap();
        assert_eq!(json["status"], "rejected");
    }

    #[test]
    fn test_corrupt_entry_rejected() {
        let bad = GalleryEntry {
            student_id: "X".into(),
            name: "X".into(),
            encoding: "1,two,3".into(),
        };
        assert!(matches!(Gallery::from_entries(vec![bad]), Err(EncodingError::Parse(_))));
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = FaceOutcome::Matched(MatchResult {
            student_id: "S1".into(),
            name: "Ada Lovelace".into(),
            score: 0.93,
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "matched");
        assert_eq!(json["student_id"], "S1");
    }
}
