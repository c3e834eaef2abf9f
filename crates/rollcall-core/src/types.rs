use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("encoding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("malformed stored encoding: {0}")]
    Parse(String),
}

/// A single facial keypoint in frame pixel coordinates.
///
/// Models that emit a depth component fill `z`; it never takes part in
/// the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from top-left and bottom-right corners.
    pub fn from_corners(top_left: (f32, f32), bottom_right: (f32, f32)) -> Self {
        Self {
            x: top_left.0,
            y: top_left.1,
            width: bottom_right.0 - top_left.0,
            height: bottom_right.1 - top_left.1,
        }
    }

    pub fn top_left(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn bottom_right(&self) -> (f32, f32) {
        (self.x + self.width, self.y + self.height)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One detected face: box, detector confidence in [0, 1], ordered landmarks.
///
/// Backends that compute the feature vector themselves fill `encoding`;
/// such faces may carry no landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
}

/// Normalized landmark feature vector, laid out as `x0, y0, x1, y1, ...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub values: Vec<f64>,
}

impl Encoding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Accept a vector produced outside this crate (e.g. by the remote
    /// service): non-empty and finite.
    pub fn checked(values: Vec<f64>) -> Result<Self, EncodingError> {
        if values.is_empty() {
            return Err(EncodingError::InvalidInput("empty encoding".into()));
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EncodingError::InvalidInput(format!("component {i} is not finite")));
        }
        Ok(Self { values })
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-magnitude operand scores 0. Encodings of different length
    /// come from incompatible landmark models and are rejected.
    pub fn similarity(&self, other: &Encoding) -> Result<f64, EncodingError> {
        if self.values.len() != other.values.len() {
            return Err(EncodingError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        // Scale each side by its largest magnitude so the squared sums
        // neither overflow nor underflow; cosine is invariant to it.
        let scale_a = max_abs(&self.values);
        let scale_b = max_abs(&other.values);
        if scale_a == 0.0 || scale_b == 0.0 || !scale_a.is_finite() || !scale_b.is_finite() {
            return Ok(0.0);
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a / scale_a, b / scale_b);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
        if !cosine.is_finite() {
            return Ok(0.0);
        }
        Ok(cosine.clamp(-1.0, 1.0))
    }

    /// Comma-joined decimal form persisted with a student record.
    ///
    /// `f64` display is the shortest representation that parses back to
    /// the same bits, so `parse(to_storage_string())` is lossless.
    pub fn to_storage_string(&self) -> String {
        self.values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a stored encoding.
    ///
    /// Accepts the plain comma-joined form and the base64-wrapped
    /// comma-joined form written by older registration clients.
    pub fn parse(stored: &str) -> Result<Self, EncodingError> {
        let stored = stored.trim();
        if stored.is_empty() {
            return Err(EncodingError::Parse("empty encoding".into()));
        }

        match parse_decimal_list(stored) {
            Ok(values) => Ok(Self { values }),
            Err(plain_err) => {
                let Some(unwrapped) = unwrap_base64(stored) else {
                    return Err(plain_err);
                };
                parse_decimal_list(&unwrapped).map(|values| Self { values })
            }
        }
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

fn parse_decimal_list(s: &str) -> Result<Vec<f64>, EncodingError> {
    s.split(',')
        .enumerate()
        .map(|(i, field)| {
            let field = field.trim();
            let value: f64 = field
                .parse()
                .map_err(|_| EncodingError::Parse(format!("field {i}: {field:?} is not a number")))?;
            if !value.is_finite() {
                return Err(EncodingError::Parse(format!("field {i}: non-finite value")));
            }
            Ok(value)
        })
        .collect()
}

fn unwrap_base64(s: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    String::from_utf8(bytes).ok()
}

/// A gallery student accepted as the identity of one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub student_id: String,
    pub name: String,
    /// Cosine similarity of the match, always above the configured threshold.
    pub score: f64,
}
