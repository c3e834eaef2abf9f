//! Landmark geometry → encoding.
//!
//! Centers the (x, y) landmarks on their centroid and divides by the mean
//! distance to it, which removes translation and scale. Stored encodings
//! depend on this exact arithmetic order; do not reorder the sums.

use crate::types::{Encoding, EncodingError, FaceDetection, Landmark};

/// Convert one face's landmarks into its encoding (`2 * landmarks.len()` values).
pub fn normalize(landmarks: &[Landmark]) -> Result<Encoding, EncodingError> {
    if landmarks.is_empty() {
        return Err(EncodingError::InvalidInput("no landmarks".into()));
    }
    if let Some(i) = landmarks
        .iter()
        .position(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        return Err(EncodingError::InvalidInput(format!("landmark {i} is not finite")));
    }

    let n = landmarks.len() as f64;
    let (cx, cy) = centroid(landmarks, n);

    let centered: Vec<(f64, f64)> = landmarks.iter().map(|p| (p.x - cx, p.y - cy)).collect();

    let avg_distance = centered
        .iter()
        .map(|(x, y)| x.hypot(*y))
        .sum::<f64>()
        / n;

    if avg_distance == 0.0 || !avg_distance.is_finite() {
        tracing::error!(count = landmarks.len(), "degenerate landmark set: all points coincide");
        return Err(EncodingError::InvalidInput(
            "landmarks collapse to a single point".into(),
        ));
    }

    let values = centered
        .into_iter()
        .flat_map(|(x, y)| [x / avg_distance, y / avg_distance])
        .collect();

    Ok(Encoding::new(values))
}

/// Encoding for one detected face: the vector the backend computed, when
/// it supplied one, else the normalized landmarks.
pub fn face_encoding(face: &FaceDetection) -> Result<Encoding, EncodingError> {
    match &face.encoding {
        Some(encoding) => Encoding::checked(encoding.values.clone()),
        None => normalize(&face.landmarks),
    }
}

fn centroid(points: &[Landmark], n: f64) -> (f64, f64) {
    let sum_x: f64 = points.iter().map(|p| p.x).sum();
    let sum_y: f64 = points.iter().map(|p| p.y).sum();
    (sum_x / n, sum_y / n)
}
