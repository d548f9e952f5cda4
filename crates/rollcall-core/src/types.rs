use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in the pixel space of the image the detector ran on; when
/// a rotation strategy produced the detection, that is the rotated image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for the bundled ArcFace model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a normal float (no NaN/inf). Enrollment
    /// rejects embeddings that fail this check.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled identity with its reference embedding.
///
/// The embedding is immutable once enrolled; re-enrollment under the same id
/// is rejected rather than mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub created_at: String,
}

/// One detected face that survived embedding extraction. Transient: produced
/// per frame, consumed by the matcher, never persisted.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// Attendance classification for one face in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceStatus {
    NewlyMarked,
    AlreadyMarked,
    Unknown,
}

/// Per-face result as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizedFace {
    pub identity_id: Option<String>,
    pub name: Option<String>,
    pub distance: Option<f32>,
    pub status: FaceStatus,
    pub face_location: BoundingBox,
}

/// Counts for one processed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub total_faces_detected: usize,
    pub newly_marked: usize,
    pub already_marked: usize,
    pub unknown_faces: usize,
}

/// Aggregate outcome of one frame: per-face results ordered newly_marked,
/// then already_marked, then unknown, plus summary counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameReport {
    pub results: Vec<RecognizedFace>,
    pub summary: FrameSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = Embedding::new(vec![0.5, -1.5, 2.0]);
        let b = Embedding::new(vec![-0.25, 0.75, 1.0]);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
    }

    #[test]
    fn test_is_finite_rejects_nan() {
        let e = Embedding::new(vec![0.0, f32::NAN]);
        assert!(!e.is_finite());
    }

    #[test]
    fn test_is_finite_rejects_infinity() {
        let e = Embedding::new(vec![f32::INFINITY, 1.0]);
        assert!(!e.is_finite());
    }

    #[test]
    fn test_face_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&FaceStatus::NewlyMarked).unwrap(),
            "\"newly_marked\""
        );
        assert_eq!(
            serde_json::to_string(&FaceStatus::AlreadyMarked).unwrap(),
            "\"already_marked\""
        );
        assert_eq!(
            serde_json::to_string(&FaceStatus::Unknown).unwrap(),
            "\"unknown\""
        );
    }
}
