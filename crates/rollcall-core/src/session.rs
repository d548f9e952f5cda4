//! Session deduplication: at most one attendance record per identity per
//! session, no matter how many frames or faces resolve to that identity.

use crate::matcher::BestMatch;
use crate::types::{
    BoundingBox, FaceStatus, FrameReport, FrameSummary, RecognizedFace,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

/// A durable attendance fact. Append-only; never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity_id: String,
    pub session_id: String,
    pub recorded_by: String,
    pub recorded_at: String,
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("attendance already recorded for '{identity_id}' in session '{session_id}'")]
    AlreadyRecorded {
        identity_id: String,
        session_id: String,
    },
    #[error("attendance storage: {0}")]
    Storage(String),
}

/// Check-and-insert gate over durable attendance storage.
///
/// `record` must be atomic: two concurrent calls for the same
/// `(identity_id, session_id)` yield exactly one `Ok` and one
/// `AlreadyRecorded`. A non-atomic check-then-insert implementation is a
/// defect, not an accepted limitation.
pub trait AttendanceGate {
    fn has_recorded(&self, identity_id: &str, session_id: &str) -> Result<bool, GateError>;

    fn record(
        &self,
        identity_id: &str,
        session_id: &str,
        recorded_by: &str,
    ) -> Result<AttendanceRecord, GateError>;
}

/// Caller context for one recognition request.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: String,
    pub recorded_by: String,
    /// Identities the client already saw credited this session; these skip
    /// the gate lookup entirely and classify `already_marked`.
    pub already_recognized: HashSet<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, recorded_by: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            recorded_by: recorded_by.into(),
            already_recognized: HashSet::new(),
        }
    }
}

/// One matched face awaiting classification.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub face_location: BoundingBox,
    pub matched: BestMatch,
}

/// Classify matched faces against the gate and assemble the frame report.
///
/// Results are ordered newly_marked, then already_marked, then unknown.
/// Faces the matcher rejected report `distance: None` rather than the
/// near-miss distance. A storage conflict on `record` means a concurrent
/// writer got there first and classifies `already_marked`; only genuine
/// storage failures abort the frame.
pub fn resolve_frame(
    matches: Vec<FaceMatch>,
    ctx: &SessionContext,
    gate: &dyn AttendanceGate,
) -> Result<FrameReport, GateError> {
    let total = matches.len();
    let mut newly: Vec<RecognizedFace> = Vec::new();
    let mut already: Vec<RecognizedFace> = Vec::new();
    let mut unknown: Vec<RecognizedFace> = Vec::new();

    for FaceMatch {
        face_location,
        matched,
    } in matches
    {
        let Some(identity_id) = matched.identity_id else {
            unknown.push(RecognizedFace {
                identity_id: None,
                name: None,
                distance: None,
                status: FaceStatus::Unknown,
                face_location,
            });
            continue;
        };

        let face = |status: FaceStatus| RecognizedFace {
            identity_id: Some(identity_id.clone()),
            name: matched.display_name.clone(),
            distance: matched.distance,
            status,
            face_location: face_location.clone(),
        };

        if ctx.already_recognized.contains(&identity_id)
            || gate.has_recorded(&identity_id, &ctx.session_id)?
        {
            already.push(face(FaceStatus::AlreadyMarked));
            continue;
        }

        match gate.record(&identity_id, &ctx.session_id, &ctx.recorded_by) {
            Ok(record) => {
                tracing::info!(
                    identity_id = %record.identity_id,
                    session_id = %record.session_id,
                    recorded_by = %record.recorded_by,
                    "attendance recorded"
                );
                newly.push(face(FaceStatus::NewlyMarked));
            }
            // A concurrent writer inserted between the check and our insert.
            Err(GateError::AlreadyRecorded { .. }) => {
                tracing::debug!(
                    %identity_id,
                    session_id = %ctx.session_id,
                    "record conflict, classifying already_marked"
                );
                already.push(face(FaceStatus::AlreadyMarked));
            }
            Err(err) => return Err(err),
        }
    }

    let summary = FrameSummary {
        total_faces_detected: total,
        newly_marked: newly.len(),
        already_marked: already.len(),
        unknown_faces: unknown.len(),
    };

    let mut results = newly;
    results.append(&mut already);
    results.append(&mut unknown);

    Ok(FrameReport { results, summary })
}

/// In-memory gate for tests and embedded callers without durable storage.
///
/// Record ids are sequence numbers and timestamps are empty; durable
/// deployments use the SQLite-backed gate in the daemon.
#[derive(Debug, Default)]
pub struct MemoryGate {
    marked: Mutex<HashSet<(String, String)>>,
}

impl MemoryGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttendanceGate for MemoryGate {
    fn has_recorded(&self, identity_id: &str, session_id: &str) -> Result<bool, GateError> {
        let marked = self
            .marked
            .lock()
            .map_err(|e| GateError::Storage(e.to_string()))?;
        Ok(marked.contains(&(identity_id.to_string(), session_id.to_string())))
    }

    fn record(
        &self,
        identity_id: &str,
        session_id: &str,
        recorded_by: &str,
    ) -> Result<AttendanceRecord, GateError> {
        let mut marked = self
            .marked
            .lock()
            .map_err(|e| GateError::Storage(e.to_string()))?;
        let key = (identity_id.to_string(), session_id.to_string());
        if !marked.insert(key) {
            return Err(GateError::AlreadyRecorded {
                identity_id: identity_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        Ok(AttendanceRecord {
            id: marked.len().to_string(),
            identity_id: identity_id.to_string(),
            session_id: session_id.to_string(),
            recorded_by: recorded_by.to_string(),
            recorded_at: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn matched(id: &str, name: &str, distance: f32) -> FaceMatch {
        FaceMatch {
            face_location: bbox(),
            matched: BestMatch {
                identity_id: Some(id.to_string()),
                display_name: Some(name.to_string()),
                distance: Some(distance),
            },
        }
    }

    fn unmatched(distance: Option<f32>) -> FaceMatch {
        FaceMatch {
            face_location: bbox(),
            matched: BestMatch {
                identity_id: None,
                display_name: None,
                distance,
            },
        }
    }

    #[test]
    fn test_first_sighting_is_newly_marked() {
        let gate = MemoryGate::new();
        let ctx = SessionContext::new("period-1", "camera-1");

        let report = resolve_frame(vec![matched("s1", "Alice", 0.1)], &ctx, &gate).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, FaceStatus::NewlyMarked);
        assert_eq!(report.results[0].distance, Some(0.1));
        assert_eq!(report.summary.newly_marked, 1);
        assert!(gate.has_recorded("s1", "period-1").unwrap());
    }

    #[test]
    fn test_replay_is_already_marked() {
        let gate = MemoryGate::new();
        let ctx = SessionContext::new("period-1", "camera-1");

        resolve_frame(vec![matched("s1", "Alice", 0.1)], &ctx, &gate).unwrap();
        let replay = resolve_frame(vec![matched("s1", "Alice", 0.1)], &ctx, &gate).unwrap();
        assert_eq!(replay.results[0].status, FaceStatus::AlreadyMarked);
        assert_eq!(replay.summary.already_marked, 1);
        assert_eq!(replay.summary.newly_marked, 0);
    }

    #[test]
    fn test_same_identity_twice_in_one_frame_records_once() {
        let gate = MemoryGate::new();
        let ctx = SessionContext::new("period-1", "camera-1");

        let report = resolve_frame(
            vec![matched("s1", "Alice", 0.1), matched("s1", "Alice", 0.2)],
            &ctx,
            &gate,
        )
        .unwrap();

        assert_eq!(report.summary.newly_marked, 1);
        assert_eq!(report.summary.already_marked, 1);
        assert_eq!(report.summary.total_faces_detected, 2);
    }

    #[test]
    fn test_unknown_face_has_no_identity_or_distance() {
        let gate = MemoryGate::new();
        let ctx = SessionContext::new("period-1", "camera-1");

        let report = resolve_frame(vec![unmatched(Some(0.9))], &ctx, &gate).unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].identity_id.is_none());
        assert!(report.results[0].distance.is_none());
        assert_eq!(report.results[0].status, FaceStatus::Unknown);
        assert_eq!(report.summary.unknown_faces, 1);
    }

    #[test]
    fn test_result_ordering_newly_then_already_then_unknown() {
        let gate = MemoryGate::new();
        let ctx = SessionContext::new("period-1", "camera-1");
        // s2 is already on record before the frame arrives.
        gate.record("s2", "period-1", "camera-1").unwrap();

        let report = resolve_frame(
            vec![
                unmatched(None),
                matched("s2", "Bob", 0.3),
                matched("s1", "Alice", 0.1),
            ],
            &ctx,
            &gate,
        )
        .unwrap();

        let statuses: Vec<FaceStatus> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                FaceStatus::NewlyMarked,
                FaceStatus::AlreadyMarked,
                FaceStatus::Unknown,
            ]
        );
    }

    #[test]
    fn test_already_recognized_set_short_circuits_the_gate() {
        struct PanicGate;
        impl AttendanceGate for PanicGate {
            fn has_recorded(&self, _: &str, _: &str) -> Result<bool, GateError> {
                panic!("gate must not be consulted for already_recognized identities");
            }
            fn record(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<AttendanceRecord, GateError> {
                panic!("gate must not be consulted for already_recognized identities");
            }
        }

        let mut ctx = SessionContext::new("period-1", "camera-1");
        ctx.already_recognized.insert("s1".to_string());

        let report =
            resolve_frame(vec![matched("s1", "Alice", 0.1)], &ctx, &PanicGate).unwrap();
        assert_eq!(report.results[0].status, FaceStatus::AlreadyMarked);
    }

    #[test]
    fn test_record_conflict_classifies_already_marked() {
        // A gate whose has_recorded lies (says false) while record conflicts,
        // simulating a concurrent writer landing between check and insert.
        struct RacyGate {
            inner: MemoryGate,
        }
        impl AttendanceGate for RacyGate {
            fn has_recorded(&self, _: &str, _: &str) -> Result<bool, GateError> {
                Ok(false)
            }
            fn record(
                &self,
                identity_id: &str,
                session_id: &str,
                recorded_by: &str,
            ) -> Result<AttendanceRecord, GateError> {
                self.inner.record(identity_id, session_id, recorded_by)
            }
        }

        let gate = RacyGate {
            inner: MemoryGate::new(),
        };
        gate.inner.record("s1", "period-1", "other-camera").unwrap();

        let ctx = SessionContext::new("period-1", "camera-1");
        let report = resolve_frame(vec![matched("s1", "Alice", 0.1)], &ctx, &gate).unwrap();
        assert_eq!(report.results[0].status, FaceStatus::AlreadyMarked);
    }

    #[test]
    fn test_memory_gate_records_exactly_once() {
        let gate = MemoryGate::new();
        assert!(gate.record("s1", "period-1", "camera-1").is_ok());
        assert!(matches!(
            gate.record("s1", "period-1", "camera-1"),
            Err(GateError::AlreadyRecorded { .. })
        ));
        // Same identity, different session is a fresh record.
        assert!(gate.record("s1", "period-2", "camera-1").is_ok());
    }
}
