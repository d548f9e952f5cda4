//! rollcall-core — Face-recognition attendance engine.
//!
//! Matches face embeddings from submitted frames against an enrolled roster
//! and decides, per session, whether an identity gets credited attendance.
//! Detection (SCRFD) and embedding extraction (ArcFace) run via ONNX Runtime
//! behind the [`FaceDetector`] and [`FaceEmbedder`] traits.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod pipeline;
pub mod session;
pub mod strategy;
pub mod types;

pub use detector::{DetectError, FaceDetector, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, EmbedError, FaceEmbedder};
pub use matcher::{BestMatch, EuclideanMatcher, MatchError, Matcher};
pub use pipeline::{PipelineError, PipelineOptions, RecognitionPipeline};
pub use session::{AttendanceGate, AttendanceRecord, GateError, MemoryGate, SessionContext};
pub use strategy::DetectionStrategy;
pub use types::{
    BoundingBox, Embedding, FaceObservation, FaceStatus, FrameReport, FrameSummary,
    RecognizedFace, RosterEntry,
};
