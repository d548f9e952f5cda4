//! Per-frame recognition pipeline: detect → embed → match → dedup → report.

use crate::detector::FaceDetector;
use crate::embedder::FaceEmbedder;
use crate::matcher::{EuclideanMatcher, MatchError, Matcher};
use crate::session::{resolve_frame, AttendanceGate, FaceMatch, GateError, SessionContext};
use crate::strategy::DetectionStrategy;
use crate::types::{FaceObservation, FrameReport, RosterEntry};
use image::{DynamicImage, RgbImage};
use thiserror::Error;

/// Default acceptance threshold for Euclidean distance on L2-normalized
/// embeddings. The reference deployment ran 0.6 (a duplicate code path used
/// 0.67); 0.6 is the single deliberate default here.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
/// Default cap on faces processed per frame, bounding worst-case latency.
pub const DEFAULT_MAX_FACES: usize = 10;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected after {attempts} detection attempts")]
    NoFaceDetected { attempts: usize },
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Accept a candidate only when `distance < match_threshold`.
    pub match_threshold: f32,
    /// Boxes processed per detection strategy.
    pub max_faces: usize,
    /// Strategies tried in order until one yields an embedding.
    pub strategies: Vec<DetectionStrategy>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            max_faces: DEFAULT_MAX_FACES,
            strategies: DetectionStrategy::default_ladder(),
        }
    }
}

/// Orchestrates one frame at a time against injected detector and embedder
/// capabilities. Holds no session state; the roster snapshot and gate are
/// supplied per call.
pub struct RecognitionPipeline<D, E> {
    detector: D,
    embedder: E,
    options: PipelineOptions,
}

impl<D: FaceDetector, E: FaceEmbedder> RecognitionPipeline<D, E> {
    pub fn new(detector: D, embedder: E, options: PipelineOptions) -> Self {
        Self {
            detector,
            embedder,
            options,
        }
    }

    /// Dimension of the embeddings this pipeline produces.
    pub fn embedding_dim(&self) -> usize {
        self.embedder.dim()
    }

    /// Run the strategy ladder until one strategy yields at least one
    /// embedding. Boxes whose embedding extraction fails are dropped from
    /// the strategy, not treated as pipeline failure. Exhausting the ladder
    /// is `NoFaceDetected`.
    pub fn observe(&mut self, image: &DynamicImage) -> Result<Vec<FaceObservation>, PipelineError> {
        let strategies = self.options.strategies.clone();
        let mut attempts = 0usize;

        for strategy in &strategies {
            attempts += 1;
            let candidate = strategy.apply(image).to_rgb8();

            let boxes = match self.detect_with_retry(&candidate, strategy) {
                Some(boxes) => boxes,
                None => continue,
            };
            if boxes.is_empty() {
                tracing::debug!(%strategy, "no faces located");
                continue;
            }

            let observations = self.embed_boxes(&candidate, boxes);
            if !observations.is_empty() {
                tracing::info!(
                    %strategy,
                    faces = observations.len(),
                    attempt = attempts,
                    "detection strategy succeeded"
                );
                return Ok(observations);
            }
            tracing::debug!(%strategy, "all boxes dropped during embedding");
        }

        Err(PipelineError::NoFaceDetected { attempts })
    }

    /// Full per-frame run. The roster snapshot is taken once by the caller
    /// before this call, so every face in the frame matches against the same
    /// candidate pool even if enrollment is happening concurrently.
    pub fn recognize(
        &mut self,
        image: &DynamicImage,
        roster: &[RosterEntry],
        ctx: &SessionContext,
        gate: &dyn AttendanceGate,
    ) -> Result<FrameReport, PipelineError> {
        let observations = self.observe(image)?;

        let matcher = EuclideanMatcher;
        let mut matches = Vec::with_capacity(observations.len());
        for observation in observations {
            let best = matcher.best_match(
                &observation.embedding,
                roster,
                self.options.match_threshold,
            )?;
            matches.push(FaceMatch {
                face_location: observation.bounding_box,
                matched: best,
            });
        }

        Ok(resolve_frame(matches, ctx, gate)?)
    }

    /// Detection failures are transient capability failures: retried once,
    /// then the strategy is skipped.
    fn detect_with_retry(
        &mut self,
        image: &RgbImage,
        strategy: &DetectionStrategy,
    ) -> Option<Vec<crate::types::BoundingBox>> {
        for attempt in 0..2 {
            match self.detector.detect(image) {
                Ok(boxes) => return Some(boxes),
                Err(err) => {
                    tracing::warn!(%strategy, attempt, error = %err, "face detection failed");
                }
            }
        }
        None
    }

    fn embed_boxes(
        &mut self,
        image: &RgbImage,
        boxes: Vec<crate::types::BoundingBox>,
    ) -> Vec<FaceObservation> {
        let mut observations = Vec::new();
        for face in boxes.into_iter().take(self.options.max_faces) {
            if let Some(embedding) = self.embed_with_retry(image, &face) {
                observations.push(FaceObservation {
                    bounding_box: face,
                    embedding,
                });
            }
        }
        observations
    }

    /// Embedding failures are retried once per box; a second failure or a
    /// legitimate `None` drops the box.
    fn embed_with_retry(
        &mut self,
        image: &RgbImage,
        face: &crate::types::BoundingBox,
    ) -> Option<crate::types::Embedding> {
        for attempt in 0..2 {
            match self.embedder.embed(image, face) {
                Ok(Some(embedding)) => return Some(embedding),
                Ok(None) => {
                    tracing::debug!(
                        confidence = face.confidence,
                        "box unusable for embedding, dropping"
                    );
                    return None;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "embedding extraction failed");
                }
            }
        }
        None
    }
}
