use crate::store::{Store, StoreError};
use rollcall_core::pipeline::{PipelineError, PipelineOptions, RecognitionPipeline};
use rollcall_core::session::SessionContext;
use rollcall_core::types::{FrameReport, RosterEntry};
use rollcall_core::{ArcFaceEmbedder, ScrfdDetector};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity_id: String,
        display_name: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<RosterEntry, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        session_id: String,
        recorded_by: String,
        already_recognized: Vec<String>,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request enrollment: detect the best face in the photo, extract its
    /// embedding, store the identity.
    pub async fn enroll(
        &self,
        identity_id: String,
        display_name: String,
        image: Vec<u8>,
    ) -> Result<RosterEntry, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                identity_id,
                display_name,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request recognition of one frame for one session.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        session_id: String,
        recorded_by: String,
        already_recognized: Vec<String>,
    ) -> Result<FrameReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                session_id,
                recorded_by,
                already_recognized,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the ONNX sessions and processes one frame at a time;
/// frames queue in the channel. Replies are dropped silently if the caller
/// went away, which also means a cancelled request never rolls back records
/// the frame already committed.
pub fn spawn_engine(
    detector: ScrfdDetector,
    embedder: ArcFaceEmbedder,
    options: PipelineOptions,
    store: Arc<Store>,
) -> EngineHandle {
    let mut pipeline = RecognitionPipeline::new(detector, embedder, options);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    EngineRequest::Enroll {
                        identity_id,
                        display_name,
                        image,
                        reply,
                    } => {
                        let result =
                            run_enroll(&mut pipeline, &store, &identity_id, &display_name, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize {
                        image,
                        session_id,
                        recorded_by,
                        already_recognized,
                        reply,
                    } => {
                        let result = run_recognize(
                            &mut pipeline,
                            &store,
                            &image,
                            session_id,
                            recorded_by,
                            already_recognized,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

/// Decode the photo, find its most confident face, enroll the embedding.
fn run_enroll(
    pipeline: &mut RecognitionPipeline<ScrfdDetector, ArcFaceEmbedder>,
    store: &Store,
    identity_id: &str,
    display_name: &str,
    image_bytes: &[u8],
) -> Result<RosterEntry, EngineError> {
    let image = image::load_from_memory(image_bytes)?;

    let observations = pipeline.observe(&image)?;
    // Boxes come back confidence-ordered; the first observation is the best.
    let observation = &observations[0];
    tracing::debug!(
        identity_id,
        confidence = observation.bounding_box.confidence,
        faces = observations.len(),
        "enroll: face selected"
    );

    Ok(store.enroll(identity_id, display_name, &observation.embedding)?)
}

/// Decode the frame, snapshot the roster once, run the pipeline against it.
fn run_recognize(
    pipeline: &mut RecognitionPipeline<ScrfdDetector, ArcFaceEmbedder>,
    store: &Store,
    image_bytes: &[u8],
    session_id: String,
    recorded_by: String,
    already_recognized: Vec<String>,
) -> Result<FrameReport, EngineError> {
    let image = image::load_from_memory(image_bytes)?;

    let roster = store.all_references()?;
    tracing::debug!(
        %session_id,
        roster_size = roster.len(),
        "recognize: roster snapshot taken"
    );

    let ctx = SessionContext {
        session_id,
        recorded_by,
        already_recognized: already_recognized.into_iter().collect::<HashSet<_>>(),
    };

    let report = pipeline.recognize(&image, &roster, &ctx, store)?;
    tracing::info!(
        session_id = %ctx.session_id,
        total = report.summary.total_faces_detected,
        newly = report.summary.newly_marked,
        already = report.summary.already_marked,
        unknown = report.summary.unknown_faces,
        "frame processed"
    );
    Ok(report)
}
