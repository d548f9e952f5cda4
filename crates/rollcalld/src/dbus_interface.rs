use crate::engine::{EngineError, EngineHandle};
use crate::store::{Store, StoreError};
use rollcall_core::pipeline::PipelineError;
use std::sync::Arc;
use std::time::Duration;
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
    store: Arc<Store>,
    recognize_timeout: Duration,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, store: Arc<Store>, recognize_timeout: Duration) -> Self {
        Self {
            engine,
            store,
            recognize_timeout,
        }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity from a photo. Returns a JSON identity summary.
    async fn register_identity(
        &self,
        identity_id: &str,
        display_name: &str,
        photo: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        if identity_id.is_empty() || display_name.is_empty() || photo.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "identity_id, display_name, and photo are required".into(),
            ));
        }
        tracing::info!(identity_id, display_name, "enroll requested");

        let entry = self
            .engine
            .enroll(identity_id.to_string(), display_name.to_string(), photo)
            .await
            .map_err(engine_error_to_fdo)?;

        Ok(serde_json::json!({
            "identity_id": entry.identity_id,
            "display_name": entry.display_name,
            "created_at": entry.created_at,
        })
        .to_string())
    }

    /// Recognize faces in a frame and credit attendance for the session.
    /// Returns the frame report as JSON.
    async fn recognize_frame(
        &self,
        image: Vec<u8>,
        session_id: &str,
        recorded_by: &str,
        already_recognized: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        if image.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("image is required".into()));
        }
        if session_id.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "session_id is required".into(),
            ));
        }
        let recorded_by = if recorded_by.is_empty() {
            "unknown"
        } else {
            recorded_by
        };
        tracing::info!(
            session_id,
            recorded_by,
            image_bytes = image.len(),
            already = already_recognized.len(),
            "recognize requested"
        );

        let request = self.engine.recognize(
            image,
            session_id.to_string(),
            recorded_by.to_string(),
            already_recognized,
        );
        let report = tokio::time::timeout(self.recognize_timeout, request)
            .await
            .map_err(|_| {
                zbus::fdo::Error::Timeout(format!(
                    "recognition did not finish within {}s",
                    self.recognize_timeout.as_secs()
                ))
            })?
            .map_err(engine_error_to_fdo)?;

        serde_json::to_string(&report)
            .map_err(|e| zbus::fdo::Error::Failed(format!("serialize report: {e}")))
    }

    /// List enrolled identities (without embedding payloads) as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let identities = tokio::task::spawn_blocking(move || store.list_identities())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task: {e}")))?
            .map_err(store_error_to_fdo)?;
        serde_json::to_string(&identities)
            .map_err(|e| zbus::fdo::Error::Failed(format!("serialize identities: {e}")))
    }

    /// List attendance records for one session as JSON.
    async fn list_attendance(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let session = session_id.to_string();
        let records = tokio::task::spawn_blocking(move || store.attendance_for_session(&session))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task: {e}")))?
            .map_err(store_error_to_fdo)?;
        serde_json::to_string(&records)
            .map_err(|e| zbus::fdo::Error::Failed(format!("serialize attendance: {e}")))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let roster_size = tokio::task::spawn_blocking(move || store.identity_count())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task: {e}")))?
            .map_err(store_error_to_fdo)?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "roster_size": roster_size,
            "recognize_timeout_secs": self.recognize_timeout.as_secs(),
        })
        .to_string())
    }
}

/// Map engine failures onto D-Bus error names the client can branch on.
fn engine_error_to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::InvalidImage(e) => {
            zbus::fdo::Error::InvalidArgs(format!("invalid image: {e}"))
        }
        EngineError::Pipeline(PipelineError::NoFaceDetected { attempts }) => {
            zbus::fdo::Error::Failed(format!("no face detected after {attempts} attempts"))
        }
        EngineError::Store(e) => store_error_to_fdo(e),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn store_error_to_fdo(err: StoreError) -> zbus::fdo::Error {
    match err {
        StoreError::DuplicateIdentity(id) => {
            zbus::fdo::Error::Failed(format!("identity '{id}' is already enrolled"))
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
