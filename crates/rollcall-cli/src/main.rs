use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Per-call timeout: covers model inference on large frames plus queueing.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a photo
    Enroll {
        /// Identity id (e.g., student number)
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Path to the enrollment photo
        photo: PathBuf,
    },
    /// Submit a frame for recognition and attendance marking
    Recognize {
        /// Session id the attendance is credited to
        #[arg(short, long)]
        session: String,
        /// Who is submitting this frame
        #[arg(long, default_value = "cli")]
        recorded_by: String,
        /// Identity ids already credited this session (repeatable)
        #[arg(long = "seen")]
        seen: Vec<String>,
        /// Path to the frame image
        photo: PathBuf,
    },
    /// List enrolled identities
    List,
    /// List attendance records for a session
    Attendance {
        /// Session id
        session: String,
    },
    /// Show daemon status
    Status,
}

// `#[zbus::proxy]` generates RollcallProxy (async) from this declaration.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn register_identity(
        &self,
        identity_id: &str,
        display_name: &str,
        photo: Vec<u8>,
    ) -> zbus::Result<String>;

    async fn recognize_frame(
        &self,
        image: Vec<u8>,
        session_id: &str,
        recorded_by: &str,
        already_recognized: Vec<String>,
    ) -> zbus::Result<String>;

    async fn list_identities(&self) -> zbus::Result<String>;

    async fn list_attendance(&self, session_id: &str) -> zbus::Result<String>;

    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::connection::Builder::session()
        .context("connecting to session bus")?
        .build()
        .await
        .context("building bus connection (is rollcalld running?)")?;
    let proxy = RollcallProxy::new(&connection)
        .await
        .context("creating rollcalld proxy")?;

    let reply = match cli.command {
        Commands::Enroll { id, name, photo } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading photo {}", photo.display()))?;
            call("enroll", proxy.register_identity(&id, &name, bytes)).await?
        }
        Commands::Recognize {
            session,
            recorded_by,
            seen,
            photo,
        } => {
            let bytes = std::fs::read(&photo)
                .with_context(|| format!("reading frame {}", photo.display()))?;
            call(
                "recognize",
                proxy.recognize_frame(bytes, &session, &recorded_by, seen),
            )
            .await?
        }
        Commands::List => call("list", proxy.list_identities()).await?,
        Commands::Attendance { session } => {
            call("attendance", proxy.list_attendance(&session)).await?
        }
        Commands::Status => call("status", proxy.status()).await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}

/// Bound one daemon call; a stuck daemon must not hang the CLI.
async fn call<T>(label: &str, fut: impl Future<Output = zbus::Result<T>>) -> Result<T> {
    tokio::time::timeout(CALL_TIMEOUT, fut)
        .await
        .with_context(|| format!("{label}: no reply within {}s", CALL_TIMEOUT.as_secs()))?
        .with_context(|| format!("{label} failed"))
}

/// Pretty-print daemon JSON; fall back to the raw string if it isn't JSON.
fn pretty(reply: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| reply.to_string()),
        Err(_) => reply.to_string(),
    }
}
