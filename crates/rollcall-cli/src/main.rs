use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::detector::{Detector, Frame};
use rollcall_core::local::{LocalDetector, DEFAULT_INFERENCE_TIMEOUT, SCRFD_MODEL_FILE};
use rollcall_core::model_cell::InitPolicy;
use rollcall_core::normalize::face_encoding;
use rollcall_core::student::{SessionFilter, SessionInfo, SessionSummary, StudentMetadata};
use std::path::{Path, PathBuf};

mod client;

use client::{describe, AttendanceProxy};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a photo
    Enroll {
        #[command(flatten)]
        student: StudentArgs,
        /// Photo containing the student's face
        image: PathBuf,
    },
    /// Mark everyone recognized in a photo as present
    Attend {
        /// Session (lecture) identifier
        #[arg(long)]
        session: String,
        /// Human-readable session name
        #[arg(long)]
        name: String,
        /// Classroom photo
        image: PathBuf,
    },
    /// List enrolled students
    Students,
    /// List attendance sessions, newest first
    Sessions {
        #[command(flatten)]
        filter: SessionArgs,
        /// Print CSV instead of JSON
        #[arg(long)]
        csv: bool,
    },
    /// Show attendance records for a session or a student
    Attendance {
        #[command(flatten)]
        query: AttendanceQuery,
    },
    /// Show daemon status
    Status,
    /// Detect faces and print their encodings locally (bypasses the daemon)
    Encode {
        /// Directory containing det_10g.onnx (default: $ROLLCALL_MODEL_DIR, then the daemon's default)
        #[arg(long)]
        model_dir: Option<PathBuf>,
        image: PathBuf,
    },
}

#[derive(Args)]
struct StudentArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    batch: Option<String>,
    #[arg(long)]
    semester: Option<String>,
}

impl From<StudentArgs> for StudentMetadata {
    fn from(a: StudentArgs) -> Self {
        StudentMetadata {
            student_id: a.id,
            first_name: a.first_name,
            last_name: a.last_name,
            email: a.email,
            phone: a.phone,
            department: a.department,
            batch: a.batch,
            semester: a.semester,
        }
    }
}

#[derive(Args)]
struct SessionArgs {
    /// Match session name or id (case-insensitive)
    #[arg(long)]
    search: Option<String>,
    /// Earliest start, YYYY-MM-DD or RFC 3339
    #[arg(long)]
    since: Option<String>,
    /// Latest start, inclusive; a bare date covers the whole day
    #[arg(long)]
    until: Option<String>,
    /// Show at most this many sessions
    #[arg(long)]
    limit: Option<u32>,
}

impl SessionArgs {
    fn as_request(&self) -> (&str, &str, &str, u32) {
        (
            self.search.as_deref().unwrap_or_default(),
            self.since.as_deref().unwrap_or_default(),
            self.until.as_deref().unwrap_or_default(),
            self.limit.unwrap_or(0),
        )
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct AttendanceQuery {
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    student: Option<String>,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply from the daemon.
fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Session listing as CSV, one row per session.
fn sessions_csv(sessions: &[SessionSummary]) -> String {
    let mut out = String::from("Session ID,Session Name,Date & Time,Student Count\n");
    for s in sessions {
        let row = [
            csv_field(&s.session.session_id),
            csv_field(&s.session.name),
            csv_field(s.session.started_at.as_deref().unwrap_or_default()),
            s.student_count.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn default_model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("ROLLCALL_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

async fn encode(model_dir: PathBuf, image: &Path) -> Result<()> {
    let frame = Frame::decode(read_image(image)?)?;
    let detector = LocalDetector::new(
        model_dir.join(SCRFD_MODEL_FILE),
        InitPolicy {
            max_attempts: 1,
            ..InitPolicy::default()
        },
        DEFAULT_INFERENCE_TIMEOUT,
    );

    let detections = detector.detect(&frame).await?;
    let mut faces = Vec::with_capacity(detections.len());
    for (index, face) in detections.iter().enumerate() {
        let encoding = face_encoding(face)?;
        faces.push(serde_json::json!({
            "face": index,
            "bbox": face.bbox,
            "confidence": face.confidence,
            "landmarks": face.landmarks,
            "encoding": encoding.to_storage_string(),
        }));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "image": image.display().to_string(),
            "width": frame.width(),
            "height": frame.height(),
            "faces": faces,
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { student, image } => {
            let metadata = StudentMetadata::from(student).validated()?;
            let bytes = read_image(&image)?;
            let reply = proxy()
                .await?
                .enroll(&serde_json::to_string(&metadata)?, &bytes)
                .await
                .map_err(describe)?;
            print_json(&reply)?;
        }
        Commands::Attend { session, name, image } => {
            let session = SessionInfo {
                session_id: session,
                name,
                started_at: None,
            }
            .validated()?;
            let bytes = read_image(&image)?;
            let reply = proxy()
                .await?
                .take_attendance(&serde_json::to_string(&session)?, &bytes)
                .await
                .map_err(describe)?;
            print_json(&reply)?;
        }
        Commands::Students => {
            print_json(&proxy().await?.list_students().await.map_err(describe)?)?;
        }
        Commands::Sessions { filter, csv } => {
            let (search, since, until, limit) = filter.as_request();
            // Reject bad dates before contacting the daemon.
            SessionFilter::from_args(search, since, until, limit)?;
            let reply = proxy()
                .await?
                .list_sessions(search, since, until, limit)
                .await
                .map_err(describe)?;
            if csv {
                let sessions: Vec<SessionSummary> =
                    serde_json::from_str(&reply).context("daemon returned invalid session list")?;
                print!("{}", sessions_csv(&sessions));
            } else {
                print_json(&reply)?;
            }
        }
        Commands::Attendance { query } => {
            let proxy = proxy().await?;
            let reply = if let Some(session) = query.session {
                proxy.session_attendance(&session).await
            } else if let Some(student) = query.student {
                proxy.student_attendance(&student).await
            } else {
                anyhow::bail!("either --session or --student is required");
            }
            .map_err(describe)?;
            print_json(&reply)?;
        }
        Commands::Status => match proxy().await {
            Ok(proxy) => print_json(&proxy.status().await.map_err(describe)?)?,
            Err(e) => println!("rollcalld: not connected ({e:#})"),
        },
        Commands::Encode { model_dir, image } => {
            encode(model_dir.unwrap_or_else(default_model_dir), &image).await?;
        }
    }

    Ok(())
}
