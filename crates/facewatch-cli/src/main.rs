use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_hw::{open_source, Camera, CameraSpec};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "io.facewatch.Monitor1",
    default_service = "io.facewatch.Monitor1",
    default_path = "/io/facewatch/Monitor1"
)]
trait Monitor {
    async fn start(&self, roll_numbers: Vec<String>, camera: &str, role: &str) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn capture(&self, roll_number: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_detections(&self, filter: &str) -> zbus::Result<String>;
    async fn get_detection(&self, id: &str) -> zbus::Result<String>;
    async fn delete_detection(&self, id: &str) -> zbus::Result<bool>;
    async fn clear_detections(&self) -> zbus::Result<u32>;
    async fn list_students(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face monitoring CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring for one or more students
    Start {
        /// Roll number to look for (repeatable)
        #[arg(short, long = "roll", required = true)]
        rolls: Vec<String>,
        /// Camera: "local:/dev/video0", a device path, or an http(s) URL
        #[arg(short, long)]
        camera: Option<String>,
        /// Role recorded on detections (admin, general, student)
        #[arg(long, default_value = "admin")]
        role: String,
    },
    /// Stop the running session
    Stop,
    /// Record the current frame now
    Capture {
        /// Target roll number (defaults to the session's first target)
        #[arg(short, long)]
        roll: Option<String>,
    },
    /// Show daemon and session status
    Status,
    /// List detection records, newest first
    Detections {
        /// Match name, roll number or location (case-insensitive)
        #[arg(short, long)]
        search: Option<String>,
        /// Exact roll number
        #[arg(short, long)]
        roll: Option<String>,
        /// Day in UTC (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show one detection record as JSON
    Show {
        /// Record ID
        id: String,
    },
    /// Delete a detection record
    Delete {
        /// Record ID
        id: String,
    },
    /// Delete every detection record
    Clear,
    /// List students known to the daemon
    Students,
    /// Grab one frame directly from a camera (bypasses the daemon)
    TestCamera {
        #[arg(short, long, default_value = "local:/dev/video0")]
        camera: String,
        /// Where to write the captured JPEG
        #[arg(short, long, default_value = "facewatch-test.jpg")]
        output: PathBuf,
        /// List local capture devices and exit
        #[arg(long)]
        list: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::TestCamera { camera, output, list } = &cli.command {
        return test_camera(camera, output, *list).await;
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = MonitorProxy::new(&conn)
        .await
        .context("facewatchd is not reachable")?;

    match cli.command {
        Commands::Start { rolls, camera, role } => {
            let session = proxy
                .start(rolls, camera.as_deref().unwrap_or(""), &role)
                .await?;
            println!("Monitoring started (session {session})");
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("Monitoring stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Capture { roll } => {
            let record: Value = serde_json::from_str(&proxy.capture(roll.as_deref().unwrap_or("")).await?)?;
            println!("{}", format_record(&record));
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Detections { search, roll, date, limit } => {
            let filter = detection_filter(search, roll, date, limit);
            let records: Vec<Value> = serde_json::from_str(&proxy.list_detections(&filter.to_string()).await?)?;
            if records.is_empty() {
                println!("No detections");
            }
            for record in &records {
                println!("{}", format_record(record));
            }
        }
        Commands::Show { id } => {
            let record: Value = serde_json::from_str(&proxy.get_detection(&id).await?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Delete { id } => {
            if !proxy.delete_detection(&id).await? {
                bail!("no detection with id {id}");
            }
            println!("Deleted {id}");
        }
        Commands::Clear => {
            let removed = proxy.clear_detections().await?;
            println!("Deleted {removed} detection(s)");
        }
        Commands::Students => {
            let students: Vec<Value> = serde_json::from_str(&proxy.list_students().await?)?;
            for student in &students {
                println!(
                    "{:<12} {}",
                    student["roll_number"].as_str().unwrap_or("?"),
                    student["name"].as_str().unwrap_or("")
                );
            }
        }
        Commands::TestCamera { .. } => {}
    }

    Ok(())
}

fn detection_filter(
    search: Option<String>,
    roll: Option<String>,
    date: Option<String>,
    limit: Option<usize>,
) -> Value {
    let mut filter = serde_json::Map::new();
    if let Some(search) = search {
        filter.insert("search".into(), Value::from(search));
    }
    if let Some(roll) = roll {
        filter.insert("roll_number".into(), Value::from(roll));
    }
    if let Some(date) = date {
        filter.insert("date".into(), Value::from(date));
    }
    if let Some(limit) = limit {
        filter.insert("limit".into(), Value::from(limit));
    }
    Value::Object(filter)
}

fn format_record(record: &Value) -> String {
    let text = |key: &str| record[key].as_str().unwrap_or("").to_string();
    format!(
        "{}  {}  {:<10} {:<20} sim={:.2}  {}  [{}]",
        text("id"),
        text("timestamp"),
        text("roll_number"),
        text("student_name"),
        record["similarity"].as_f64().unwrap_or(0.0),
        text("location"),
        text("trigger"),
    )
}

async fn test_camera(camera: &str, output: &Path, list: bool) -> Result<()> {
    if list {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No V4L2 capture devices found");
        }
        for device in devices {
            println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
        }
        return Ok(());
    }

    let spec: CameraSpec = camera.parse()?;
    println!("Opening {spec}...");
    let mut source = open_source(&spec).await?;
    let frame = tokio::time::timeout(Duration::from_secs(10), source.grab())
        .await
        .context("timed out waiting for a frame")??;

    println!(
        "{}: {}x{} frame, average brightness {:.1}",
        source.describe(),
        frame.width(),
        frame.height(),
        frame.avg_brightness()
    );
    if frame.is_dark(0.95) {
        println!("Warning: frame is almost entirely dark");
    }
    std::fs::write(output, frame.to_jpeg(90)?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Saved {}", output.display());
    Ok(())
}
