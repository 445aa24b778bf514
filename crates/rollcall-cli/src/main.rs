use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_session(&self, actor: &str) -> zbus::Result<String>;
    fn stop_session(&self) -> zbus::Result<String>;
    fn get_status(&self) -> zbus::Result<String>;
    fn reload_gallery(&self) -> zbus::Result<u32>;
    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start {
        /// Who is running the session
        #[arg(short, long, default_value = "")]
        actor: String,
    },
    /// Stop the running session
    Stop,
    /// Show session status
    Status {
        /// Print the raw JSON reply
        #[arg(long)]
        json: bool,
    },
    /// Reload enrolled faces from the database
    Reload,
    /// List V4L2 capture devices
    Devices,
    /// Capture one frame directly from a camera and save it
    Snapshot {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Snapshot {
            device,
            output,
            width,
            height,
        } => snapshot(&device, &output, width, height),
        Commands::Start { actor } => {
            let proxy = connect(cli.session_bus).await?;
            let id = proxy.start_session(&actor).await?;
            println!("Session started: {id}");
            Ok(())
        }
        Commands::Stop => {
            let proxy = connect(cli.session_bus).await?;
            let summary: Value = serde_json::from_str(&proxy.stop_session().await?)?;
            match summary["session_id"].as_str() {
                Some(id) => println!(
                    "Session {id} stopped, {} recognized",
                    summary["recognized_count"].as_u64().unwrap_or(0)
                ),
                None => println!("No session has run yet"),
            }
            Ok(())
        }
        Commands::Status { json } => {
            let proxy = connect(cli.session_bus).await?;
            let raw = proxy.get_status().await?;
            if json {
                println!("{raw}");
            } else {
                let status: Value = serde_json::from_str(&raw)?;
                let version = proxy.version().await.unwrap_or_else(|_| "unknown".into());
                println!("rollcalld {version}");
                print!("{}", render_status(&status));
            }
            Ok(())
        }
        Commands::Reload => {
            let proxy = connect(cli.session_bus).await?;
            let loaded = proxy.reload_gallery().await?;
            println!("Gallery reloaded: {loaded} enrolled faces");
            Ok(())
        }
    }
}

async fn connect(session_bus: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")
}

fn render_status(status: &Value) -> String {
    let mut out = String::new();
    let active = status["active"].as_bool().unwrap_or(false);
    out.push_str(&format!("Session:    {}\n", if active { "active" } else { "idle" }));
    if let Some(id) = status["session_id"].as_str() {
        out.push_str(&format!("ID:         {id}\n"));
    }
    if let Some(actor) = status["actor"].as_str() {
        out.push_str(&format!("Actor:      {actor}\n"));
    }
    if let Some(started) = status["started_at"].as_str() {
        out.push_str(&format!("Started:    {started}\n"));
    }
    if let Some(ended) = status["ended_at"].as_str() {
        out.push_str(&format!("Ended:      {ended}\n"));
    }
    out.push_str(&format!(
        "Enrolled:   {}\n",
        status["enrolled"].as_u64().unwrap_or(0)
    ));
    out.push_str(&format!(
        "Recognized: {}\n",
        status["recognized_count"].as_u64().unwrap_or(0)
    ));
    if let Some(present) = status["present_today"].as_u64() {
        out.push_str(&format!("Present:    {present} today\n"));
    }
    if let Some(people) = status["recognized"].as_array() {
        for person in people {
            let id = person["id"].as_i64().unwrap_or_default();
            let name = person["name"].as_str().unwrap_or("(not enrolled)");
            out.push_str(&format!("  - {name} [{id}]\n"));
        }
    }
    out
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn snapshot(device: &str, output: &Path, width: u32, height: u32) -> Result<()> {
    let camera = Camera::open(device, width, height)
        .with_context(|| format!("cannot open camera {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );
    let frame = camera.capture_frame().context("capture failed")?;
    let image = frame.into_image()?;
    image
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Saved {}", output.display());
    Ok(())
}
