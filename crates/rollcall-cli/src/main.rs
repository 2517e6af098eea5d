use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{AnalyticsReport, Decision, Embedding, EnrollmentRequest, UserId};
use std::io::Read;
use std::path::{Path, PathBuf};

mod proxy;

use proxy::AttendanceProxy;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an attendance request (JSON file, or - for stdin)
    Attend { request: PathBuf },
    /// Enroll a user, replacing any existing enrollment
    Enroll {
        #[arg(short, long)]
        user: String,
        /// Device the user is bound to
        #[arg(short, long)]
        device: String,
        /// Policy site supplying the geofence and networks
        #[arg(short, long)]
        site: String,
        /// JSON array with the face embedding
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Replace a user's face template (JSON file, or - for stdin)
    UpdateFace { request: PathBuf },
    /// List attendance records, newest first
    History(RangeArgs),
    /// Show worked time per day
    Analytics {
        #[command(flatten)]
        range: RangeArgs,
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
    /// Show daemon status
    Status,
}

#[derive(Args)]
struct RangeArgs {
    #[arg(short, long)]
    user: String,
    /// Range start (RFC 3339). Defaults to `--days` before the end.
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// Range end (RFC 3339). Defaults to now.
    #[arg(long)]
    to: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 7)]
    days: i64,
}

impl RangeArgs {
    fn bounds(&self) -> (String, String) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - Duration::days(self.days));
        (from.to_rfc3339(), to.to_rfc3339())
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn hours(seconds: i64) -> String {
    format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to the message bus")?;
    let daemon = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Attend { request } => {
            let reply = daemon.attend(&read_input(&request)?).await?;
            let decision: Decision = serde_json::from_str(&reply)?;
            print_json(&reply)?;
            if !decision.accepted {
                let codes: Vec<&str> = decision.reasons.iter().map(|r| r.code()).collect();
                bail!("attendance rejected: {}", codes.join(", "));
            }
        }
        Commands::Enroll { user, device, site, embedding } => {
            let embedding: Embedding = serde_json::from_str(&read_input(&embedding)?)
                .context("embedding must be a JSON array of numbers")?;
            let request = EnrollmentRequest {
                user_id: UserId::new(user),
                embedding,
                device_id: device,
                site,
            };
            print_json(&daemon.enroll(&serde_json::to_string(&request)?).await?)?;
        }
        Commands::UpdateFace { request } => {
            print_json(&daemon.update_face(&read_input(&request)?).await?)?;
        }
        Commands::History(range) => {
            let (from, to) = range.bounds();
            print_json(&daemon.history(&range.user, &from, &to).await?)?;
        }
        Commands::Analytics { range, json } => {
            let (from, to) = range.bounds();
            let reply = daemon.analytics(&range.user, &from, &to).await?;
            if json {
                print_json(&reply)?;
            } else {
                let report: AnalyticsReport = serde_json::from_str(&reply)?;
                println!("{}  {} .. {}", report.user_id, from, to);
                for day in &report.days {
                    let marker = if day.ongoing { " (open)" } else { "" };
                    println!("  {}  {}{marker}", day.day, hours(day.total_seconds));
                }
                println!("  total       {}", hours(report.total_seconds));
                println!("  status      {}", report.current_status.as_str());
                for anomaly in &report.anomalies {
                    println!("  anomaly     {:?} at {} ({})", anomaly.kind, anomaly.at, anomaly.record_id);
                }
            }
        }
        Commands::Status => match daemon.status().await {
            Ok(status) => print_json(&status)?,
            Err(e) => {
                eprintln!("rollcalld: not connected ({e})");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
