use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

// `#[zbus::proxy]` generates `RollcallProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn enroll(&self, identity: &str, image: &[u8]) -> zbus::Result<String>;
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<Vec<String>>;
    async fn identity_counts(&self) -> zbus::Result<String>;
    async fn list_attendance(&self) -> zbus::Result<String>;
    async fn daily_summary(&self, date: &str) -> zbus::Result<String>;
    async fn monthly_report(&self, year: i32, month: u32) -> zbus::Result<String>;
    async fn train(&self) -> zbus::Result<String>;
    async fn training_jobs(&self, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add face samples for a person from one or more photos
    Enroll {
        /// Person name or code
        identity: String,
        /// Photos to upload
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize a photo and record attendance on a match
    Recognize { image: PathBuf },
    /// List enrolled identities
    Identities {
        /// Show sample counts
        #[arg(short, long)]
        counts: bool,
    },
    /// Show attendance totals per identity
    Attendance,
    /// Show who was present on a day (YYYY-MM-DD, default today)
    Today { date: Option<String> },
    /// Monthly attendance report
    Report { year: i32, month: u32 },
    /// Retrain the model now
    Train,
    /// Show recent training jobs
    Jobs {
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("connecting to the message bus")?;
    let proxy = RollcallProxy::new(&conn).await?;

    match cli.command {
        Commands::Enroll { identity, images } => {
            for path in images {
                let bytes = read_image(&path)?;
                match proxy.enroll(&identity, &bytes).await {
                    Ok(report) => println!("{}: {}", path.display(), pretty(&report)),
                    Err(e) => eprintln!("{}: {e}", path.display()),
                }
            }
        }
        Commands::Recognize { image } => {
            let bytes = read_image(&image)?;
            println!("{}", pretty(&proxy.recognize(&bytes).await?));
        }
        Commands::Identities { counts } => {
            if counts {
                println!("{}", pretty(&proxy.identity_counts().await?));
            } else {
                let identities = proxy.list_identities().await?;
                if identities.is_empty() {
                    println!("No identities enrolled");
                }
                for identity in identities {
                    println!("{identity}");
                }
            }
        }
        Commands::Attendance => println!("{}", pretty(&proxy.list_attendance().await?)),
        Commands::Today { date } => {
            let date = date.unwrap_or_default();
            println!("{}", pretty(&proxy.daily_summary(&date).await?));
        }
        Commands::Report { year, month } => {
            println!("{}", pretty(&proxy.monthly_report(year, month).await?));
        }
        Commands::Train => println!("{}", pretty(&proxy.train().await?)),
        Commands::Jobs { limit } => println!("{}", pretty(&proxy.training_jobs(limit).await?)),
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply; non-JSON text is printed as is.
fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enroll_takes_many_images() {
        let cli = Cli::try_parse_from(["rollcall", "enroll", "ana", "a.jpg", "b.jpg"]).unwrap();
        match cli.command {
            Commands::Enroll { identity, images } => {
                assert_eq!(identity, "ana");
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected enroll"),
        }
        assert!(Cli::try_parse_from(["rollcall", "enroll", "ana"]).is_err());
    }

    #[test]
    fn test_pretty_passes_through_plain_text() {
        assert_eq!(pretty("not json"), "not json");
        assert!(pretty(r#"{"a":1}"#).contains("\"a\": 1"));
    }
}
