use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use access_sentry::backend::OpenCvBackend;
use access_sentry::config::SentryConfig;
use access_sentry::control;
use access_sentry::orchestrator::Orchestrator;
use access_sentry::server::HttpServer;
use access_sentry::store::{
    EventFilter, EventStore, ReferenceImage, RegistryStore, SqliteStore, StoredIdentity,
    StoredVehicle, VehicleType,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera based access control", long_about = None)]
struct Args {
    /// TOML config file, defaults to $ACCESS_SENTRY_CONFIG or built-in values.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the control API and the live stream.
    Serve {
        /// Start detection right away instead of waiting for a request.
        #[arg(long)]
        start: bool,
    },
    /// Add a person, their reference photos and optionally their vehicle.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        roll_no: String,
        #[arg(long, default_value = "")]
        branch: String,
        /// Reference photo, repeatable.
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,
        #[arg(long)]
        plate: Option<String>,
        #[arg(long, default_value = "other")]
        vehicle_type: String,
    },
    /// Print registered people as JSON lines.
    Users,
    /// Print access events as JSON lines, newest first.
    Events {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Only rejected attempts.
        #[arg(long)]
        unauthorized: bool,
        /// Print notifications instead of access events.
        #[arg(long)]
        notifications: bool,
    },
    /// Write access events to a CSV file.
    Export {
        #[arg(short, long)]
        output: PathBuf,
        /// RFC 3339 lower bound.
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound.
        #[arg(long)]
        until: Option<String>,
    },
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|time| time.with_timezone(&Utc))
                .map_err(|e| anyhow!("invalid timestamp {value}: {e}"))
        })
        .transpose()
}

fn serve(config: SentryConfig, store: Arc<SqliteStore>, start: bool) -> Result<()> {
    let backend = Arc::new(OpenCvBackend::new(config.models.clone(), config.camera.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        store.clone(),
        store.clone(),
        config.pipeline_settings(),
    ));

    #[cfg(feature = "rtp-sink")]
    let _rtp = match &config.stream.rtp {
        Some(rtp) => {
            use access_sentry::plate_detection::rtp_sink::RtpSink;
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let sink = RtpSink::new(config.stream.fps, &rtp.host, rtp.port)?;
            Some((sink.spawn(orchestrator.frames(), stop.clone()), stop))
        }
        None => None,
    };
    #[cfg(not(feature = "rtp-sink"))]
    if config.stream.rtp.is_some() {
        tracing::warn!("stream.rtp is set but this build has no rtp-sink feature");
    }

    if start {
        let status = orchestrator.start()?;
        info!("{}", status.message());
    }

    let server = HttpServer::new(
        config.server.addr.clone(),
        orchestrator.clone(),
        store.clone(),
        store,
        config.stream.fps,
    )
    .spawn()?;
    info!(addr = %server.addr, "serving");
    server.wait()?;
    orchestrator.stop();

    #[cfg(feature = "rtp-sink")]
    if let Some((sink, stop)) = _rtp {
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = sink.join();
    }
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = SentryConfig::load(args.config.as_deref())?;
    let store = Arc::new(
        SqliteStore::open(&config.database.path)
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );

    match args.command {
        Command::Serve { start } => serve(config, store, start)?,
        Command::Register {
            name,
            roll_no,
            branch,
            images,
            plate,
            vehicle_type,
        } => {
            let images = images
                .iter()
                .map(|path| {
                    let data = std::fs::read(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    Ok(ReferenceImage {
                        name: path
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        data,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let identity = StoredIdentity {
                name,
                roll_no,
                branch,
                images,
                vehicle: plate.map(|plate_number| StoredVehicle {
                    plate_number,
                    vehicle_type: VehicleType::parse(&vehicle_type),
                }),
            };
            store.register(&identity)?;
            info!(name = %identity.name, images = identity.images.len(), "registered");
        }
        Command::Users => {
            for user in control::list_users(store.as_ref())? {
                println!("{}", serde_json::to_string(&user)?);
            }
        }
        Command::Events {
            limit,
            unauthorized,
            notifications,
        } => {
            let mut filter = EventFilter::latest(limit);
            if notifications {
                for event in store.notifications(&filter)? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            } else {
                filter.authenticated = unauthorized.then_some(false);
                for event in store.access_events(&filter)? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
        Command::Export {
            output,
            since,
            until,
        } => {
            let filter = EventFilter {
                since: parse_time(since)?,
                until: parse_time(until)?,
                ..Default::default()
            };
            let events = store.access_events(&filter)?;
            let file = File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let rows = control::export_csv(&events, BufWriter::new(file))?;
            info!(rows, output = %output.display(), "exported");
        }
    }
    Ok(())
}
