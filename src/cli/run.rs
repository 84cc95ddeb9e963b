use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use hitlgate::apps::App;
use hitlgate::config::HitlSettings;
use hitlgate::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry metrics endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long)]
    pub otel_metrics_endpoint: Option<String>,

    /// Overrides HITL_TIMEOUT_SECONDS
    #[arg(long)]
    pub timeout_seconds: Option<f64>,

    /// Overrides HITL_WS_PORT
    #[arg(long)]
    pub port: Option<u16>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_metrics_endpoint: None,
            timeout_seconds: None,
            port: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = context.root.clone();
    // checked before the logger, which creates `<root>/logs`
    ensure_root(&root)?;

    let log_file = "logs/hitlgate.log";
    let event_file = "logs/hitlgate_reviews.log";

    let telemetry = init_tracing(
        &root,
        log_file,
        event_file,
        &args.log_level,
        args.otel_metrics_endpoint.clone(),
    )
    .context("could not create logger")?;

    info!("hitlgate starting up");

    let mut settings = HitlSettings::load(&context.config_manager)
        .await
        .context("invalid HITL configuration")?;
    if let Some(secs) = args.timeout_seconds {
        settings.timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid --timeout-seconds {}", secs))?;
    }
    if let Some(port) = args.port {
        settings.ws_port = port;
    }

    let mut app = match App::bootstrap(&settings).await {
        Ok(app) => app,
        Err(err) => {
            error!("Failed to bootstrap hitlgate: {:#}", err);
            return Err(err);
        }
    };

    if let Some(addr) = app.ws_addr() {
        println!("hitlgate listening for reviewers on ws://{}", addr);
    }
    info!("hitlgate running; press Ctrl-C to exit");
    println!("hitlgate running; press Ctrl-C to exit");

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("hitlgate shutting down");

    app.shutdown().await;
    telemetry.shutdown();

    println!("Goodbye!");
    Ok(())
}

fn ensure_root(root: &Path) -> anyhow::Result<()> {
    if !root.is_dir() {
        bail!(
            "Root directory `{}` does not exist. Set HITLGATE_ROOT or create it first.",
            root.display()
        );
    }
    Ok(())
}
