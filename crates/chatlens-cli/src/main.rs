use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chatlens_bus::{EventBus, Topic};
use chatlens_core::*;
use chatlens_provider::StubBackend;
use chatlens_schema::{AnalysisReport, BusMessage, ChatExport, ImageArtifact, ResourceStatus};

#[derive(Parser)]
#[command(name = "chatlens", version, about = "Chat export analyzer client")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.chatlens",
        help = "Config root directory (contains chatlens.yaml and logs/)"
    )]
    config_root: PathBuf,

    #[arg(long, help = "Analysis service base URL, overrides the config file")]
    base_url: Option<String>,

    #[arg(long, help = "Use the built-in stub backend instead of the service")]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Analyze a chat export and fetch its charts")]
    Analyze {
        #[arg(help = "Exported chat file (.txt or .csv)")]
        file: PathBuf,
        #[arg(long, help = "Directory to write chart images into")]
        out_dir: Option<PathBuf>,
    },
    #[command(about = "Chat with the assistant about the analyzed export")]
    Chat,
    #[command(about = "Validate the config file")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.config_root = expand_home(&cli.config_root);

    let log_dir = cli.config_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chatlens.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let mut config = load_config(&cli.config_root)?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url.trim().to_string();
        config.validate()?;
    }

    match command {
        Commands::Validate => {
            println!(
                "Config valid. base_url={}, timeout={}, extensions=.{}",
                config.base_url,
                config
                    .request_timeout_secs
                    .map(|secs| format!("{secs}s"))
                    .unwrap_or_else(|| "none".to_string()),
                config.accepted_extensions.join(", .")
            );
        }
        Commands::Analyze { file, out_dir } => {
            let app = build_app(&config, cli.offline);
            let _events = spawn_event_log(app.bus());
            run_analyze(&app, &file, out_dir.as_deref()).await?;
        }
        Commands::Chat => {
            let app = build_app(&config, cli.offline);
            run_repl(&app).await?;
        }
    }

    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(path.strip_prefix("~").unwrap_or(path));
        }
    }
    path.to_path_buf()
}

fn build_app(config: &ClientConfig, offline: bool) -> AnalyzerApp {
    if offline {
        tracing::info!("using stub backend");
        AnalyzerApp::new(Arc::new(StubBackend), config)
    } else {
        tracing::info!(base_url = %config.base_url, "using analysis service");
        AnalyzerApp::from_config(config)
    }
}

fn spawn_event_log(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut jobs = bus.subscribe(Topic::JobStatusChanged);
    let mut charts = bus.subscribe(Topic::VisualizationSettled);
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = jobs.recv() => msg,
                Some(msg) = charts.recv() => msg,
                else => break,
            };
            match msg {
                BusMessage::JobStatusChanged { trace_id, status } => {
                    tracing::debug!(%trace_id, %status, "analysis job status changed");
                }
                BusMessage::VisualizationSettled {
                    generation,
                    kind,
                    status,
                } => {
                    tracing::debug!(generation, %kind, ?status, "chart settled");
                }
                _ => {}
            }
        }
    })
}

async fn run_analyze(app: &AnalyzerApp, file: &Path, out_dir: Option<&Path>) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read chat export: {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = app.analyze(Some(ChatExport::new(file_name, bytes))).await?;
    let Some(report) = outcome.job.payload.as_ref() else {
        bail!(
            "{}",
            outcome
                .job
                .error_message
                .as_deref()
                .unwrap_or(ANALYSIS_ERROR_MESSAGE)
        );
    };
    print!("{}", format_report(report));

    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
        for (stem, plot) in [
            ("topic_plot", &report.topic_plot),
            ("sentiment_plot", &report.sentiment_plot),
        ] {
            if let Some(image) = plot {
                let path = write_artifact(dir, stem, image)?;
                println!("Wrote {}", path.display());
            }
        }
    }

    let Some(run) = outcome.visualizations else {
        return Ok(());
    };
    let set = run.settled().await;
    println!("---");
    for resource in &set.resources {
        match resource.status {
            ResourceStatus::Loaded => {
                println!("{}: loaded", resource.kind.title());
                if let (Some(dir), Some(image)) = (out_dir, resource.payload.as_ref()) {
                    let path = write_artifact(dir, resource.kind.response_field(), image)?;
                    println!("Wrote {}", path.display());
                }
            }
            ResourceStatus::Failed => println!(
                "{}: {}",
                resource.kind.title(),
                resource
                    .error_message
                    .as_deref()
                    .unwrap_or(VISUALIZATION_ERROR_MESSAGE)
            ),
            ResourceStatus::Pending => println!("{}: pending", resource.kind.title()),
        }
    }

    Ok(())
}

fn format_report(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Total messages: {}\n", report.total_messages));
    out.push_str(&format!("Words:          {}\n", report.words));
    out.push_str(&format!("Media shared:   {}\n", report.num_media));
    out.push_str(&format!("Links shared:   {}\n", report.num_links));
    if !report.sentiment_distribution.is_empty() {
        out.push_str("Sentiment:\n");
        for (label, count) in &report.sentiment_distribution {
            out.push_str(&format!("  {label}: {count}\n"));
        }
    }
    out
}

fn write_artifact(dir: &Path, stem: &str, image: &ImageArtifact) -> Result<PathBuf> {
    let bytes = image
        .decode()
        .with_context(|| format!("{stem} is not valid base64"))?;
    let path = dir.join(format!("{stem}.png"));
    std::fs::write(&path, bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn run_repl(app: &AnalyzerApp) -> Result<()> {
    println!("chatlens chat. Type 'quit' to exit.");
    println!("---");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match app.chat().send_message(input) {
            Ok(handle) => match handle.await {
                Ok(Some(turn)) => println!("{}", turn.content),
                Ok(None) => {}
                Err(err) => eprintln!("Error: {err}"),
            },
            Err(err) => eprintln!("Error: {err}"),
        }
    }

    Ok(())
}
