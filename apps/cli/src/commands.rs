//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use zoneflow_core::{
    EngineObserver, NullSink, ProcessingController, ProgressSnapshot, ResultSink, ZoneFailure,
};
use zoneflow_shared::{
    BoundingBox, ContentType, EngineConfig, RunState, Zone, ZoneId, ZoneResult, config_file_path,
    init_config, load_config, load_config_from,
};
use zoneflow_tools::{CapabilityRegistry, ToolAssignmentEngine, ToolRegistry};

use crate::sink::JsonlSink;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// zoneflow: route document zones through extraction tools and merge the results.
#[derive(Parser)]
#[command(
    name = "zoneflow",
    version,
    about = "Schedule document zones across extraction tools, score and merge their output.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.zoneflow/zoneflow.toml).
    #[arg(short, long, global = true, env = "ZONEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process a JSON array of zones with the configured tools.
    Run {
        /// Zones file (JSON array).
        #[arg(long)]
        zones: PathBuf,

        /// Write results as JSON lines to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Hide the progress bar.
        #[arg(long)]
        quiet: bool,
    },

    /// Show which tools a content type would be routed to.
    Assign {
        /// Content type: text, table, image, diagram, header, footer, unknown.
        #[arg(long)]
        content_type: ContentType,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Check the configuration and report the first problem found.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "zoneflow=info",
        1 => "zoneflow=debug",
        _ => "zoneflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { zones, out, quiet } => {
            cmd_run(config_path, &zones, out.as_deref(), quiet).await
        }
        Command::Assign { content_type } => cmd_assign(config_path, content_type),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
            ConfigAction::Validate => cmd_config_validate(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn read_zones(path: &Path) -> Result<Vec<Zone>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read zones file '{}': {e}", path.display()))?;
    let zones: Vec<Zone> = serde_json::from_str(&text)
        .map_err(|e| eyre!("invalid zones file '{}': {e}", path.display()))?;
    Ok(zones)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&Path>,
    zones_path: &Path,
    out: Option<&Path>,
    quiet: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let zones = read_zones(zones_path)?;
    if zones.is_empty() {
        return Err(eyre!("zones file '{}' contains no zones", zones_path.display()));
    }

    let registry = ToolRegistry::from_config(&config)?;
    if registry.is_empty() {
        return Err(eyre!(
            "no tool declares a command; add `command = [..]` to at least one [[tools]] entry"
        ));
    }

    let sink: Arc<dyn ResultSink> = match out {
        Some(path) => Arc::new(JsonlSink::create(path)?),
        None => Arc::new(NullSink),
    };
    let progress = Arc::new(CliProgress::new(zones.len() as u64, quiet));

    let controller = ProcessingController::builder(config, registry)
        .sink(sink)
        .observer(Arc::clone(&progress) as Arc<dyn EngineObserver>)
        .build()?;

    info!(zones = zones.len(), file = %zones_path.display(), "starting run");
    let run_id = controller.start(zones)?;

    let summary = tokio::select! {
        summary = controller.wait(&run_id) => summary?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%run_id, "interrupt received, cancelling run");
            controller.cancel(&run_id)?;
            controller.wait(&run_id).await?
        }
    };
    progress.finish();

    let p = &summary.progress;
    println!();
    match p.run_state {
        RunState::Cancelled => println!("  Run cancelled."),
        _ => println!("  Run complete."),
    }
    println!("  Run:            {}", summary.run_id);
    println!("  Completed:      {}", p.completed);
    println!("  Low confidence: {}", p.low_confidence);
    println!("  Failed:         {}", p.failed);
    println!("  Cancelled:      {}", p.cancelled);
    println!("  Avg confidence: {:.3}", p.average_confidence);
    println!("  Time:           {:.1}s", p.elapsed_ms as f64 / 1000.0);
    if let Some(path) = out {
        println!("  Results:        {}", path.display());
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress bar driven by engine snapshots.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: u64, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total)
        };
        // The template is a literal; fall back to the default style if it
        // ever fails to parse.
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(
                style
                    .progress_chars("=> ")
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EngineObserver for CliProgress {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_zones as u64);
        self.bar.set_position(snapshot.finished() as u64);
        let eta = snapshot
            .estimated_time_remaining_ms
            .map(|ms| format!(" eta {:.0}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        self.bar.set_message(format!(
            "running {} · low {} · failed {} · avg {:.2}{eta}",
            snapshot.processing,
            snapshot.low_confidence,
            snapshot.failed,
            snapshot.average_confidence,
        ));
    }

    fn on_zone_completed(&self, _zone_id: &ZoneId, _result: &ZoneResult) {}

    fn on_zone_failed(&self, zone_id: &ZoneId, failure: &ZoneFailure) {
        self.bar.println(format!(
            "  zone {zone_id} failed after {} attempt(s): {}",
            failure.attempts, failure.message
        ));
    }
}

// ---------------------------------------------------------------------------
// assign
// ---------------------------------------------------------------------------

fn cmd_assign(config_path: Option<&Path>, content_type: ContentType) -> Result<()> {
    let config = Arc::new(resolve_config(config_path)?);
    config.validate()?;
    let capabilities = Arc::new(CapabilityRegistry::from_config(&config));
    let engine = ToolAssignmentEngine::new(capabilities, Arc::clone(&config));

    let probe = Zone {
        id: ZoneId::from("probe"),
        page_number: 1,
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            page_width: 1.0,
            page_height: 1.0,
        },
        content_type,
        user_priority: None,
        depends_on: vec![],
    };
    let assignment = engine.assign(&probe);
    let strategy = config.strategy_for(content_type);

    println!("  Content type: {content_type}");
    println!("  Primary:      {}", assignment.primary);
    if assignment.fallback_chain.is_empty() {
        println!("  Fallbacks:    (none)");
    } else {
        println!("  Fallbacks:    {}", assignment.fallback_chain.join(" → "));
    }
    println!("  Threshold:    {:.2}", strategy.confidence_threshold);
    println!("  Max attempts: {}", strategy.max_attempts);
    if assignment.warning.is_some() {
        println!("  Note:         no tool declares this content type; using the default tool");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn cmd_config_validate(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    config.validate()?;
    let source = match config_path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    println!(
        "Config OK: {} ({} tools, weights v{})",
        source.display(),
        config.tools.len(),
        config.confidence.active_version
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "zoneflow", "-vv", "run", "--zones", "zones.json", "--out", "out.jsonl",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run { zones, out, quiet } => {
                assert_eq!(zones, PathBuf::from("zones.json"));
                assert_eq!(out, Some(PathBuf::from("out.jsonl")));
                assert!(!quiet);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_content_type() {
        let cli = Cli::try_parse_from(["zoneflow", "assign", "--content-type", "table"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Assign {
                content_type: ContentType::Table
            }
        ));
        assert!(Cli::try_parse_from(["zoneflow", "assign", "--content-type", "poster"]).is_err());
    }

    #[test]
    fn zones_file_is_read() {
        let dir = std::env::temp_dir().join(format!("zoneflow-zones-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("zones.json");
        std::fs::write(
            &path,
            r#"[{"id":"z1","page_number":1,"content_type":"table",
                "bbox":{"x":0,"y":0,"width":10,"height":10,"page_width":100,"page_height":100}},
               {"id":"z2","page_number":1,"content_type":"sticker","depends_on":["z1"],
                "bbox":{"x":0,"y":20,"width":10,"height":10,"page_width":100,"page_height":100}}]"#,
        )
        .expect("write");

        let zones = read_zones(&path).expect("zones");
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].content_type, ContentType::Table);
        assert_eq!(zones[1].content_type, ContentType::Unknown);
        assert_eq!(zones[1].depends_on, vec![ZoneId::from("z1")]);

        std::fs::write(&path, "{}").expect("write");
        assert!(read_zones(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
