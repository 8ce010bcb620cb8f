//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use coursepipe_core::{ProgressReporter, RunManifest, RunOptions, inspect, resolve_run_dir};
use coursepipe_crawler::CanvasClient;
use coursepipe_markdown::ConversionChain;
use coursepipe_shared::{
    CONFIG_FILE_NAME, ConfigOverrides, CourseRef, IncludeFilter, PipelineConfig, ResourceId,
    Stage, StepSelection, UnitState, init_config, resolve_config, resolve_secret,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// coursepipe: turn a Canvas course into filtered, chunked Markdown.
#[derive(Parser)]
#[command(
    name = "coursepipe",
    version,
    about = "Crawl a Canvas course and turn its content into filtered, chunked Markdown.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file. Defaults to ./coursepipe.toml, then ~/.coursepipe/coursepipe.toml.
    #[arg(long, global = true)]
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
    /// Run (or resume) the pipeline for one course.
    Run {
        #[command(flatten)]
        flags: RunFlags,

        /// Continue the run already present in the run directory.
        #[arg(long)]
        resume: bool,

        /// With --resume, retry units that previously failed.
        #[arg(long, requires = "resume")]
        retry_failed: bool,

        /// Run directory (defaults to <runs_root>/<run_name>).
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },

    /// Show the state of a run directory.
    Status {
        /// Run directory to inspect.
        #[arg(long)]
        run_dir: PathBuf,

        /// Print the full manifest as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags that override values from the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct RunFlags {
    /// Canvas course URL, e.g. https://canvas.example.edu/courses/12345.
    #[arg(long)]
    pub course_url: Option<String>,

    /// course_root, a comma-separated kind list, or module:<id>.
    #[arg(long)]
    pub include: Option<IncludeFilter>,

    /// all, or a comma-separated subset of crawl,convert,filter,chunk.
    #[arg(long)]
    pub steps: Option<StepSelection>,

    /// Allow the LLM converter as the last fallback.
    #[arg(long)]
    pub llm_fallback: bool,

    /// Title blacklist pattern; repeat to replace the configured list.
    /// Prefix with `re:` for a regular expression.
    #[arg(long = "blacklist", conflicts_with = "no_blacklist")]
    pub blacklist_patterns: Vec<String>,

    /// Disable the title blacklist, including the default terms.
    #[arg(long)]
    pub no_blacklist: bool,

    #[arg(long)]
    pub min_tokens: Option<usize>,

    #[arg(long)]
    pub max_chunk_tokens: Option<usize>,

    #[arg(long)]
    pub overlap_tokens: Option<usize>,

    #[arg(long)]
    pub runs_root: Option<PathBuf>,

    #[arg(long)]
    pub run_name: Option<String>,

    /// Concurrent fetches during crawl.
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub retry_budget: Option<usize>,

    /// Keep exact duplicates instead of dropping later copies.
    #[arg(long)]
    pub no_dedupe: bool,
}

impl From<RunFlags> for ConfigOverrides {
    fn from(flags: RunFlags) -> Self {
        Self {
            course_url: flags.course_url,
            include: flags.include,
            steps: flags.steps,
            llm_fallback_enabled: flags.llm_fallback.then_some(true),
            blacklist_patterns: if flags.no_blacklist {
                Some(Vec::new())
            } else {
                (!flags.blacklist_patterns.is_empty()).then_some(flags.blacklist_patterns)
            },
            min_tokens: flags.min_tokens,
            max_chunk_tokens: flags.max_chunk_tokens,
            overlap_tokens: flags.overlap_tokens,
            runs_root: flags.runs_root,
            run_name: flags.run_name,
            workers: flags.workers,
            retry_budget: flags.retry_budget,
            dedupe: flags.no_dedupe.then_some(false),
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a config file with defaults.
    Init {
        /// Where to write it.
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

const LOG_TARGETS: [&str; 8] = [
    "coursepipe",
    "coursepipe_core",
    "coursepipe_shared",
    "coursepipe_crawler",
    "coursepipe_markdown",
    "coursepipe_filter",
    "coursepipe_chunker",
    "coursepipe_storage",
];

/// Initialize tracing based on CLI flags. `RUST_LOG` takes precedence.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let directives = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

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

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    let config_file = cli.config;
    match cli.command {
        Command::Run {
            flags,
            resume,
            retry_failed,
            run_dir,
        } => {
            let options = RunOptions {
                resume,
                retry_failed,
                run_dir,
            };
            cmd_run(config_file.as_deref(), flags.into(), options).await
        }
        Command::Status { run_dir, json } => cmd_status(&run_dir, json).await.map(|()| 0),
        Command::Config { action } => match action {
            ConfigAction::Init { path } => cmd_config_init(&path).map(|()| 0),
            ConfigAction::Show => cmd_config_show(config_file.as_deref()).map(|()| 0),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_file: Option<&Path>,
    overrides: ConfigOverrides,
    options: RunOptions,
) -> Result<i32> {
    let config = resolve_config(config_file, overrides)?;
    config.validate()?;
    let course = CourseRef::parse(&config.course_url)?;
    let token = resolve_secret(&config.crawl.token_env, "Canvas API token")?;

    let client = CanvasClient::new(
        &course.base,
        token,
        Duration::from_secs(config.crawl.unit_timeout_secs),
    )?;
    let chain = ConversionChain::from_config(&config, Some(course.base.clone()))?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    info!(
        course_url = %config.course_url,
        course_id = %course.course_id,
        steps = ?config.steps,
        "starting coursepipe run"
    );

    let reporter = CliProgress::new();
    let outcome =
        coursepipe_core::run(&config, options, Arc::new(client), &chain, &reporter, cancel).await?;

    print_summary(&outcome.manifest, &outcome.run_dir);
    Ok(outcome.manifest.exit_code())
}

/// First Ctrl-C stops handing out new units; a second one is left to the
/// default handler.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight units");
            cancel.cancel();
        }
    });
}

async fn cmd_status(run_dir: &Path, json: bool) -> Result<()> {
    if !run_dir.is_dir() {
        return Err(eyre!("'{}' is not a run directory", run_dir.display()));
    }
    let manifest = inspect(run_dir).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        print_summary(&manifest, run_dir);
    }
    Ok(())
}

fn cmd_config_init(path: &Path) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_file: Option<&Path>) -> Result<()> {
    let config: PipelineConfig = resolve_config(config_file, ConfigOverrides::default())?;
    println!("{}", config.to_toml()?);
    if let Ok(dir) = resolve_run_dir(&config, None) {
        println!("# run directory: {}", dir.display());
    }
    Ok(())
}

fn print_summary(manifest: &RunManifest, run_dir: &Path) {
    let body = &manifest.body;
    let counts = &body.counts;
    println!();
    println!("  Run:        {}", manifest.run.run_id);
    println!("  Status:     {}", body.status.as_str());
    println!(
        "  Completed:  {}",
        body.stage_cursor.map_or("none", |s| s.as_str())
    );
    println!("  Fetched:    {} ({} failed)", counts.fetched, counts.failed);
    println!(
        "  Converted:  {} ({} failed)",
        counts.converted, counts.conversion_failed
    );
    println!(
        "  Kept:       {} ({} filtered out)",
        counts.kept, counts.filtered_out
    );
    println!(
        "  Chunked:    {} resources, {} chunks",
        counts.chunked, counts.chunks_total
    );
    if let Some(interruption) = &body.interruption {
        println!(
            "  Stopped in: {} ({})",
            interruption.stage, interruption.reason
        );
    }
    if !body.errors.is_empty() {
        println!("  Errors:     {} (see manifest.json)", body.errors.len());
    }
    println!("  Path:       {}", run_dir.display());
    println!(
        "  Time:       {:.1}s",
        Duration::from_millis(manifest.run.duration_ms).as_secs_f64()
    );
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// One indicatif bar per stage.
struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: Stage, pending: usize) {
        let bar = ProgressBar::new(pending as u64);
        let style =
            ProgressStyle::with_template("{spinner:.cyan} {prefix:>8} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(stage.as_str());
        bar.enable_steady_tick(Duration::from_millis(80));
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(previous) = slot.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn unit_finished(&self, _stage: Stage, resource_id: &ResourceId, state: UnitState) {
        self.with_bar(|bar| {
            bar.set_message(format!("{resource_id} {}", state.as_str()));
            bar.inc(1);
        });
    }

    fn stage_finished(&self, _stage: Stage) {
        self.with_bar(|bar| bar.finish_and_clear());
    }

    fn done(&self, _manifest: &RunManifest) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut slot| slot.take()) {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(args: &[&str]) -> ConfigOverrides {
        let cli = Cli::try_parse_from(args).expect("valid arguments");
        match cli.command {
            Command::Run { flags, .. } => flags.into(),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn unset_flags_leave_the_config_alone() {
        let o = overrides(&["coursepipe", "run"]);
        assert!(o.course_url.is_none());
        assert!(o.llm_fallback_enabled.is_none());
        assert!(o.blacklist_patterns.is_none());
        assert!(o.dedupe.is_none());
    }

    #[test]
    fn flags_become_overrides() {
        let o = overrides(&[
            "coursepipe",
            "run",
            "--course-url",
            "https://canvas.example.edu/courses/7",
            "--steps",
            "crawl,convert",
            "--include",
            "module:12",
            "--blacklist",
            "quiz",
            "--blacklist",
            "re:^draft",
            "--no-dedupe",
            "--llm-fallback",
            "--min-tokens",
            "20",
        ]);
        assert_eq!(
            o.steps,
            Some(StepSelection::Only(vec![Stage::Crawl, Stage::Convert]))
        );
        assert_eq!(o.include, Some(IncludeFilter::Module("12".into())));
        assert_eq!(
            o.blacklist_patterns,
            Some(vec!["quiz".to_string(), "re:^draft".to_string()])
        );
        assert_eq!(o.dedupe, Some(false));
        assert_eq!(o.llm_fallback_enabled, Some(true));
        assert_eq!(o.min_tokens, Some(20));
    }

    #[test]
    fn flags_match_the_equivalent_config_file() {
        let path = std::env::temp_dir().join(format!("coursepipe-cli-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "course_url = \"https://canvas.example.edu/courses/7\"\n\
             max_chunk_tokens = 300\n\
             overlap_tokens = 30\n",
        )
        .unwrap();
        let from_file = resolve_config(Some(&path), ConfigOverrides::default()).unwrap();

        let mut from_flags = PipelineConfig::default();
        overrides(&[
            "coursepipe",
            "run",
            "--course-url",
            "https://canvas.example.edu/courses/7",
            "--max-chunk-tokens",
            "300",
            "--overlap-tokens",
            "30",
        ])
        .apply(&mut from_flags);

        assert_eq!(from_flags, from_file);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn no_blacklist_clears_the_default_terms() {
        let mut config = PipelineConfig {
            course_url: "https://canvas.example.edu/courses/7".into(),
            ..PipelineConfig::default()
        };
        assert!(!config.blacklist_patterns.is_empty());
        overrides(&["coursepipe", "run", "--no-blacklist"]).apply(&mut config);
        assert!(config.blacklist_patterns.is_empty());
        assert!(config.validate().is_ok());

        assert!(
            Cli::try_parse_from(["coursepipe", "run", "--no-blacklist", "--blacklist", "exam"])
                .is_err()
        );
    }

    #[test]
    fn empty_blacklist_flag_fails_validation() {
        let mut config = PipelineConfig {
            course_url: "https://canvas.example.edu/courses/7".into(),
            ..PipelineConfig::default()
        };
        overrides(&["coursepipe", "run", "--blacklist", ""]).apply(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_failed_requires_resume() {
        assert!(Cli::try_parse_from(["coursepipe", "run", "--retry-failed"]).is_err());
        assert!(Cli::try_parse_from(["coursepipe", "run", "--resume", "--retry-failed"]).is_ok());
    }
}
