//! CLI binary for pdf-refmap.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `MappingConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use pdf_refmap::pipeline::input::load_layout;
use pdf_refmap::{
    analyze_stream_with_cancel, analyze_with_cancel, cancel_pair, write_output,
    AnalysisProgressCallback, MappingConfig, MappingStats, ProgressCallback, Stage, TuningProfile,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar driven by stage percentages, plus a
/// counter while the LLM works through escalated references.
struct CliProgressCallback {
    bar: ProgressBar,
    escalation_total: AtomicUsize,
    escalation_done: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(100);
        bar.set_style(style);
        bar.set_prefix("Mapping");
        bar.set_message("Loading layout…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            escalation_total: AtomicUsize::new(0),
            escalation_done: AtomicUsize::new(0),
        })
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_analysis_start(&self, total_pages: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Mapping references across {total_pages} pages…"))
        ));
    }

    fn on_stage_complete(&self, stage: Stage, progress: u8) {
        self.bar.set_position(progress as u64);
        self.bar.set_message(stage.message());
    }

    fn on_escalation_start(&self, pending: usize) {
        self.escalation_total.store(pending, Ordering::SeqCst);
        self.bar.set_prefix("Asking LLM");
        self.bar
            .set_message(format!("0/{pending} ambiguous references"));
    }

    fn on_mention_escalated(&self, _mention: usize, _matched: bool) {
        let done = self.escalation_done.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.escalation_total.load(Ordering::SeqCst);
        self.bar
            .set_message(format!("{done}/{total} ambiguous references"));
    }

    fn on_analysis_complete(&self, stats: &MappingStats) {
        self.bar.finish_and_clear();
        let matched = stats.total_mentions - stats.not_matched;
        eprintln!(
            "{} {}/{} references matched  {}",
            if stats.not_matched == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&matched.to_string()),
            stats.total_mentions,
            dim(&format!(
                "({} figures, {} by LLM)",
                stats.total_figures, stats.matched_by_disambiguator
            )),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rules only, JSON to stdout
  refmap paper.layout.json

  # Write to a file
  refmap paper.layout.json -o paper.refs.json

  # Layout served over HTTP
  refmap https://layout.example.org/jobs/42/layout.json

  # Let an LLM settle references the rules could not
  refmap --llm --provider openai --model gpt-4.1-nano paper.layout.json

  # Local Ollama server
  refmap --llm --base-url http://localhost:11434 --model llama3.1 paper.layout.json

  # Calibrated weights from a tuning profile
  refmap --tuning tuning.json paper.layout.json

  # Server-sent-event frames for every stage
  refmap --sse paper.layout.json

TUNING FILE (all sections and fields optional):
  {
    "extraction": { "bare_equation_proximity": 150.0, "max_range_span": 10 },
    "grouping":   { "caption_gap": 40.0, "min_caption_overlap": 0.5 },
    "scoring":    { "id_match": 0.7, "spatial": 0.2, "acceptance_threshold": 0.5 },
    "escalation": { "enabled": true, "concurrency": 4 }
  }

ENVIRONMENT VARIABLES:
  REFMAP_*                Every flag, e.g. REFMAP_LLM=true, REFMAP_TIMEOUT=30
  OPENAI_API_KEY          OpenAI API key (auto-detected for --llm)
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Map in-text figure, table and equation references to layout elements.
#[derive(Parser, Debug)]
#[command(
    name = "refmap",
    version,
    about = "Map in-text figure, table and equation references to layout elements",
    long_about = "Read the layout JSON of a PDF (text blocks and detected figures, tables, \
equations) and resolve every reference such as \"Fig. 3\" or \"Eq. (5)\" to the element it \
names. Ambiguous references can optionally be settled by an LLM.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local layout JSON path or HTTP/HTTPS URL.
    input: String,

    /// Write the result JSON to this file instead of stdout.
    #[arg(short, long, env = "REFMAP_OUTPUT")]
    output: Option<PathBuf>,

    /// Escalate references the rules leave unmatched to an LLM.
    #[arg(long, env = "REFMAP_LLM")]
    llm: bool,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "REFMAP_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID.
    #[arg(long, env = "REFMAP_MODEL")]
    model: Option<String>,

    /// Base URL of an Ollama-compatible server; bypasses provider detection.
    #[arg(long, env = "REFMAP_BASE_URL")]
    base_url: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "REFMAP_TEMPERATURE")]
    temperature: Option<f32>,

    /// Max LLM output tokens per answer.
    #[arg(long, env = "REFMAP_MAX_TOKENS")]
    max_tokens: Option<usize>,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "REFMAP_TIMEOUT")]
    timeout: Option<u64>,

    /// Total LLM attempts per reference.
    #[arg(long, env = "REFMAP_RETRY_ATTEMPTS")]
    retry_attempts: Option<u32>,

    /// Base backoff between attempts in milliseconds.
    #[arg(long, env = "REFMAP_RETRY_DELAY")]
    retry_delay: Option<u64>,

    /// Number of concurrent LLM calls.
    #[arg(short, long, env = "REFMAP_CONCURRENCY")]
    concurrency: Option<usize>,

    /// JSON tuning profile; flags override its values.
    #[arg(long, env = "REFMAP_TUNING")]
    tuning: Option<PathBuf>,

    /// Path to a text file containing a custom disambiguation prompt.
    #[arg(long, env = "REFMAP_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print a server-sent-event frame for every stage instead of one document.
    #[arg(long, env = "REFMAP_SSE")]
    sse: bool,

    /// Compact JSON instead of pretty-printed.
    #[arg(long, env = "REFMAP_COMPACT")]
    compact: bool,

    /// Disable progress bar.
    #[arg(long, env = "REFMAP_NO_PROGRESS")]
    no_progress: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "REFMAP_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "REFMAP_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "REFMAP_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar is the user-facing feedback; library INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.sse;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn AnalysisProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Load layout ──────────────────────────────────────────────────────
    let loaded = load_layout(&cli.input, cli.download_timeout)
        .await
        .with_context(|| format!("Failed to load layout from {}", cli.input))?;
    let mut document = loaded.document;
    document.filename.get_or_insert(loaded.source_name);
    document.file_size.get_or_insert(loaded.size);

    // Ctrl-C abandons in-flight LLM calls; the rule-based result is kept.
    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // ── SSE mode ─────────────────────────────────────────────────────────
    if cli.sse {
        let mut events = analyze_stream_with_cancel(document, &config, signal);
        let stdout = io::stdout();
        let mut failed = false;
        while let Some(event) = events.next().await {
            failed |= event.status == pdf_refmap::EventStatus::Error;
            let mut handle = stdout.lock();
            handle
                .write_all(event.to_sse_frame().as_bytes())
                .context("Failed to write to stdout")?;
            handle.flush().ok();
        }
        if failed {
            anyhow::bail!("Analysis failed");
        }
        return Ok(());
    }

    // ── Run analysis ─────────────────────────────────────────────────────
    let output = analyze_with_cancel(document, &config, signal)
        .await
        .context("Analysis failed")?;

    if let Some(ref output_path) = cli.output {
        write_output(&output, output_path, !cli.compact)
            .await
            .context("Failed to write output")?;
    } else {
        let json = output
            .to_json(!cli.compact)
            .context("Failed to serialise output")?;
        println!("{json}");
    }

    // ── Summary ──────────────────────────────────────────────────────────
    // The progress callback already printed the matched line.
    let stats = output.stats();
    if !cli.quiet && !show_progress {
        eprintln!(
            "Matched {}/{} references ({} figures) in {:.2}s",
            stats.total_mentions - stats.not_matched,
            stats.total_mentions,
            stats.total_figures,
            output.metadata.processing_time
        );
    }
    if !cli.quiet {
        if stats.escalation_failures > 0 {
            eprintln!(
                "   {} LLM escalations failed",
                red(&stats.escalation_failures.to_string())
            );
        }
        if stats.grouping_conflicts > 0 {
            eprintln!(
                "   {} grouping conflicts kept apart",
                dim(&stats.grouping_conflicts.to_string())
            );
        }
        if stats.cancelled {
            eprintln!("   {}", cyan("cancelled: LLM escalation stopped early"));
        }
        if let Some(ref output_path) = cli.output {
            eprintln!("   →  {}", bold(&output_path.display().to_string()));
        }
    }

    Ok(())
}

/// Map CLI args to `MappingConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<MappingConfig> {
    let mut builder = MappingConfig::builder().download_timeout_secs(cli.download_timeout);

    if let Some(ref path) = cli.tuning {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read tuning profile from {:?}", path))?;
        let profile: TuningProfile =
            serde_json::from_str(&json).context("Invalid tuning profile")?;
        builder = builder.tuning(profile);
    }

    if cli.llm {
        builder = builder.llm_enabled(true);
    }
    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p.clone());
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    if let Some(ref url) = cli.base_url {
        builder = builder.base_url(url.clone());
    }
    if let Some(t) = cli.temperature {
        builder = builder.temperature(t);
    }
    if let Some(n) = cli.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(s) = cli.timeout {
        builder = builder.timeout_secs(s);
    }
    if let Some(n) = cli.retry_attempts {
        builder = builder.retry_attempts(n);
    }
    if let Some(ms) = cli.retry_delay {
        builder = builder.retry_delay_ms(ms);
    }
    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
