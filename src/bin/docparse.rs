//! CLI binary for edgequake-docparse.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ProcessConfig`, picks a backend and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_docparse::services::llm::LlmProviderService;
use edgequake_docparse::{
    DocumentProcessor, GeminiClient, ProcessConfig, ProcessProgressCallback, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

/// Live progress bar plus one log line per finished chunk. Chunks finish
/// out of order, so start times are tracked per index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Counting pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ProcessProgressCallback for CliProgressCallback {
    fn on_process_start(&self, total_chunks: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_chunks as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Processing");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_chunks} chunks…"))
        ));
    }

    fn on_chunk_start(&self, index: usize, _total: usize) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(index, Instant::now());
        }
        self.bar.set_message(format!("chunk {}", index + 1));
    }

    fn on_chunk_complete(&self, index: usize, total: usize, text_len: usize) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            index + 1,
            total,
            dim(&format!("{text_len:>6} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_process_complete(&self, total_chunks: usize, succeeded: usize) {
        let failed = total_chunks.saturating_sub(succeeded);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} chunks processed successfully",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} chunks processed  ({} failed)",
                if failed == total_chunks { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total_chunks,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract text from a PDF (stdout)
  docparse parse report.pdf

  # Smaller chunks, more workers, write to file
  docparse --pages-per-chunk 3 --max-threads 8 parse report.pdf -o report.txt

  # Remote document
  docparse parse https://arxiv.org/pdf/1706.03762

  # Several files in one request
  docparse batch a.pdf b.pdf notes.txt

  # Every file in a folder → <stem>.md
  docparse folder ./inbox --out-dir ./parsed --ext md

  # Cache-backed processing, handles kept for 2 hours
  docparse --use-cache --cache-ttl 2 parse big.pdf

  # Manage cache handles and uploaded files
  docparse cache list
  docparse cache ttl cachedContents/abc123 4
  docparse cache delete cachedContents/abc123
  docparse files list

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default backend)
  EDGEQUAKE_LLM_PROVIDER  Use an edgequake-llm provider instead (openai, anthropic, ollama, …)
  EDGEQUAKE_MODEL         Model for that provider
  PDFIUM_LIB_PATH         Path to libpdfium (otherwise the system library is used)
  RUST_LOG                Override log filtering
"#;

/// Extract text from documents with a remote model, chunk by chunk.
#[derive(Parser, Debug)]
#[command(
    name = "docparse",
    version,
    about = "Extract text from long documents by processing page chunks in parallel",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Model ID.
    #[arg(long, global = true, env = "DOCPARSE_MODEL", default_value = "gemini-2.0-flash")]
    model: String,

    /// Use an edgequake-llm provider (openai, anthropic, ollama, …) instead of Gemini.
    #[arg(long, global = true, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Pages per chunk.
    #[arg(long, global = true, env = "DOCPARSE_PAGES_PER_CHUNK", default_value_t = 5)]
    pages_per_chunk: usize,

    /// Chunks processed concurrently.
    #[arg(long, global = true, env = "DOCPARSE_MAX_THREADS", default_value_t = 4)]
    max_threads: usize,

    /// Attempts per chunk, first call included.
    #[arg(long, global = true, env = "DOCPARSE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Fixed delay between attempts, in milliseconds.
    #[arg(long, global = true, env = "DOCPARSE_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,

    /// Overall deadline per document, in seconds.
    #[arg(long, global = true, env = "DOCPARSE_DEADLINE")]
    deadline: Option<u64>,

    /// Wrap each chunk in a context cache before prompting.
    #[arg(long, global = true, env = "DOCPARSE_USE_CACHE")]
    use_cache: bool,

    /// TTL for new cache handles, in hours.
    #[arg(long, global = true, env = "DOCPARSE_CACHE_TTL")]
    cache_ttl: Option<f64>,

    /// Keep per-chunk cache handles after the run.
    #[arg(long, global = true)]
    keep_caches: bool,

    /// Instruction sent with every chunk (default: transcribe preserving layout).
    #[arg(long, global = true, env = "DOCPARSE_PROMPT")]
    prompt: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "DOCPARSE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCPARSE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCPARSE_QUIET")]
    quiet: bool,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "DOCPARSE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one file or URL.
    Parse {
        /// Local path or HTTP/HTTPS URL.
        input: String,
        /// Write text to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the full result (chunks, stats) as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Send several files as a single request.
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Process every file in a directory.
    Folder {
        dir: PathBuf,
        /// Output directory (default: the input directory).
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Extension of written files.
        #[arg(long, default_value = "md")]
        ext: String,
    },
    /// Manage context-cache handles.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Manage uploaded files.
    #[command(subcommand)]
    Files(FilesCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    List,
    Delete { name: String },
    Ttl { name: String, hours: f64 },
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    List,
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    // ── Logging setup ────────────────────────────────────────────────────
    let is_json = matches!(cli.command, Command::Parse { json: true, .. });
    let shows_chunks = matches!(cli.command, Command::Parse { .. } | Command::Folder { .. });
    let show_progress = shows_chunks && !opts.quiet && !opts.no_progress && !is_json;
    let filter = if opts.verbose {
        "debug"
    } else if opts.quiet || show_progress {
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

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ProcessProgressCallback>)
    } else {
        None
    };
    let config = build_config(opts, progress)?;
    let processor = build_processor(opts, config)?;

    match cli.command {
        Command::Parse {
            ref input,
            ref output,
            json,
        } => {
            let result = if input.starts_with("http://") || input.starts_with("https://") {
                processor.process_url(input).await
            } else {
                processor.process_path(input).await
            }
            .with_context(|| format!("Failed to process {input}"))?;

            if json {
                let json = serde_json::to_string_pretty(&result)
                    .context("Failed to serialise output")?;
                println!("{json}");
            } else if let Some(path) = output {
                tokio::fs::write(path, &result.text)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            } else {
                write_stdout(&result.text)?;
            }

            if !opts.quiet && !json {
                let s = &result.stats;
                if s.total_chunks == 0 {
                    eprintln!("{} document has no pages", cyan("⚠"));
                }
                eprintln!(
                    "   {} pages  {} tokens in  /  {} tokens out  —  {}ms total",
                    s.total_pages,
                    dim(&s.total_input_tokens.to_string()),
                    dim(&s.total_output_tokens.to_string()),
                    s.duration_ms,
                );
            }
        }
        Command::Batch { ref files } => {
            let text = processor.process_multiple_files(files).await;
            if text.is_empty() {
                bail!("No text produced for {} files", files.len());
            }
            write_stdout(&text)?;
        }
        Command::Folder {
            ref dir,
            ref out_dir,
            ref ext,
        } => {
            let out_dir = out_dir.clone().unwrap_or_else(|| dir.clone());
            let summary = processor
                .process_folder(dir, &out_dir, ext)
                .await
                .with_context(|| format!("Failed to process folder {}", dir.display()))?;
            if !opts.quiet {
                eprintln!(
                    "{} {} written, {} skipped  →  {}",
                    if summary.skipped.is_empty() { green("✔") } else { cyan("⚠") },
                    summary.written.len(),
                    summary.skipped.len(),
                    bold(&out_dir.display().to_string()),
                );
            }
        }
        Command::Cache(ref cmd) => run_cache_command(&processor, cmd).await?,
        Command::Files(ref cmd) => run_files_command(&processor, cmd).await?,
    }

    Ok(())
}

async fn run_cache_command(processor: &DocumentProcessor, cmd: &CacheCommand) -> Result<()> {
    if processor.cache_manager().is_none() {
        bail!("Cache commands need the Gemini backend (set GEMINI_API_KEY, unset --provider)");
    }
    match cmd {
        CacheCommand::List => {
            let caches = processor.list_caches().await;
            if caches.is_empty() {
                eprintln!("No caches found");
            }
            for c in caches {
                println!(
                    "{}  {}  expires {}  {}",
                    bold(&c.name),
                    c.model,
                    c.expire_time.as_deref().unwrap_or("?"),
                    dim(c.display_name.as_deref().unwrap_or("")),
                );
            }
        }
        CacheCommand::Delete { name } => {
            processor.delete_cache(name).await;
            eprintln!("{} delete requested for {}", green("✔"), name);
        }
        CacheCommand::Ttl { name, hours } => {
            let handle = processor
                .update_cache_ttl(name, *hours)
                .await
                .with_context(|| format!("Failed to update TTL of {name}"))?;
            eprintln!(
                "{} {} now expires {}",
                green("✔"),
                handle.name,
                handle.expire_time.as_deref().unwrap_or("?")
            );
        }
    }
    Ok(())
}

async fn run_files_command(processor: &DocumentProcessor, cmd: &FilesCommand) -> Result<()> {
    let Some(uploads) = processor.upload_service() else {
        bail!("File commands need the Gemini backend (set GEMINI_API_KEY, unset --provider)");
    };
    match cmd {
        FilesCommand::List => {
            let files = uploads.list_files().await.context("Failed to list files")?;
            if files.is_empty() {
                eprintln!("No files found");
            }
            for f in files {
                println!(
                    "{}  {}  {}  {}",
                    bold(&f.name),
                    f.mime_type,
                    f.size_bytes.map(|b| format!("{b} bytes")).unwrap_or_default(),
                    dim(f.state.as_deref().unwrap_or("")),
                );
            }
        }
        FilesCommand::Delete { name } => {
            uploads
                .delete_file(name)
                .await
                .with_context(|| format!("Failed to delete {name}"))?;
            eprintln!("{} deleted {}", green("✔"), name);
        }
    }
    Ok(())
}

/// Map CLI args to `ProcessConfig`.
fn build_config(opts: &GlobalOpts, progress: Option<ProgressCallback>) -> Result<ProcessConfig> {
    let mut builder = ProcessConfig::builder()
        .model(opts.model.as_str())
        .pages_per_chunk(opts.pages_per_chunk)
        .max_threads(opts.max_threads)
        .max_retries(opts.max_retries)
        .retry_delay_ms(opts.retry_delay_ms)
        .deadline_secs(opts.deadline)
        .use_cache(opts.use_cache)
        .keep_caches(opts.keep_caches)
        .download_timeout_secs(opts.download_timeout);

    if let Some(ref prompt) = opts.prompt {
        builder = builder.prompt(prompt.as_str());
    }
    if let Some(hours) = opts.cache_ttl {
        builder = builder.cache_ttl_hours(hours);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Gemini unless a provider was named; fall back to provider auto-detection
/// when no Gemini key is present.
fn build_processor(opts: &GlobalOpts, config: ProcessConfig) -> Result<DocumentProcessor> {
    if let Some(ref provider) = opts.provider {
        let service =
            LlmProviderService::resolve(Some(provider.as_str()), Some(opts.model.as_str()))
                .context("Failed to initialise provider")?;
        return Ok(DocumentProcessor::new(Arc::new(service), config)?);
    }
    match GeminiClient::from_env() {
        Ok(client) => Ok(DocumentProcessor::with_gemini_client(Arc::new(client), config)?),
        Err(_) => {
            let service =
                LlmProviderService::resolve(None, None).context("No backend configured")?;
            Ok(DocumentProcessor::new(Arc::new(service), config)?)
        }
    }
}

fn write_stdout(text: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(text.as_bytes())
        .context("Failed to write to stdout")?;
    if !text.ends_with('\n') {
        handle.write_all(b"\n").ok();
    }
    Ok(())
}
