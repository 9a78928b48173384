//! CLI entry point for the Giftbot backend: catalog admin and chat.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use giftbot_core::chunks::DocumentChunk;
use giftbot_core::config::{config_path, save_config_to};
use giftbot_core::index::DEFAULT_BATCH_SIZE;
use giftbot_core::openai::OpenAiClient;
use giftbot_core::{
    app_data_dir, embedder_from_config, generator_from_config, ingest, load_catalog, load_config,
    load_config_from, rebuild_from_catalog, status, watch_catalog, Config, ConversationMemory,
    Embedder, IndexHandle, IndexLocation, PromptTemplate, SearchMode, SearchParams, Session,
    TextSplitter, WELCOME_MESSAGE,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);
const PREVIEW_CHARS: usize = 60;

#[derive(Parser)]
#[command(name = "giftbot")]
#[command(about = "Giftbot: gift recommendations grounded in a product catalog")]
struct Cli {
    /// Config file to use instead of the one in the app data directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show backend status and the active index.
    Status,
    /// Show where Giftbot stores its config and index (app data directory).
    DataDir,
    /// Print the effective config.
    Config {
        /// Write the default config to the config path first.
        #[arg(long)]
        init: bool,
    },
    /// Load and chunk a catalog without embedding anything.
    Ingest {
        #[arg(value_name = "CSV")]
        path: PathBuf,
    },
    /// Rebuild the index from a catalog. Replaces the current index.
    Build {
        #[arg(value_name = "CSV")]
        path: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Show the chunks retrieved for a question.
    Query {
        text: String,
        /// Number of chunks to return.
        #[arg(short, long)]
        k: Option<usize>,
        /// similarity or diversity.
        #[arg(long)]
        mode: Option<SearchMode>,
    },
    /// Ask a single question.
    Ask { text: String },
    /// Interactive chat. `/reset` forgets the conversation, `/quit` exits.
    Chat,
    /// Rebuild the index whenever the catalog file changes.
    Watch {
        #[arg(value_name = "CSV")]
        path: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            println!("Giftbot backend");
            println!("  core: {}", status());
            let location = index_location(&config)?;
            println!("  index: {}", location.root().display());
            match location.manifest() {
                Ok(m) => println!(
                    "  active version: {} ({} entries, {} dims, model {})",
                    m.version, m.entry_count, m.dimension, m.embed_model
                ),
                Err(e) => println!("  active version: none ({})", e),
            }
            match OpenAiClient::from_config(&config) {
                Ok(client) => println!(
                    "  generation: {} at {}",
                    client.chat_model(),
                    config.generation.base_url
                ),
                Err(e) => println!("  generation: unavailable ({})", e),
            }
            let key = if config.api_key().is_some() { "set" } else { "not set" };
            println!("  api key: {}", key);
        }
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => eprintln!("Could not determine app data directory."),
        },
        Commands::Config { init } => {
            let config = if init {
                let path = match cli.config.clone() {
                    Some(p) => p,
                    None => config_path().context("could not determine app data directory")?,
                };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                let defaults = Config::default();
                save_config_to(&defaults, &path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!("wrote default config to {}", path.display());
                defaults
            } else {
                config
            };
            print!("{}", toml::to_string_pretty(&config).context("failed to render config")?);
        }
        Commands::Ingest { path } => {
            let load = load_catalog(&path, &config.id_column)
                .with_context(|| format!("failed to load {}", path.display()))?;
            let chunks = ingest(&load.records, &splitter(&config)?);
            println!("Loaded {} product(s) from {}", load.records.len(), path.display());
            for skipped in &load.skipped {
                println!("  skipped {}", skipped);
            }
            if load.duplicate_ids > 0 {
                println!("  {} duplicate identifier(s)", load.duplicate_ids);
            }
            println!("{} chunk(s)", chunks.len());
            for c in &chunks {
                println!("  {}@{}  {}", c.source_id, c.start_offset, preview(&c.text));
            }
        }
        Commands::Build { path, yes } => {
            let location = index_location(&config)?;
            if !yes && !confirm_rebuild(&location).await? {
                println!("Aborted.");
                return Ok(());
            }
            rebuild(&config, &path, &location).await?;
        }
        Commands::Query { text, k, mode } => {
            let handle = open_index(&config)?;
            let mut params = SearchParams::from(&config.retrieval);
            if let Some(k) = k {
                params.k = k;
            }
            if let Some(mode) = mode {
                params.mode = mode;
            }
            let embedder = embedder_from_config(&config).context("failed to set up embedding service")?;
            let embedding = embedder.embed_one(&text).await.context("failed to embed question")?;
            let hits = handle.query(&embedding, &params)?;
            println!("{} result(s) from index {} ({} mode)", hits.len(), handle.version(), params.mode);
            for hit in hits {
                println!(
                    "  {:.3}  {}@{}  {}",
                    hit.score,
                    hit.chunk.source_id,
                    hit.chunk.start_offset,
                    preview(&hit.chunk.text)
                );
            }
        }
        Commands::Ask { text } => {
            let mut session = new_session(&config)?;
            let answer = session.answer(&text).await?;
            println!("{}", answer.result);
            print_sources(&answer.sources);
        }
        Commands::Chat => chat(&config).await?,
        Commands::Watch { path, yes } => {
            let location = index_location(&config)?;
            if !yes && !confirm_rebuild(&location).await? {
                println!("Aborted.");
                return Ok(());
            }
            watch(&config, &path, &location).await?;
        }
    }
    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => load_config_from(p).with_context(|| format!("failed to load config {}", p.display())),
        None => Ok(load_config()),
    }
}

fn index_location(config: &Config) -> Result<IndexLocation> {
    let dir = config
        .index_dir()
        .context("could not determine index directory; set index_dir in config")?;
    Ok(IndexLocation::new(dir))
}

fn open_index(config: &Config) -> Result<IndexHandle> {
    let location = index_location(config)?;
    location
        .open()
        .context("no usable index; run `giftbot build <csv>` first")
}

fn splitter(config: &Config) -> Result<TextSplitter> {
    TextSplitter::new(config.chunking.max_size, config.chunking.overlap).context("invalid chunking settings")
}

fn new_session(config: &Config) -> Result<Session> {
    let handle = open_index(config)?;
    let embedder = embedder_from_config(config).context("failed to set up embedding service")?;
    let generator = generator_from_config(config).context("failed to set up generation service")?;
    let mut session = Session::new(embedder, generator, handle, SearchParams::from(&config.retrieval))
        .with_memory(ConversationMemory::bounded(config.memory.max_exchanges));
    if let Some(path) = config.prompt_template_path.as_deref().filter(|p| !p.is_empty()) {
        let template = PromptTemplate::from_file(Path::new(path))
            .with_context(|| format!("failed to load prompt template {}", path))?;
        session = session.with_template(template);
    }
    Ok(session)
}

async fn rebuild(config: &Config, path: &Path, location: &IndexLocation) -> Result<()> {
    let embedder = embedder_from_config(config).context("failed to set up embedding service")?;
    let batch_size = match config.embedding.batch_size {
        0 => DEFAULT_BATCH_SIZE,
        n => n,
    };
    let (handle, report) = rebuild_from_catalog(
        path,
        &config.id_column,
        &splitter(config)?,
        embedder.as_ref(),
        location,
        batch_size,
    )
    .await
    .with_context(|| format!("failed to build index from {}", path.display()))?;
    println!(
        "Indexed {} product(s) as {} chunk(s); version {}",
        report.catalog.records.len(),
        report.chunks,
        handle.version()
    );
    if !report.catalog.skipped.is_empty() {
        println!("  skipped {} row(s)", report.catalog.skipped.len());
    }
    Ok(())
}

async fn chat(config: &Config) -> Result<()> {
    let mut session = new_session(config)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}\n", WELCOME_MESSAGE);
    loop {
        let Some(line) = prompt_line(&mut lines, "> ").await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset();
                println!("Conversation cleared.\n");
                continue;
            }
            _ => {}
        }
        match session.answer(line).await {
            Ok(answer) => {
                println!("\n{}\n", answer.result);
                if !answer.unverified_citations.is_empty() {
                    warn!(ids = ?answer.unverified_citations, "links to products outside the retrieved context");
                }
            }
            Err(e) => eprintln!("Sorry, that failed: {}\n", e),
        }
    }
    Ok(())
}

async fn watch(config: &Config, path: &Path, location: &IndexLocation) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = watch_catalog(path, WATCH_DEBOUNCE, move || {
        let _ = tx.send(());
    })
    .with_context(|| format!("failed to watch {}", path.display()))?;
    println!("Watching {} (Ctrl-C to stop)", watcher.path().display());
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}
        info!("catalog changed; rebuilding");
        if let Err(e) = rebuild(config, path, location).await {
            warn!("rebuild failed, keeping previous index: {:#}", e);
        }
    }
    Ok(())
}

async fn confirm_rebuild(location: &IndexLocation) -> Result<bool> {
    println!(
        "This replaces the index at {} and deletes its previous versions.",
        location.root().display()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let Some(reply) = prompt_line(&mut lines, "Type 'yes' to continue: ").await? else {
        bail!("no confirmation given");
    };
    Ok(reply.trim().eq_ignore_ascii_case("yes"))
}

async fn prompt_line(lines: &mut Lines<BufReader<Stdin>>, prompt: &str) -> Result<Option<String>> {
    print!("{}", prompt);
    std::io::stdout().flush().context("failed to write to stdout")?;
    lines.next_line().await.context("failed to read stdin")
}

fn print_sources(sources: &[DocumentChunk]) {
    if sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for c in sources {
        println!("  {}@{}", c.source_id, c.start_offset);
    }
}

fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or("").trim();
    if first.chars().count() > PREVIEW_CHARS {
        format!("{}...", first.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        first.to_string()
    }
}
