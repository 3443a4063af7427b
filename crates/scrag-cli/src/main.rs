//! CLI entry point for the Scrag index engine.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use scrag_core::{
    app_data_dir, default_index_path, init_logging, load_config, load_config_file, load_sources,
    save_config, status, Chunker, Config, EmbedderKind, Embedder, EmbeddingArtifact, FileIndexStore,
    IndexPipeline, IndexStore, Metadata, QueryRequest, Retriever,
};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "scrag")]
#[command(about = "Scrag: chunk, embed, index and search text")]
struct Cli {
    /// Config file (TOML or YAML). Defaults to config.toml in the app data directory.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show library status and the active settings.
    Status,
    /// Show where Scrag stores its config and indices (app data directory).
    DataDir,
    /// Show or create the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Chunk a file or directory and print the chunks.
    Chunk {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Chunk and embed a file or directory, writing an embedding artifact.
    Embed {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Embedding backend (ollama or openai). Defaults to the configured one.
        #[arg(long, value_parser = parse_backend)]
        backend: Option<EmbedderKind>,
    },
    /// Add an embedding artifact to an index.
    Index {
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
    },
    /// Chunk, embed and index a file or directory.
    Build {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
        #[arg(long, value_parser = parse_backend)]
        backend: Option<EmbedderKind>,
    },
    /// Search an index.
    Query {
        text: String,
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Metadata constraint, `key=value`. Repeatable.
        #[arg(short, long = "filter", value_name = "KEY=VALUE", value_parser = parse_filter)]
        filters: Vec<(String, Value)>,
        #[arg(long)]
        no_scores: bool,
        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
        #[arg(long, value_parser = parse_backend)]
        backend: Option<EmbedderKind>,
    },
    /// Show index statistics.
    Stats {
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
    },
    /// Print one indexed document as JSON.
    Get {
        id: String,
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
    },
    /// Remove one document from an index.
    Delete {
        id: String,
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
    },
    /// Remove every document and delete the index file.
    Clear {
        #[arg(long, value_name = "FILE")]
        index: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand)]
enum ConfigAction {
    /// Print the effective config as TOML.
    Show,
    /// Write the default config to the app data directory.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },
}

/// `key=value`; the value is read as JSON when it parses (numbers, booleans), else as a string.
fn parse_filter(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.trim().is_empty() {
        return Err(format!("empty filter key in {s:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.trim().to_string(), value))
}

fn parse_backend(s: &str) -> Result<EmbedderKind, String> {
    s.parse().map_err(|e: scrag_core::EmbedError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => load_config(),
    };
    let mut log = config.logging.clone();
    if cli.verbose {
        log.level = "debug".into();
    }
    init_logging(&log)?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            println!("Scrag");
            println!("  core: {}", status());
            println!("  embedder: {}", config.embeddings.default_backend);
            println!("  store: {}", config.storage.backend);
            match default_index_path(&config) {
                Ok(p) => println!("  index: {}", p.display()),
                Err(e) => println!("  index: unavailable ({e})"),
            }
        }
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => bail!("could not determine app data directory"),
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", toml_string(&config)?),
            ConfigAction::Init { force } => {
                if let Some(path) = scrag_core::config::config_path().filter(|p| p.exists() && !force) {
                    bail!("{} already exists (use --force to replace it)", path.display());
                }
                let path = save_config(&Config::default())?;
                println!("Wrote {}", path.display());
            }
        },
        Commands::Chunk { path } => {
            let chunker = Chunker::new(config.chunking.clone())?;
            for doc in load_sources(&path)? {
                let chunks = chunker.process(&doc.text, &source_metadata(&path, &doc.path));
                println!("{} ({} chunk(s))", doc.path.display(), chunks.len());
                for chunk in &chunks.chunks {
                    println!("  [{}] {} chars, overlap {}", chunk.index, chunk.len(), chunk.overlap);
                    println!("    {}", preview(&chunk.text, 72));
                }
            }
        }
        Commands::Embed { path, output, backend } => {
            let mut pipeline = IndexPipeline::from_config(&config, backend)?;
            pipeline.initialize().await?;
            let artifact = embed_sources(&pipeline, &path).await?;
            artifact.save(&output)?;
            println!("Embedded {} chunk(s) into {}", artifact.len(), output.display());
        }
        Commands::Index { artifact, index } => {
            let artifact = EmbeddingArtifact::load(&artifact)?;
            let index = index_path(&config, index)?;
            let dimension = artifact.embeddings.first().map_or(0, Vec::len);
            let mut store = FileIndexStore::open(&index, dimension).create_if_missing(config.storage.create_if_missing);
            let pipeline = IndexPipeline::from_config(&config, None)?;
            let report = pipeline.index_artifact(&artifact, &mut store)?;
            if !report.success {
                bail!("indexing failed: {}", report.error_message.unwrap_or_default());
            }
            println!("Indexed {} document(s) into {}", report.indexed, index.display());
        }
        Commands::Build { path, index, backend } => {
            let index = index_path(&config, index)?;
            let mut pipeline = IndexPipeline::from_config(&config, backend)?;
            pipeline.initialize().await?;
            let mut total = 0;
            for doc in load_sources(&path)? {
                let report = pipeline
                    .build_index_from_text(&doc.text, &index, source_metadata(&path, &doc.path))
                    .await;
                if !report.success {
                    bail!(
                        "{}: {} stage failed: {}",
                        doc.path.display(),
                        report.failed_stage.map(|s| s.to_string()).unwrap_or_default(),
                        report.error_message.unwrap_or_default()
                    );
                }
                println!("  {}: {} chunk(s)", doc.path.display(), report.indexed);
                total += report.indexed;
            }
            println!("Indexed {} chunk(s) into {}", total, index.display());
        }
        Commands::Query {
            text,
            index,
            top_k,
            threshold,
            filters,
            no_scores,
            json,
            backend,
        } => {
            let index = index_path(&config, index)?;
            let mut pipeline = IndexPipeline::from_config(&config, backend)?;
            let dimension = pipeline.initialize().await?;
            let store = FileIndexStore::open(&index, dimension);

            let mut request = QueryRequest::new(text);
            request.top_k = top_k;
            request.include_scores = no_scores.then_some(false);
            request.threshold = threshold;
            for (key, value) in filters {
                request = request.with_filter(key, value);
            }
            let response = Retriever::new(pipeline.embedder(), &store)
                .with_config(config.retrieval.clone())
                .query(&request)
                .await;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.success {
                println!("{} result(s)\n", response.result_count);
                println!("{}", response.retrieved_content);
            }
            if !response.success {
                bail!("query failed: {}", response.error.unwrap_or_default());
            }
        }
        Commands::Stats { index } => {
            let store = FileIndexStore::open(index_path(&config, index)?, 0);
            let stats = store.stats();
            println!("documents: {}", stats.total_documents);
            println!("dimension: {}", stats.embedding_dimension);
            if let Some(p) = &stats.index_path {
                println!("path: {}", p.display());
            }
            println!("size: {:.3} MB", stats.index_size_mb());
        }
        Commands::Get { id, index } => {
            let store = FileIndexStore::open(index_path(&config, index)?, 0);
            let Some(doc) = store.get_document(&id) else {
                bail!("no document with id {id}");
            };
            println!("{}", serde_json::to_string_pretty(doc)?);
        }
        Commands::Delete { id, index } => {
            let mut store = FileIndexStore::open(index_path(&config, index)?, 0);
            if !store.delete_document(&id)? {
                bail!("no document with id {id}");
            }
            println!("Deleted {id}");
        }
        Commands::Clear { index } => {
            let index = index_path(&config, index)?;
            FileIndexStore::open(&index, 0).clear()?;
            println!("Cleared {}", index.display());
        }
    }
    Ok(())
}

fn index_path(config: &Config, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(default_index_path(config)?),
    }
}

/// Metadata describing one source file. `source` is its path relative to the input
/// root, which keeps document ids unique across files.
fn source_metadata(root: &Path, file: &Path) -> Metadata {
    let relative = file.strip_prefix(root).ok().filter(|p| !p.as_os_str().is_empty());
    let source = relative
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| file.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "doc".to_string());
    let mut meta = Metadata::new();
    meta.insert("source".into(), Value::from(source));
    if let Some(name) = file.file_name() {
        meta.insert("title".into(), Value::from(name.to_string_lossy().into_owned()));
    }
    meta.insert("path".into(), Value::from(file.display().to_string()));
    meta
}

/// Chunk and embed every source under `path` into one artifact. Per-chunk metadata
/// keeps each chunk's source so it survives into the index.
async fn embed_sources<E: Embedder>(pipeline: &IndexPipeline<E>, path: &Path) -> Result<EmbeddingArtifact> {
    let mut chunks = Vec::new();
    let mut embeddings = Vec::new();
    let mut chunk_metadata = Vec::new();
    for doc in load_sources(path)? {
        let set = pipeline.chunker().process(&doc.text, &source_metadata(path, &doc.path));
        if set.is_empty() {
            continue;
        }
        let batch = pipeline.embedder().embed(&set.texts()).await?;
        chunk_metadata.extend(set.chunks.iter().map(|c| Value::Object(c.metadata())));
        chunks.extend(set.texts());
        embeddings.extend(batch.vectors);
    }

    let mut metadata = Metadata::new();
    let root = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    metadata.insert("source".into(), Value::from(root.unwrap_or_else(|| "doc".into())));
    metadata.insert("model".into(), Value::from(pipeline.embedder().model()));
    metadata.insert("chunk_metadata".into(), Value::Array(chunk_metadata));
    Ok(EmbeddingArtifact::new(chunks, embeddings, metadata))
}

/// Config as TOML, with any API key hidden.
fn toml_string(config: &Config) -> Result<String> {
    let mut shown = config.clone();
    if shown.embeddings.openai.api_key.is_some() {
        shown.embeddings.openai.api_key = Some("<redacted>".into());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
