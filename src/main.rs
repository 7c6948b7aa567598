//! # Oracle RAG CLI (`orag`)
//!
//! The `orag` binary manages knowledge bases on disk: create them, add and
//! refresh sources, query them, and move them between machines.
//!
//! ## Usage
//!
//! ```bash
//! orag [--config ./config/orag.toml] [--kb NAME] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `orag init [name]` | Create an empty knowledge base |
//! | `orag list` | List knowledge bases in the store |
//! | `orag sources` | List the sources of a knowledge base |
//! | `orag add <location>` | Register a source and index it |
//! | `orag refresh [source]` | Re-scan one or all sources |
//! | `orag remove <source>` | Remove a source and everything derived from it |
//! | `orag forget <document>` | Drop one document and exclude it from refreshes |
//! | `orag get <document>` | Print a document and its chunks |
//! | `orag query "<text>"` | Top-k retrieval with citations |
//! | `orag stats` | Counts and per-source breakdown |
//! | `orag reindex` | Re-chunk and re-embed everything |
//! | `orag export <file>` | Write a portable archive |
//! | `orag import <file>` | Restore an archive as a new knowledge base |
//! | `orag delete <name>` | Delete a knowledge base |
//!
//! Logging goes to stderr and is controlled by `-v` or `RUST_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use oracle_rag::cancel::Deadline;
use oracle_rag::chunk::ChunkingPolicy;
use oracle_rag::config::{self, Config};
use oracle_rag::index::SearchFilter;
use oracle_rag::models::SourceType;
use oracle_rag::progress::ProgressMode;
use oracle_rag::retrieve::{render_context, Reconciliation, Retriever};
use oracle_rag::stats::{format_ts_iso, KbStats};
use oracle_rag::{KnowledgeBase, KnowledgeBaseStore};

const DEFAULT_CONFIG: &str = "./config/orag.toml";

/// Oracle RAG: local retrieval over your documents and codebases.
///
/// All commands accept `--config` pointing to a TOML file. Without one,
/// `./config/orag.toml` is used if present, otherwise built-in defaults.
#[derive(Parser)]
#[command(name = "orag", version, about = "Oracle RAG: local retrieval over documents and codebases")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Knowledge base to operate on. Defaults to `store.default_kb`.
    #[arg(long, global = true)]
    kb: Option<String>,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    /// More log output (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(p: ProgressArg) -> Self {
        match p {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty knowledge base.
    Init {
        /// Name; defaults to `--kb` or `store.default_kb`.
        name: Option<String>,
        /// Chunk size in characters.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Characters shared between consecutive chunks.
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },

    /// List knowledge bases in the store.
    List,

    /// List the sources of a knowledge base.
    Sources,

    /// Register a source and index it.
    Add {
        /// File path, directory, or http(s) URL.
        location: String,
        /// Source type; inferred from the location when omitted.
        #[arg(long = "type")]
        source_type: Option<SourceType>,
        /// Tag attached to every chunk of this source. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Re-scan a source (or all) and re-index what changed.
    Refresh {
        source: Option<String>,
    },

    /// Remove a source with its documents, chunks, and vectors.
    Remove {
        source: String,
    },

    /// Drop a document and keep it out of future refreshes.
    Forget {
        document: String,
    },

    /// Print a document with its chunks.
    Get {
        document: String,
    },

    /// Retrieve the chunks most similar to a query.
    Query {
        text: String,
        /// Number of results.
        #[arg(short, long)]
        k: Option<usize>,
        /// Drop results scoring below this.
        #[arg(long)]
        min_score: Option<f32>,
        /// Restrict to one source id.
        #[arg(long)]
        source: Option<String>,
        /// Restrict to sources of one type.
        #[arg(long = "type")]
        source_type: Option<SourceType>,
        /// Restrict to sources carrying this tag.
        #[arg(long)]
        tag: Option<String>,
        /// Restrict to locations under this prefix.
        #[arg(long)]
        prefix: Option<String>,
        /// Also search these knowledge bases. Repeatable.
        #[arg(long = "also")]
        also: Vec<String>,
        /// Embed the query per knowledge base when models differ.
        #[arg(long)]
        per_kb: bool,
        /// Print a numbered context block for prompting.
        #[arg(long, conflicts_with = "json")]
        context: bool,
        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show counts and a per-source breakdown.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Re-chunk and re-embed every document.
    Reindex {
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },

    /// Write the knowledge base to a portable archive.
    Export {
        dest: PathBuf,
    },

    /// Restore an archive as a new knowledge base.
    Import {
        archive: PathBuf,
        /// Import under a different name.
        #[arg(long = "as")]
        rename: Option<String>,
    },

    /// Delete a knowledge base from the store.
    Delete {
        name: String,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("oracle_rag={},orag={}", level, level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Ok(config::load_config(p)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(config::load_config(Path::new(DEFAULT_CONFIG))?)
        }
        None => Ok(Config::minimal()),
    }
}

fn infer_source_type(location: &str) -> SourceType {
    if location.starts_with("http://") || location.starts_with("https://") {
        SourceType::Web
    } else if Path::new(location).is_file() {
        SourceType::File
    } else {
        SourceType::Folder
    }
}

/// A deadline that Ctrl-C cancels.
fn interruptible() -> Deadline {
    let deadline = Deadline::none();
    let token = deadline.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    deadline
}

fn policy_from(cfg: &Config, size: Option<usize>, overlap: Option<usize>) -> anyhow::Result<ChunkingPolicy> {
    Ok(ChunkingPolicy::new(
        size.unwrap_or(cfg.chunking.chunk_size),
        overlap.unwrap_or(cfg.chunking.chunk_overlap),
    )?)
}

async fn open(store: &KnowledgeBaseStore, name: &str, progress: ProgressMode) -> anyhow::Result<KnowledgeBase> {
    let kb = store
        .load(name)
        .await
        .with_context(|| format!("opening knowledge base '{}'", name))?;
    Ok(kb.with_progress(progress.reporter()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = load_config(cli.config.as_deref())?;
    let store = KnowledgeBaseStore::open(&cfg)?;
    let kb_name = cli.kb.clone().unwrap_or_else(|| cfg.store.default_kb.clone());
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init {
            name,
            chunk_size,
            chunk_overlap,
        } => {
            let name = name.unwrap_or(kb_name);
            let policy = policy_from(&cfg, chunk_size, chunk_overlap)?;
            let kb = store.create(&name, policy).await?;
            let m = kb.manifest();
            println!(
                "Created knowledge base '{}' ({} / {}, {} dims) at {}",
                m.name,
                m.embedding_provider,
                m.embedding_model,
                m.dims,
                store.path_for(&name).display()
            );
        }
        Commands::List => {
            let names = store.list()?;
            if names.is_empty() {
                println!("No knowledge bases in {}", store.root().display());
            }
            for name in names {
                println!("{}", name);
            }
        }
        Commands::Sources => {
            let kb = open(&store, &kb_name, progress).await?;
            let sources = kb.sources();
            if sources.is_empty() {
                println!("No sources in '{}'.", kb_name);
            } else {
                println!("{:<38}  {:<9}  {:<16}  LOCATION", "ID", "TYPE", "REFRESHED");
                for s in sources {
                    let refreshed = s
                        .refreshed_at
                        .map(format_ts_iso)
                        .unwrap_or_else(|| "never".to_string());
                    let tags = if s.tags.is_empty() {
                        String::new()
                    } else {
                        format!("  [{}]", s.tags.join(", "))
                    };
                    println!(
                        "{:<38}  {:<9}  {:<16}  {}{}",
                        s.id, s.source_type, refreshed, s.location, tags
                    );
                }
            }
        }
        Commands::Add {
            location,
            source_type,
            tags,
        } => {
            let kb = open(&store, &kb_name, progress).await?;
            let source_type = source_type.unwrap_or_else(|| infer_source_type(&location));
            let report = kb
                .add_source(&location, source_type, tags, &interruptible())
                .await?;
            store.save(&kb).await?;
            let r = &report.refresh;
            println!(
                "Added {} source {} ({} documents, {} chunks, {} skipped)",
                report.source.source_type,
                report.source.id,
                r.added,
                r.chunks_written,
                r.skipped.len()
            );
            for skip in &r.skipped {
                println!("  skipped {}: {}", skip.path, skip.reason);
            }
        }
        Commands::Refresh { source } => {
            let kb = open(&store, &kb_name, progress).await?;
            let deadline = interruptible();
            let reports = match source {
                Some(id) => vec![kb.refresh(&id, &deadline).await?],
                None => kb.refresh_all(&deadline).await?,
            };
            store.save(&kb).await?;
            for r in reports {
                println!(
                    "{}: {} added, {} updated, {} removed, {} unchanged, {} skipped",
                    r.source_id,
                    r.added,
                    r.updated,
                    r.removed.len(),
                    r.unchanged,
                    r.skipped.len()
                );
                for skip in &r.skipped {
                    println!("  skipped {}: {}", skip.path, skip.reason);
                }
            }
        }
        Commands::Remove { source } => {
            let kb = open(&store, &kb_name, progress).await?;
            let report = kb.remove_source(&source).await?;
            store.save(&kb).await?;
            println!(
                "Removed source {} ({} documents, {} vectors)",
                report.source_id, report.documents_removed, report.vectors_removed
            );
        }
        Commands::Forget { document } => {
            let kb = open(&store, &kb_name, progress).await?;
            let doc = kb.forget_document(&document).await?;
            store.save(&kb).await?;
            println!("Forgot {} ({})", doc.id, doc.location);
        }
        Commands::Get { document } => {
            let kb = open(&store, &kb_name, progress).await?;
            let doc = kb.document(&document)?;
            let chunks = kb.chunks_of(&doc.id);
            println!("id:           {}", doc.id);
            println!("source:       {} ({})", doc.source_id, doc.source_type);
            println!("location:     {}", doc.location);
            println!("content-type: {}", doc.content_type);
            println!("modified:     {}", format_ts_iso(doc.modified_at));
            println!("ingested:     {}", format_ts_iso(doc.ingested_at));
            println!("hash:         {}", doc.content_hash);
            println!();
            println!("{}", doc.body);
            println!();
            println!("--- {} chunks ---", chunks.len());
            for c in chunks {
                println!("[{}] {}..{} ({} chars)", c.ordinal, c.start, c.end, c.char_count);
            }
        }
        Commands::Query {
            text,
            k,
            min_score,
            source,
            source_type,
            tag,
            prefix,
            also,
            per_kb,
            context,
            json,
        } => {
            let retriever = Retriever::from_config(&cfg.retrieval)?
                .with_min_score(min_score.or(cfg.retrieval.min_score));
            let filter = SearchFilter {
                source_id: source,
                source_type,
                tag,
                location_prefix: prefix,
                ..Default::default()
            };
            let primary = open(&store, &kb_name, progress).await?;
            let mut others = Vec::with_capacity(also.len());
            for name in &also {
                others.push(open(&store, name, progress).await?);
            }
            let deadline = retriever.deadline();
            let results = if others.is_empty() {
                retriever.query(&primary, &text, k, &filter, &deadline).await?
            } else {
                let mut kbs = vec![&primary];
                kbs.extend(others.iter());
                let reconciliation = if per_kb {
                    Reconciliation::PerKnowledgeBase
                } else {
                    Reconciliation::Strict
                };
                retriever
                    .query_across(&kbs, &text, k, &filter, reconciliation, &deadline)
                    .await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if context {
                print!("{}", render_context(&results));
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {}:{}-{}  ({}/{})",
                        i + 1,
                        r.score,
                        r.location,
                        r.start,
                        r.end,
                        r.knowledge_base,
                        r.document_id
                    );
                    let snippet: String = r.text.chars().take(200).collect();
                    println!("    {}", snippet.replace('\n', " "));
                }
            }
        }
        Commands::Stats { json } => {
            let kb = open(&store, &kb_name, progress).await?;
            let stats = KbStats::collect(&kb, Some(&store.path_for(&kb_name)));
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                stats.print();
            }
        }
        Commands::Reindex {
            chunk_size,
            chunk_overlap,
        } => {
            let kb = open(&store, &kb_name, progress).await?;
            let policy = match (chunk_size, chunk_overlap) {
                (None, None) => None,
                (size, overlap) => {
                    let current = kb.policy()?;
                    Some(ChunkingPolicy::new(
                        size.unwrap_or(current.chunk_size()),
                        overlap.unwrap_or(current.overlap()),
                    )?)
                }
            };
            let report = kb.reindex(policy, None, &interruptible()).await?;
            store.save(&kb).await?;
            println!(
                "Re-indexed {} documents into {} chunks",
                report.documents, report.chunks
            );
        }
        Commands::Export { dest } => {
            if dest.exists() {
                bail!("{} already exists", dest.display());
            }
            let manifest = store.export(&kb_name, &dest).await?;
            println!(
                "Exported '{}' ({} sources, {} documents, {} chunks) to {}",
                kb_name,
                manifest.counts.sources,
                manifest.counts.documents,
                manifest.counts.chunks,
                dest.display()
            );
        }
        Commands::Import { archive, rename } => {
            let kb = store.import(&archive, rename.as_deref()).await?;
            println!(
                "Imported '{}' ({} documents, {} chunks)",
                kb.name(),
                kb.documents().len(),
                kb.index().len()
            );
        }
        Commands::Delete { name } => {
            store.delete(&name)?;
            println!("Deleted knowledge base '{}'", name);
        }
    }

    Ok(())
}
