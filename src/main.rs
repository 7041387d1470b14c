//! # convograph CLI (`cgx`)
//!
//! Runs the conversation pipeline and queries its stores.
//!
//! ## Usage
//!
//! ```bash
//! cgx --config ./config/cgx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cgx init` | Create the graph and vector store schemas |
//! | `cgx run` | Run the whole pipeline (optionally `--from <stage>`) |
//! | `cgx stage <name>` | Run one stage against explicit paths |
//! | `cgx audit [entity]` | Compare identifier sets across the two stores |
//! | `cgx search "<query>"` | Nearest chunks, expanded through the graph |
//! | `cgx filter --tag/--domain/--cluster` | Graph-first paged listing |
//! | `cgx status` | Manifest sizes and store counts |
//!
//! Exit code is non-zero when a stage fails fatally, or when `audit
//! --strict` finds drift.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};

use convograph::audit::AuditEntity;
use convograph::config::{self, Config};
use convograph::context::PipelineContext;
use convograph::graph::NodeLabel;
use convograph::manifest::read_entries;
use convograph::pipeline::{
    Pipeline, PipelineReport, RunOptions, Stage, StageIo, StageReport, StageState,
};
use convograph::progress::ProgressMode;
use convograph::retrieval::{ChunkView, Filter};
use convograph::vector;

/// convograph: incremental conversation pipeline into a graph store and a
/// vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cgx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cgx",
    about = "convograph: conversation exports into a graph store and a vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cgx.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress on stderr: off, human or json. Defaults to human on a TTY.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schemas. Safe to run repeatedly.
    Init,

    /// Run the pipeline: extract, chunk, enrich, embed, cluster, position, load.
    Run {
        /// Ignore manifests and reprocess everything.
        #[arg(long)]
        force: bool,

        /// Start at this stage; earlier stages are not run.
        #[arg(long, value_parser = parse_stage)]
        from: Option<Stage>,

        /// Enrichment worker count.
        #[arg(long)]
        workers: Option<usize>,

        /// Minimum delay between inference calls, in milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Run a single stage against explicit paths.
    ///
    /// `--input` is the export file for `extract` and the artifacts
    /// directory for every other stage; `--output` is a directory.
    Stage {
        #[arg(value_parser = parse_stage)]
        name: Stage,

        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Compare entity ids across the graph store and the vector index.
    Audit {
        /// `chunk` or `cluster`; all entities when omitted.
        entity: Option<String>,

        /// Exit non-zero when any drift is found.
        #[arg(long)]
        strict: bool,
    },

    /// Semantic search over chunks.
    Search {
        query: String,

        /// Number of results (0 = configured default, max 500).
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// List chunks by tag, domain or cluster. Exactly one is required.
    #[command(group(
        ArgGroup::new("criterion")
            .required(true)
            .args(["tag", "domain", "cluster"])
    ))]
    Filter {
        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        cluster: Option<i64>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        /// Page size (0 = configured default, max 500).
        #[arg(long, default_value_t = 0)]
        page_size: usize,
    },

    /// Manifest sizes and store counts.
    Status,
}

fn parse_stage(s: &str) -> Result<Stage, String> {
    Stage::parse(s).ok_or_else(|| {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown stage '{}'. Available: {}", s, names.join(", "))
    })
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "convograph=debug" } else { "convograph=info" };
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.is_empty() => tracing_subscriber::EnvFilter::new(value),
        _ => tracing_subscriber::EnvFilter::new(default),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => match ProgressMode::parse(s) {
            Some(mode) => Ok(mode),
            None => bail!("Unknown progress mode: '{}'. Must be off, human, or json.", s),
        },
    }
}

fn print_stage(report: &StageReport) {
    println!(
        "  {:<9} {:<10} written: {}  skipped: {}  fallback: {}  failed: {}",
        report.stage.as_str(),
        report.state.as_str(),
        report.written,
        report.skipped,
        report.fallback,
        report.failed
    );
    if let Some(error) = &report.error {
        println!("    error: {}", error);
    }
}

fn print_run(report: &PipelineReport) {
    println!("run");
    for stage in &report.stages {
        print_stage(stage);
    }
}

fn print_chunk(rank: usize, score: Option<f32>, view: &ChunkView) {
    let title = view
        .conversation
        .as_ref()
        .and_then(|c| c.title.as_deref())
        .unwrap_or("(untitled)");
    match score {
        Some(score) => println!("{}. [{:.2}] {}", rank, score, title),
        None => println!("{}. {}", rank, title),
    }
    if let Some(domain) = &view.domain {
        println!("    domain: {}", domain);
    }
    if !view.tags.is_empty() {
        println!("    tags: {}", view.tags.join(" "));
    }
    if let Some(cluster) = &view.cluster {
        println!("    cluster: {} ({})", cluster.id, cluster.top_terms.join(", "));
    }
    let excerpt: String = view.text.replace('\n', " ").chars().take(160).collect();
    println!("    excerpt: \"{}\"", excerpt.trim());
    println!("    id: {}", view.id);
    println!();
}

async fn status(ctx: &PipelineContext) -> anyhow::Result<()> {
    println!("manifests");
    for stage in Stage::ALL {
        let path = ctx.config.paths.manifest_for(stage.as_str());
        let entries = read_entries(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        println!("  {}: {}", stage.as_str(), entries.len());
    }
    println!("graph ({})", ctx.graph.name());
    for label in NodeLabel::ALL {
        println!("  {}: {}", label.as_str(), ctx.graph.count_nodes(label).await?);
    }
    println!("vectors ({})", ctx.vectors.name());
    for collection in [vector::CHUNKS, vector::CLUSTERS] {
        println!("  {}: {}", collection, ctx.vectors.count(collection).await?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg: Config = config::load_config(&cli.config)?;
    let progress = progress_mode(cli.progress.as_deref())?;
    let ctx = PipelineContext::from_config(cfg)
        .await
        .context("Failed to open stores")?
        .with_progress(progress.reporter());

    match cli.command {
        Commands::Init => {
            println!("Stores initialized.");
            println!("  graph: {}", ctx.graph.name());
            println!("  vectors: {}", ctx.vectors.name());
        }
        Commands::Run {
            force,
            from,
            workers,
            delay_ms,
        } => {
            let opts = RunOptions {
                force,
                from,
                workers,
                delay_ms,
            };
            let report = Pipeline::new(ctx).run(&opts).await;
            print_run(&report);
            if let Some(failed) = report.failed() {
                bail!(
                    "stage '{}' failed: {}",
                    failed.stage,
                    failed.error.as_deref().unwrap_or("unknown error")
                );
            }
            println!("ok");
        }
        Commands::Stage {
            name,
            input,
            output,
            manifest,
            force,
            workers,
            delay_ms,
        } => {
            let io = StageIo {
                input,
                output,
                manifest,
            };
            let opts = RunOptions {
                force,
                from: None,
                workers,
                delay_ms,
            };
            let report = Pipeline::new(ctx).run_stage(name, &io, &opts).await;
            println!("stage {}", name);
            print_stage(&report);
            if report.state == StageState::Failed {
                bail!(
                    "stage '{}' failed: {}",
                    name,
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Audit { entity, strict } => {
            let auditor = ctx.auditor();
            let reports = match entity {
                Some(name) => {
                    let Some(entity) = AuditEntity::parse(&name) else {
                        bail!("Unknown audit entity: '{}'. Must be chunk or cluster.", name);
                    };
                    vec![auditor.audit(entity).await?]
                }
                None => auditor.audit_all().await?,
            };
            let mut drift = 0;
            for report in &reports {
                println!("audit {}", report.entity);
                println!("  both: {}", report.intersection);
                println!("  only in graph: {}", report.only_in_graph);
                println!("  only in vectors: {}", report.only_in_vector);
                for id in &report.sample_only_in_graph {
                    println!("    graph-only: {}", id);
                }
                for id in &report.sample_only_in_vector {
                    println!("    vector-only: {}", id);
                }
                drift += report.drift();
            }
            if strict && drift > 0 {
                bail!("consistency drift: {} ids differ between stores", drift);
            }
        }
        Commands::Search { query, limit } => {
            let hits = ctx.retrieval().similar(&query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                print_chunk(i + 1, Some(hit.score), &hit.chunk);
            }
        }
        Commands::Filter {
            tag,
            domain,
            cluster,
            page,
            page_size,
        } => {
            let filter = match (tag, domain, cluster) {
                (Some(tag), _, _) => Filter::Tag(tag),
                (_, Some(domain), _) => Filter::Domain(domain),
                (_, _, Some(cluster)) => Filter::Cluster(cluster),
                _ => bail!("One of --tag, --domain or --cluster is required"),
            };
            let result = ctx.retrieval().filter(&filter, page, page_size).await?;
            println!(
                "page {} ({} per page), {} total",
                result.page, result.page_size, result.total
            );
            if result.items.is_empty() {
                println!("No results.");
            }
            let offset = (result.page - 1) * result.page_size;
            for (i, view) in result.items.iter().enumerate() {
                print_chunk(offset + i + 1, None, view);
            }
        }
        Commands::Status => status(&ctx).await?,
    }

    Ok(())
}
