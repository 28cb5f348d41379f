//! Keepsake command line
//!
//! Store operations for scripts and humans, plus the hook entry points an
//! assistant runtime calls on turn completion, prompt submission, and
//! session start.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keepsake_memory::extraction::{DetachedProcessQueue, EXTRACTING_ENV};
use keepsake_memory::{
    Config, ContentType, ExtractionJob, ExtractionPipeline, ExtractionQueue, ListFilter, Lookup,
    MemoryStore, ProjectContext, PromotionEngine, RetrievalBudgeter, Scope, SemanticQuery, SortBy,
    StoreRequest, Tier, WatermarkTracker,
};

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Tiered memory for coding sessions: capture, promote, recall")]
struct Cli {
    /// Settings file (defaults to <data_dir>/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an item; content is read from stdin when omitted
    Store {
        #[arg(long = "type", default_value = "note")]
        item_type: ContentType,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// 0.0 - 1.0; computed by the scorer when omitted
        #[arg(long)]
        importance: Option<f32>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "ephemeral")]
        tier: Tier,
        #[arg(long)]
        scope: Option<Scope>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        content: Option<String>,
    },

    /// Fetch one item by id or name
    Get {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Semantic search
    Search {
        query: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        tier: Option<Tier>,
        #[arg(long = "type")]
        item_type: Option<ContentType>,
    },

    /// List items without counting a retrieval
    List {
        #[arg(long)]
        tier: Option<Tier>,
        #[arg(long = "type")]
        item_type: Option<ContentType>,
        #[arg(long)]
        min_importance: Option<f32>,
        #[arg(long, default_value = "importance")]
        sort: SortBy,
        #[arg(long)]
        limit: Option<usize>,
        /// Include ephemeral copies kept after promotion
        #[arg(long)]
        all: bool,
    },

    /// Delete an item
    Remove {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Required; removal is refused without it
        #[arg(long)]
        yes: bool,
    },

    /// Promote one ephemeral item to the durable tier
    Promote { id: String },

    /// List ephemeral items eligible for promotion
    Scan {
        #[arg(long = "type")]
        item_type: Option<ContentType>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Promote every eligible item
    AutoPromote {
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "type")]
        item_type: Option<ContentType>,
    },

    /// Apply the durable-delete policy to items whose file was removed
    Reconcile,

    /// Run extraction for one session inline (the hook's worker)
    Extract {
        #[arg(long)]
        session: String,
        #[arg(long)]
        transcript: PathBuf,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },

    /// Entry points for the assistant runtime's hooks. Always exit 0.
    Hook {
        #[command(subcommand)]
        event: HookEvent,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum HookEvent {
    /// Turn completed: queue extraction of the unseen transcript
    Stop,
    /// Prompt submitted: print relevant context
    Prompt,
    /// Session started: sweep stale watermarks
    SessionStart,
}

/// JSON the runtime pipes to hook commands; unknown fields are ignored
#[derive(Debug, Default, Deserialize)]
struct HookInput {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    transcript_path: Option<PathBuf>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries command output and injected context; logs go to stderr
    let default_level = if matches!(cli.command, Commands::Hook { .. }) {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Commands::Hook { event } = cli.command {
        if let Err(e) = run_hook(event, cli.config).await {
            warn!(error = %e, "hook failed");
        }
        // Exit without waiting on a model load the prompt deadline abandoned
        let _ = std::io::stdout().flush();
        std::process::exit(0);
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load settings")?;
    run(cli.command, config).await
}

async fn open_store(config: Config) -> anyhow::Result<Arc<MemoryStore>> {
    let store = MemoryStore::new(config)
        .await
        .context("Failed to open memory store")?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lookup<'a>(id: &'a Option<String>, name: &'a Option<String>) -> anyhow::Result<Lookup<'a>> {
    match (id, name) {
        (Some(id), _) => Ok(Lookup::Id(id)),
        (None, Some(name)) => Ok(Lookup::Name(name)),
        (None, None) => bail!("either --id or --name is required"),
    }
}

fn command_output(program: &str, args: &[&str], cwd: &Path) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        None
    } else {
        Some(stdout)
    }
}

/// Working directory plus its git branch, if any
fn project_context(cwd: Option<&str>) -> ProjectContext {
    let dir = cwd
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok());
    let branch = dir.as_deref().and_then(|dir| {
        command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"], dir)
            .filter(|branch| branch != "HEAD")
    });
    ProjectContext {
        project_dir: dir.map(|d| d.to_string_lossy().into_owned()),
        branch,
    }
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Store {
            item_type,
            id,
            name,
            importance,
            tags,
            tier,
            scope,
            cwd,
            content,
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read content from stdin")?;
                    buf
                }
            };

            let project = project_context(cwd.as_deref().and_then(Path::to_str));
            let mut request = StoreRequest::new(item_type, content)
                .with_tags(tags)
                .with_tier(tier)
                .with_project(project);
            if let Some(id) = id {
                request = request.with_id(id);
            }
            if let Some(name) = name {
                request = request.with_name(name);
            }
            if let Some(importance) = importance {
                request = request.with_importance(importance);
            }
            if let Some(scope) = scope {
                request = request.with_scope(scope);
            }

            let store = open_store(config).await?;
            let item = store.store(request).await?;
            print_json(&serde_json::json!({ "id": item.id, "tier": item.tier, "path": item.durable_path }))
        }

        Commands::Get { id, name } => {
            let store = open_store(config).await?;
            let item = store.retrieve(lookup(&id, &name)?)?;
            print_json(&item)
        }

        Commands::Search {
            query,
            limit,
            threshold,
            tier,
            item_type,
        } => {
            let store = open_store(config).await?;
            let mut query = SemanticQuery::new(query, limit);
            query.threshold = threshold;
            query.tier = tier;
            query.item_type = item_type;

            let results = store.search(&query).await?;
            let rows: Vec<_> = results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "similarity": r.similarity,
                        "rank": r.rank,
                        "item": r.item,
                    })
                })
                .collect();
            print_json(&rows)
        }

        Commands::List {
            tier,
            item_type,
            min_importance,
            sort,
            limit,
            all,
        } => {
            let store = open_store(config).await?;
            let items = store.list(&ListFilter {
                tier,
                item_type,
                min_importance,
                project_dir: None,
                sort_by: sort,
                limit,
                include_promoted: all,
            })?;
            print_json(&items)
        }

        Commands::Remove { id, name, yes } => {
            let store = open_store(config).await?;
            let item = store.remove(lookup(&id, &name)?, yes).await?;
            print_json(&serde_json::json!({ "removed": item.id }))
        }

        Commands::Promote { id } => {
            let store = open_store(config).await?;
            let outcome = PromotionEngine::new(store).promote(&id).await?;
            print_json(&outcome)
        }

        Commands::Scan { item_type, limit } => {
            let store = open_store(config).await?;
            let candidates = PromotionEngine::new(store).scan(&ListFilter {
                item_type,
                limit,
                ..Default::default()
            })?;
            print_json(&candidates)
        }

        Commands::AutoPromote { dry_run, item_type } => {
            let store = open_store(config).await?;
            let report = PromotionEngine::new(store)
                .auto_promote(
                    &ListFilter {
                        item_type,
                        ..Default::default()
                    },
                    dry_run,
                )
                .await?;
            print_json(&report)
        }

        Commands::Reconcile => {
            let store = open_store(config).await?;
            let report = PromotionEngine::new(store).reconcile().await?;
            print_json(&report)
        }

        Commands::Extract {
            session,
            transcript,
            cwd,
            branch,
        } => {
            let store = open_store(config).await?;
            let pipeline = ExtractionPipeline::from_config(store);
            let job = ExtractionJob {
                session_id: session,
                transcript_path: transcript,
                project: ProjectContext {
                    project_dir: cwd,
                    branch,
                },
            };
            let report = pipeline.run(&job).await?;
            print_json(&report)
        }

        Commands::Hook { .. } => Ok(()),
    }
}

fn read_hook_input() -> anyhow::Result<HookInput> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(HookInput::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

async fn run_hook(event: HookEvent, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref())?;

    match event {
        HookEvent::Stop => {
            // Fired from inside a summarizer child: extracting again would
            // summarize the summarizer.
            if std::env::var_os(EXTRACTING_ENV).is_some() {
                debug!("skipping extraction inside an extraction child");
                return Ok(());
            }
            if !config.extraction.enabled {
                return Ok(());
            }

            let input = read_hook_input()?;
            let (Some(session_id), Some(transcript_path)) = (input.session_id, input.transcript_path)
            else {
                bail!("stop hook input lacks session_id or transcript_path");
            };

            let job = ExtractionJob {
                session_id,
                transcript_path,
                project: project_context(input.cwd.as_deref()),
            };
            DetachedProcessQueue::current_exe(config_path)?.submit(job)?;
        }

        HookEvent::Prompt => {
            let input = read_hook_input()?;
            let Some(prompt) = input.prompt else {
                return Ok(());
            };
            let block = RetrievalBudgeter::open_and_build(config, &prompt, input.cwd.as_deref()).await;
            if !block.is_empty() {
                print!("{}", block);
            }
        }

        HookEvent::SessionStart => {
            let tracker = WatermarkTracker::new(&config);
            let removed = tracker.sweep_stale(chrono::Duration::days(config.watermark_stale_days))?;
            debug!(removed, "session start housekeeping done");
        }
    }

    Ok(())
}
