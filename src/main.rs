mod api;
mod app;
mod cache;
mod categories;
mod clock;
mod config;
mod domain;
mod event;
mod logging;
mod queue;
mod storage;
mod sync;

use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::Result;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

use crate::api::CategoryDraft;
use crate::cache::Tag;
use crate::categories::{CategoryFilter, MutationOutcome};
use crate::domain::{EntityId, EstablishmentId};

#[derive(Parser, Debug)]
#[command(name = "mesa")]
#[command(about = "Offline-first category cache and sync agent for the establishment console")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mesa/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the sync agent until interrupted
  Run,
  /// Read and change categories
  #[command(subcommand)]
  Categories(CategoryCommand),
  /// Inspect the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay queued changes once
  Sync {
    /// Only this establishment (default: every establishment with queued work)
    #[arg(short, long)]
    establishment: Option<EstablishmentId>,
  },
  /// Inspect or reset the local cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(ClapArgs, Debug)]
struct Scope {
  #[arg(short, long)]
  establishment: EstablishmentId,
}

#[derive(ClapArgs, Debug)]
struct DraftArgs {
  #[arg(long)]
  name: Option<String>,
  #[arg(long)]
  description: Option<String>,
  #[arg(long)]
  active: Option<bool>,
}

impl From<DraftArgs> for CategoryDraft {
  fn from(args: DraftArgs) -> Self {
    CategoryDraft {
      name: args.name,
      description: args.description,
      active: args.active,
    }
  }
}

#[derive(Subcommand, Debug)]
enum CategoryCommand {
  List {
    #[command(flatten)]
    scope: Scope,
    /// Only active (true) or inactive (false) categories
    #[arg(long)]
    active: Option<bool>,
    /// Case-insensitive name filter
    #[arg(long)]
    name: Option<String>,
  },
  Get {
    #[command(flatten)]
    scope: Scope,
    id: EntityId,
  },
  Stats {
    #[command(flatten)]
    scope: Scope,
  },
  Create {
    #[command(flatten)]
    scope: Scope,
    #[command(flatten)]
    draft: DraftArgs,
  },
  Update {
    #[command(flatten)]
    scope: Scope,
    id: EntityId,
    #[command(flatten)]
    draft: DraftArgs,
  },
  Delete {
    #[command(flatten)]
    scope: Scope,
    id: EntityId,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show pending operations
  List {
    #[arg(short, long)]
    establishment: Option<EstablishmentId>,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Stats,
  Clear,
  /// Drop entries by establishment, tag or key pattern
  Invalidate {
    #[arg(short, long)]
    establishment: Option<EstablishmentId>,
    #[arg(short, long)]
    tag: Vec<String>,
    /// Regular expression matched against rendered keys
    #[arg(short, long)]
    pattern: Option<Regex>,
  },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_outcome<T: Serialize>(outcome: MutationOutcome<T>) -> Result<()> {
  match outcome {
    MutationOutcome::Applied(value) => print_json(&value),
    MutationOutcome::Queued {
      operation_id,
      optimistic,
    } => {
      eprintln!(
        "Backend unreachable; change queued as {} and will sync when back online.",
        operation_id
      );
      print_json(&optimistic)
    }
  }
}

async fn run_categories(app: &app::App, command: CategoryCommand) -> Result<()> {
  let categories = app.categories();
  match command {
    CategoryCommand::List {
      scope,
      active,
      name,
    } => {
      let filter = CategoryFilter {
        active,
        name_contains: name,
      };
      let found = if filter == CategoryFilter::default() {
        categories.list(scope.establishment).await?
      } else {
        categories.search(scope.establishment, &filter).await?
      };
      print_json(&found)
    }
    CategoryCommand::Get { scope, id } => print_json(&categories.get(scope.establishment, id).await?),
    CategoryCommand::Stats { scope } => print_json(&categories.stats(scope.establishment).await?),
    CategoryCommand::Create { scope, draft } => {
      print_outcome(categories.create(scope.establishment, &draft.into()).await?)
    }
    CategoryCommand::Update { scope, id, draft } => {
      print_outcome(categories.update(scope.establishment, id, &draft.into()).await?)
    }
    CategoryCommand::Delete { scope, id } => {
      print_outcome(categories.delete(scope.establishment, id).await?)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Run => app.run().await?,
    Command::Categories(command) => {
      run_categories(&app, command).await?;
      // One-shot invocations share a warm cache through the snapshot
      app.persist_cache()?;
    }
    Command::Queue(QueueCommand::List { establishment }) => {
      let establishments = match establishment {
        Some(id) => vec![id],
        None => app.queue().establishments()?,
      };
      let mut pending = Vec::new();
      for id in establishments {
        pending.extend(app.queue().pending(id)?);
      }
      print_json(&pending)?;
    }
    Command::Sync { establishment } => {
      let reports = match establishment {
        Some(id) => vec![app.synchronizer().drain(id).await?],
        None => app.synchronizer().drain_all().await?,
      };
      app.persist_cache()?;
      if reports.iter().all(|r| r.is_empty()) {
        eprintln!("Nothing to sync.");
      }
      print_json(&reports)?;
    }
    Command::Cache(CacheCommand::Stats) => print_json(&app.cache().stats())?,
    Command::Cache(CacheCommand::Clear) => {
      app.cache().clear();
      app.persist_cache()?;
    }
    Command::Cache(CacheCommand::Invalidate {
      establishment,
      tag,
      pattern,
    }) => {
      let cache = app.cache();
      let mut removed = 0;
      if let Some(id) = establishment {
        removed += cache.invalidate_establishment(id);
      }
      if !tag.is_empty() {
        let tags: Vec<Tag> = tag.into_iter().map(Tag::new).collect();
        removed += cache.invalidate_by_tags(&tags);
      }
      if let Some(pattern) = pattern {
        removed += cache.invalidate_by_pattern(&pattern);
      }
      app.persist_cache()?;
      println!("{} entries removed", removed);
    }
  }

  Ok(())
}
