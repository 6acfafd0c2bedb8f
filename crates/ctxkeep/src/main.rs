//! Inspect and edit a context store snapshot from the command line.
//!
//! Each invocation restores `<dir>/<agent>_context.json`, runs one command,
//! and saves the snapshot back if the command changed anything.
//!
//! # Examples
//!
//! ```sh
//! # Store a memory with tags
//! ctxkeep --agent reviewer add "User prefers terse answers" --type memory --priority 6 --tag prefs
//!
//! # Render the window for a 4k budget
//! ctxkeep --agent reviewer window --max-tokens 4000
//!
//! # Shrink to 2000 tokens keeping the most recent items
//! ctxkeep --agent reviewer optimize --strategy recency_based --target 2000
//!
//! # Budget analysis as JSON
//! ctxkeep --agent reviewer report
//! ```

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use ctxkeep::config::CtxConfig;
use ctxkeep::context::{
    ContextStore, ItemType, NewItem, OptimizationStrategy, SnapshotStore, snapshot_schema,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Token-budgeted context store.
#[derive(Parser)]
#[command(name = "ctxkeep")]
struct Cli {
    /// Directory holding snapshot files
    #[arg(long, global = true, default_value = ".ctxkeep")]
    dir: PathBuf,

    /// Owner whose store to operate on
    #[arg(long, global = true, default_value = "default")]
    agent: String,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add an item and print its id
    Add {
        content: String,
        #[arg(long = "type", default_value = "general")]
        item_type: String,
        #[arg(long, default_value_t = 1)]
        priority: u8,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Expire the item after this many seconds
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
    /// Print one item as JSON
    Get { id: String },
    /// Remove an item
    Remove { id: String },
    /// Case-insensitive content search
    Search {
        query: String,
        #[arg(long = "type")]
        item_type: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Render the context window
    Window {
        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Evict items down to a target
    Optimize {
        #[arg(long, default_value = "hybrid")]
        strategy: String,
        #[arg(long)]
        target: Option<usize>,
    },
    /// Drop expired items
    Purge,
    /// Print store statistics
    Stats,
    /// Print a budget analysis
    Report,
    /// Print the JSON Schema of snapshot files
    Schema,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn expiry_after(secs: i64) -> Result<chrono::DateTime<chrono::Utc>, String> {
    chrono::TimeDelta::try_seconds(secs)
        .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| format!("--ttl-secs {secs} is out of range"))
}

fn print_json(value: &impl Serialize) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    if let Command::Schema = cli.command {
        return print_json(&snapshot_schema());
    }

    let config = match &cli.config {
        Some(path) => CtxConfig::load(path).map_err(|e| e.to_string())?,
        None => CtxConfig::default(),
    };
    let snapshots = SnapshotStore::new(&cli.dir).map_err(|e| e.to_string())?;
    let mut store = ContextStore::from_config(&cli.agent, &config);
    if !store.restore(&snapshots) {
        return Err(format!(
            "snapshot for '{}' in {} is unreadable",
            cli.agent,
            cli.dir.display()
        ));
    }

    let changed = match cli.command {
        Command::Add {
            content,
            item_type,
            priority,
            tags,
            ttl_secs,
        } => {
            let mut opts = NewItem::new(item_type)
                .with_priority(priority)
                .with_tags(tags);
            if let Some(secs) = ttl_secs {
                opts = opts.with_expiry(expiry_after(secs)?);
            }
            let id = store.add(content, opts).map_err(|e| e.to_string())?;
            println!("{id}");
            true
        }
        Command::Get { id } => {
            let item = store.get(&id).ok_or_else(|| format!("no live item '{id}'"))?;
            print_json(item)?;
            false
        }
        Command::Remove { id } => {
            store
                .remove(&id)
                .ok_or_else(|| format!("no item '{id}'"))?;
            true
        }
        Command::Search {
            query,
            item_type,
            tags,
        } => {
            let item_type = item_type.map(ItemType::from);
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            print_json(&store.search(&query, item_type.as_ref(), &tags))?;
            false
        }
        Command::Window { max_tokens } => {
            println!("{}", store.get_window(max_tokens));
            false
        }
        Command::Optimize { strategy, target } => {
            let strategy: OptimizationStrategy = strategy.parse().map_err(|e| format!("{e}"))?;
            let metrics = store.optimize(target, strategy);
            println!("{}", metrics.to_log_string());
            metrics.strategy.is_some()
        }
        Command::Purge => {
            let removed = store.purge_expired();
            println!("purged {removed} expired item(s)");
            removed > 0
        }
        Command::Stats => {
            print_json(store.stats())?;
            false
        }
        Command::Report => {
            print_json(&store.report())?;
            false
        }
        Command::Schema => false,
    };

    if changed {
        store.save(&snapshots).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_in_range() {
        let expiry = expiry_after(60).unwrap();
        assert!(expiry > chrono::Utc::now());
    }

    #[test]
    fn expiry_out_of_range_is_error() {
        assert!(expiry_after(i64::MAX).is_err());
        assert!(expiry_after(i64::MIN).is_err());
    }
}
