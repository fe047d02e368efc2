//! Haystack CLI - mirror git repositories and search their contents

use clap::{Parser, Subcommand};
use haystack::config::{self, HaystackConfig};
use haystack::ui::{self, Icons};
use haystack::{CancellationToken, Error, IngestOutcome, Pile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "haystack")]
#[command(version)]
#[command(about = "Mirror git repositories into SQLite and search their contents")]
#[command(long_about = r#"
Haystack clones repositories, stores the files of their head commit and
answers case-insensitive substring queries across everything indexed.
Re-adding a repository only rewrites it when its head commit changed.

Example usage:
  haystack --connection pile.db add-repo https://github.com/mergestat/mergestat
  haystack --connection pile.db list-repos
  haystack --connection pile.db search-repos "todo"
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database path or URI (default: in-memory)
    #[arg(long, global = true)]
    connection: Option<String>,

    /// Directory that receives temporary clones
    #[arg(long, global = true)]
    clone_dir: Option<PathBuf>,

    /// Maximum number of database connections
    #[arg(long, global = true)]
    pool_size: Option<u32>,

    /// Config file (default: ./haystack.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone repositories and index their head commit
    AddRepo {
        /// Repository URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Cancel indexing after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List indexed repositories
    ListRepos,

    /// Find files whose content contains a string (case-insensitive)
    SearchRepos {
        /// Text to look for
        query: String,
    },

    /// Show statistics about the pile
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let flags = HaystackConfig {
        connection: cli.connection.clone(),
        clone_dir: cli.clone_dir.clone(),
        pool_size: cli.pool_size,
    };
    let file_config = config::load_config(cli.config.as_deref())?.unwrap_or_default();
    let settings = flags.or(file_config);

    let pile = Arc::new(Pile::open(settings.to_options())?);
    let result = run(cli.command, Arc::clone(&pile), cli.json).await;

    match Arc::try_unwrap(pile) {
        Ok(pile) => pile.close()?,
        Err(_) => tracing::warn!("Pile still in use at exit, skipping close"),
    }

    result
}

async fn run(command: Commands, pile: Arc<Pile>, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::AddRepo { urls, timeout } => {
            let cancel = CancellationToken::new();
            watch_for_cancel(&cancel, timeout.map(Duration::from_secs));

            if !json {
                ui::header(&format!("Indexing {} repositories", urls.len()));
                ui::info("Clone directory", &pile.clone_dir().display().to_string());
            }

            let mut outcomes = Vec::new();
            for url in urls {
                let started = Instant::now();
                let spinner = ui::Spinner::new(&format!("Indexing {}", url));

                let task_pile = Arc::clone(&pile);
                let task_cancel = cancel.clone();
                let task_url = url.clone();
                let result =
                    tokio::task::spawn_blocking(move || task_pile.add_repo(&task_url, &task_cancel))
                        .await?;
                spinner.finish_and_clear();

                match result {
                    Ok(outcome) => {
                        if !json {
                            report_outcome(&url, &outcome, started.elapsed());
                        }
                        outcomes.push(serde_json::json!({ "url": url, "outcome": outcome }));
                    }
                    Err(Error::Cancelled) => {
                        ui::warn(&format!(
                            "Indexing of {} was cancelled; nothing was written",
                            url
                        ));
                        return Err(Error::Cancelled.into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            }
        }

        Commands::ListRepos => {
            let repos = pile.list_repos()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&repos)?);
            } else {
                for repo in repos {
                    println!("{}", repo);
                }
            }
        }

        Commands::SearchRepos { query } => {
            let hits = pile.search_all_repo_contents(&query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in hits {
                    println!("{}\t{}", hit.repo_url, hit.path);
                }
            }
        }

        Commands::Stats => {
            let stats = pile.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let repos = stats.repos.to_string();
                let files = stats.files.to_string();
                ui::header(&format!("{} Haystack Statistics", Icons::STATS));
                println!(
                    "{}",
                    ui::stats_table(&[("Repositories", repos.as_str()), ("Files", files.as_str())])
                );
            }
        }
    }

    Ok(())
}

/// Cancel on Ctrl-C, and after `timeout` when one is given
fn watch_for_cancel(cancel: &CancellationToken, timeout: Option<Duration>) {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    if let Some(timeout) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!("Timed out after {:?}, cancelling", timeout);
            on_timeout.cancel();
        });
    }
}

fn report_outcome(url: &str, outcome: &IngestOutcome, elapsed: Duration) {
    match outcome {
        IngestOutcome::Indexed { commit, files } => {
            ui::success(&format!("Indexed {}", url));
            ui::summary_row(Icons::PACKAGE, commit);
            ui::summary_row(Icons::FILE, &format!("{} files", files));
            ui::summary_row(Icons::CLOCK, &format!("{:.2?}", elapsed));
        }
        IngestOutcome::Unchanged { commit } => {
            ui::skipped(&format!("{} unchanged at {}", url, commit));
        }
    }
}
