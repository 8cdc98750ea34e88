use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use podshelf::codec::{FeedUrl, PlayState};
use podshelf::config::Config;
use podshelf::library::Library;
use podshelf::sync::{HttpRemote, SyncError};

#[derive(Parser, Debug)]
#[command(name = "podshelf", about = "Podcast library with OPML and account sync")]
struct Args {
    /// Config file (default: ~/.config/podshelf/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Subscribe {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Unsubscribe from a feed (removed remotely on the next sync)
    Unsubscribe { url: String },
    /// List subscriptions
    List {
        /// Include unsubscribed podcasts not yet synced
        #[arg(long)]
        all: bool,
    },
    /// List the episodes of a podcast
    Episodes { url: String },
    /// Import subscriptions from an OPML file
    Import { file: PathBuf },
    /// Export subscriptions to an OPML file, or stdout
    Export { file: Option<PathBuf> },
    /// Run one sync cycle
    Sync,
    /// List queued downloads
    Downloads,
    /// Forget the sync cursor so the next sync exchanges everything
    Resync,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path.or_else(Config::default_path) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from '{}'", path.display())),
        None => Ok(Config::default()),
    }
}

fn parse_url(url: &str) -> Result<FeedUrl> {
    FeedUrl::parse(url).with_context(|| format!("Invalid feed URL '{url}'"))
}

fn play_marker(state: PlayState) -> &'static str {
    match state {
        PlayState::New => "*",
        PlayState::InProgress => "~",
        PlayState::Played => " ",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config)?;
    let library = Library::open(&config)
        .await
        .with_context(|| format!("Failed to open library '{}'", config.database_path().display()))?;

    let result = run(&library, &config, args.command).await;
    library.close().await;
    result
}

async fn run(library: &Library, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Subscribe { url, title } => {
            let podcast = library.subscribe(&url, title.as_deref()).await?;
            println!("Subscribed to {} ({})", podcast.title(), podcast.url());
        }
        Command::Unsubscribe { url } => {
            let url = parse_url(&url)?;
            if library.unsubscribe(&url).await? {
                println!("Unsubscribed from {url}");
            } else {
                println!("Not subscribed to {url}");
            }
        }
        Command::List { all } => {
            for podcast in library.podcasts(all).await? {
                let marker = if podcast.is_tombstoned() { "x" } else { " " };
                println!("{marker} {}  {}", podcast.title(), podcast.url());
            }
        }
        Command::Episodes { url } => {
            let url = parse_url(&url)?;
            if library.podcast(&url).await?.is_none() {
                anyhow::bail!("Not subscribed to {url}");
            }
            for episode in library.episodes(&url).await? {
                let date = episode
                    .published()
                    .map(|ts| ts.to_datetime().format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "----------".to_string());
                println!(
                    "{} {date}  {}  [{}]",
                    play_marker(episode.play_state()),
                    episode.title(),
                    episode.download_state()
                );
            }
        }
        Command::Import { file } => {
            let report = library
                .import_opml_file(&file)
                .await
                .with_context(|| format!("Failed to import '{}'", file.display()))?;
            println!(
                "Imported {} feeds ({} already subscribed)",
                report.imported.len(),
                report.already_subscribed.len()
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
        }
        Command::Export { file: Some(file) } => {
            let count = library
                .export_opml_to_file(&file)
                .await
                .with_context(|| format!("Failed to export to '{}'", file.display()))?;
            println!("Exported {count} feeds to {}", file.display());
        }
        Command::Export { file: None } => {
            print!("{}", library.export_opml().await?);
        }
        Command::Sync => {
            let remote = HttpRemote::from_config(&config.sync)?;
            let client = library.sync_client(Arc::new(remote));

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            match client.sync(&cancel).await {
                Ok(report) => {
                    println!(
                        "Sync complete: pulled {} subscription changes and {} episode actions, pushed {} and {}",
                        report.pulled_subscriptions,
                        report.pulled_actions,
                        report.pushed_subscriptions,
                        report.pushed_actions
                    );
                    for path in &report.removed_files {
                        match tokio::fs::remove_file(path).await {
                            Ok(()) => println!("Removed {}", path.display()),
                            Err(e) => eprintln!("warning: could not remove {}: {e}", path.display()),
                        }
                    }
                }
                Err(SyncError::Cancelled) => println!("Sync cancelled"),
                Err(e) => return Err(e).context("Sync failed"),
            }
        }
        Command::Downloads => {
            for request in library.pending_downloads().await? {
                println!("{}\n  {}\n  -> {}", request.episode, request.url, request.destination.display());
            }
        }
        Command::Resync => {
            library.full_resync().await?;
            println!("The next sync will exchange the full history");
        }
    }
    Ok(())
}
