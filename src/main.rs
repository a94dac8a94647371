mod app;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use tiercache::config::Config;
use tiercache::coordinator::CommandReport;
use tiercache::invalidation::{Domain, InvalidationEvent};
use tiercache::logging;

#[derive(Parser, Debug)]
#[command(name = "tiercache")]
#[command(about = "Multi-tier response cache with offline fallbacks")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tiercache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Serve URLs through the interception layer
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Treat the requests as page navigations
    #[arg(long)]
    navigate: bool,
  },
  /// Show entry counts for every tier
  Stats,
  /// Clear every tier
  Clear,
  /// Invalidate cached data after a domain change
  Invalidate {
    /// product, cart, order, user or logout
    domain: Domain,

    /// Entity id, e.g. a product id
    #[arg(long)]
    id: Option<String>,
  },
}

fn print_report(report: &CommandReport) -> Result<()> {
  for step in &report.completed {
    println!("ok     {}", step);
  }
  for (step, error) in &report.failed {
    println!("failed {}: {}", step, error);
  }

  if report.is_complete() {
    Ok(())
  } else {
    Err(eyre!("{} step(s) failed", report.failed.len()))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let app = app::App::new(&config)?;

  let outcome = match args.command {
    Command::Fetch { urls, navigate } => app.fetch(&urls, navigate).await,
    Command::Stats => {
      let stats = app.stats().await;
      print!("{}", stats);
      println!("total      {}", stats.total_entries());
      Ok(())
    }
    Command::Clear => print_report(&app.clear().await),
    Command::Invalidate { domain, id } => {
      print_report(&app.invalidate(&InvalidationEvent::new(domain, id)).await)
    }
  };

  app.shutdown().await;
  outcome
}
