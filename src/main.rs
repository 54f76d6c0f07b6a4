use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quotaward::clock::SystemClock;
use quotaward::config::QuotawardConfig;
use quotaward::identity::redact;
use quotaward::ratelimit::RequestCategory;
use quotaward::state::Preference;
use quotaward::Governor;

/// Inspect and manage Quotaward rate limiting state.
#[derive(Parser, Debug)]
#[command(name = "quotaward", version, about)]
struct Cli {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long, env = "QUOTAWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show window occupancy and monthly usage
    Status,
    /// Sample the pacing delay the next request of a category would get
    Pace {
        /// search, lookup or post
        category: RequestCategory,
    },
    /// Opt a user out
    OptOut { identity: String },
    /// Opt a user back in
    OptIn { identity: String },
    /// Show a user's recorded preference
    Check { identity: String },
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "quotaward=debug" } else { "quotaward=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let config = QuotawardConfig::load(cli.config.as_deref())?;
    info!(
        snapshot = %config.state.snapshot_path.display(),
        preferences = %config.state.preferences_path.display(),
        "Configuration loaded"
    );

    let mut governor = Governor::open(&config, Arc::new(SystemClock));

    match cli.command {
        Command::Status => print_status(&mut governor),
        Command::Pace { category } => {
            let ratio = governor.usage_ratio(category);
            let delay = governor.pacing_delay(category);
            println!(
                "{}: usage {:.1}%, pacing delay {:.1}s",
                category,
                ratio * 100.0,
                delay.as_secs_f64()
            );
        }
        Command::OptOut { identity } => {
            set_preference(&mut governor, &identity, Preference::OptOut)?
        }
        Command::OptIn { identity } => set_preference(&mut governor, &identity, Preference::OptIn)?,
        Command::Check { identity } => match governor.preference(&identity) {
            Some(preference) => println!("{} is {}", redact(&identity), preference),
            None => println!("{} has no recorded preference", redact(&identity)),
        },
    }

    Ok(())
}

fn print_status(governor: &mut Governor) {
    println!("State: {:?}", governor.load_outcome());
    println!("Last check: {}", governor.last_check_time().to_rfc3339());

    let usage = governor.usage();
    println!(
        "Month starting {}: {}/{} reads, {}/{} posts",
        usage.period_anchor().format("%Y-%m"),
        usage.reads(),
        governor.budget().monthly_read_cap,
        usage.posts(),
        governor.budget().monthly_post_cap
    );

    for status in governor.status() {
        println!(
            "{:<8} {:>4}/{:<4} {:>6.1}% {:<9} next slot in {:.0}s",
            status.category.as_str(),
            status.used,
            status.limit,
            status.ratio * 100.0,
            status.level.to_string(),
            status.seconds_until_capacity
        );
    }

    println!(
        "Preferences: {} opted out, {} opted in",
        governor.preferences().opted_out_count(),
        governor.preferences().opted_in_count()
    );
}

fn set_preference(
    governor: &mut Governor,
    identity: &str,
    preference: Preference,
) -> anyhow::Result<()> {
    if !governor.set_preference(identity, preference) {
        anyhow::bail!("failed to persist preference for {}", redact(identity));
    }
    println!("{} is now {}", redact(identity), preference);
    Ok(())
}
