use aspire_cache::api::{JsonApi, JsonApiClient, LinkedDataClient};
use aspire_cache::builder::Builder;
use aspire_cache::cache::CacheStore;
use aspire_cache::config::Config;
use aspire_cache::logging;
use aspire_cache::report::{ListFilter, ListReport};
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "aspire-cache")]
#[command(about = "Mirror Aspire reading lists into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/aspire-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write the log to this file
  #[arg(short = 'f', long)]
  log_file: Option<PathBuf>,

  /// More logging (-v debug, -vv trace)
  #[arg(short, long, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache one list, or every list in the report that matches the filters
  Build {
    /// URL of a single list to cache
    #[arg(short, long)]
    list: Option<String>,

    #[command(flatten)]
    report: ReportArgs,

    /// Empty the cache first
    #[arg(short = 'c', long)]
    clear: bool,
  },
  /// Reload lists left in progress by an interrupted build, then build
  Resume {
    #[command(flatten)]
    report: ReportArgs,
  },
  /// Remove an object from the cache
  Remove {
    url: String,

    /// Remove even if the object is marked in progress
    #[arg(long)]
    force: bool,

    /// Also remove the object's children
    #[arg(long)]
    children: bool,
  },
  /// List objects marked in progress
  Marked {
    /// Object types to search (default: all)
    types: Vec<String>,
  },
  /// Empty the cache
  Clear,
}

#[derive(clap::Args, Debug)]
struct ReportArgs {
  /// "All Lists" report CSV (default: report.path from the config)
  #[arg(short, long)]
  report: Option<PathBuf>,

  /// Time periods to include; blank periods only if omitted
  #[arg(short, long = "time-period")]
  time_periods: Vec<String>,

  /// List status prefix, e.g. "Published"
  #[arg(short, long)]
  status: Option<String>,

  /// Privacy control, e.g. "Public"
  #[arg(short, long)]
  privacy_control: Option<String>,
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_file = args.log_file.clone().or_else(|| config.log.file.clone());
  let _log_guard = logging::init(args.verbose, log_file.as_deref())?;

  let store = open_cache(&config)?;
  let builder = Builder::new(&store);

  match args.command {
    Command::Build {
      list: Some(url),
      clear,
      ..
    } => {
      if clear {
        store.clear()?;
      }
      info!(url = %url, "caching list");
      builder.write_list(&url, None, true)?;
    }
    Command::Build {
      list: None,
      report,
      clear,
    } => {
      let urls = report_urls(&config, &report)?;
      builder.build(urls, clear)?;
    }
    Command::Resume { report } => {
      let urls = report_urls(&config, &report)?;
      builder.resume(urls)?;
    }
    Command::Remove {
      url,
      force,
      children,
    } => match store.remove_url(&url, force, children)? {
      Some(_) => println!("Removed {}", url),
      None => println!("{} is not cached", url),
    },
    Command::Marked { types } => {
      let types: Vec<&str> = types.iter().map(String::as_str).collect();
      for entry in store.marked_entries(&types) {
        println!("{}", entry.url());
      }
    }
    Command::Clear => store.clear()?,
  }

  Ok(())
}

fn open_cache(config: &Config) -> Result<CacheStore> {
  let http = config.http_options();
  let tenancy = config.tenancy()?;

  let json_api: Option<Box<dyn JsonApi>> = match (config.client_id(), Config::get_api_secret()) {
    (Some(client_id), Ok(secret)) => Some(Box::new(JsonApiClient::new(
      &client_id,
      &secret,
      tenancy.code(),
      config.json_api_options(),
      &http,
    )?)),
    _ => {
      warn!("JSON API credentials not configured, list JSON documents will not be cached");
      None
    }
  };

  let linked_data = LinkedDataClient::new(tenancy, &http)?;
  Ok(CacheStore::new(
    Box::new(linked_data),
    json_api,
    config.cache_options(false),
  )?)
}

/// List URLs from the report, skipping malformed rows.
fn report_urls(config: &Config, args: &ReportArgs) -> Result<impl Iterator<Item = String>> {
  let path = args
    .report
    .clone()
    .or_else(|| config.report.path.clone())
    .ok_or_else(|| eyre!("No list report given. Use --report or set report.path in the config."))?;
  if args.privacy_control.as_deref().unwrap_or_default().is_empty() {
    return Err(eyre!("--privacy-control is required when caching from a report"));
  }

  let filter = ListFilter {
    time_periods: args.time_periods.clone(),
    status: args.status.clone(),
    privacy_control: args.privacy_control.clone(),
  };
  let report = ListReport::open(&path, filter)?;
  Ok(report.filter_map(|row| match row {
    Ok(url) => Some(url),
    Err(e) => {
      warn!(error = %e, "skipping report row");
      None
    }
  }))
}
