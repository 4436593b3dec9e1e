use cachegate::config::Config;
use cachegate::control::{ControlChannel, ControlCommand};
use cachegate::interceptor::Interceptor;
use cachegate::push::{ClientWindow, PushDispatcher, PushMessage};
use cachegate::{logging, session};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "A request-interception cache layer with offline fallback")]
#[command(version)]
struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/cachegate/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Fetch URLs through the layer and print the metrics
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,
  },

  /// Fetch URLs into their stores ahead of time
  Warm {
    #[arg(required = true)]
    urls: Vec<String>,
  },

  /// Store a route as a navigation for offline use
  Prefetch { url: String },

  /// Clear one store, or all of them
  Clear { store: Option<String> },

  /// Activate a pending layer version
  Activate,

  /// List the keys of a store
  Keys { store: String },

  /// Run one eviction pass now
  Evict,

  /// Replay deferred requests
  Drain,

  /// Turn a push payload into a notification
  Notify { payload: PathBuf },

  /// Route a notification click to an open window or a new one
  Click {
    action: String,
    url: String,
    /// Open window as ID=URL (repeatable)
    #[arg(long = "window", value_parser = parse_window)]
    windows: Vec<ClientWindow>,
  },

  /// Serve URLs and control commands from stdin, one per line
  Session,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref())?;
  let _log_guard = logging::init(config.log_file.as_deref())?;

  if let Commands::Notify { payload } = &cli.command {
    let contents = std::fs::read_to_string(payload)
      .map_err(|e| eyre!("Failed to read push payload {}: {}", payload.display(), e))?;
    let message: PushMessage = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse push payload: {}", e))?;
    let dispatcher = PushDispatcher::new("cachegate", config.origin_url()?);
    return print_json(&dispatcher.on_push(message));
  }

  let interceptor = Interceptor::from_config(&config)?;
  let control = ControlChannel::new(interceptor.clone());

  match cli.command {
    Commands::Fetch { urls } => {
      for url in urls {
        let served = interceptor.get(&url).await?;
        println!(
          "{} {:>8} bytes  {:?}  {}",
          served.response.status,
          served.response.body.len(),
          served.source,
          url
        );
      }
      println!("{}", interceptor.metrics());
    }

    Commands::Warm { urls } => {
      print_json(&control.dispatch(ControlCommand::WarmCache { urls }).await?)?;
    }

    Commands::Prefetch { url } => {
      print_json(&control.dispatch(ControlCommand::PrefetchRoute { url }).await?)?;
    }

    Commands::Clear { store } => {
      print_json(&control.dispatch(ControlCommand::ClearCache { store }).await?)?;
    }

    Commands::Activate => {
      print_json(&control.dispatch(ControlCommand::ActivateNow).await?)?;
    }

    Commands::Keys { store } => {
      for (key, stored_at) in interceptor.stores().stored_at_index(&store)? {
        println!("{}  {}", stored_at.format("%Y-%m-%d %H:%M:%S"), key);
      }
    }

    Commands::Evict => {
      let scheduler = interceptor.scheduler();
      let report = tokio::task::spawn_blocking(move || scheduler.run_pass())
        .await
        .map_err(|e| eyre!("Eviction pass failed: {}", e))?;
      print_json(&report)?;
    }

    Commands::Click {
      action,
      url,
      windows,
    } => {
      let command = ControlCommand::NotificationClick {
        action,
        url,
        windows,
      };
      print_json(&control.dispatch(command).await?)?;
    }

    Commands::Drain => {
      print_json(&interceptor.connectivity_restored().await)?;
    }

    Commands::Session => {
      let input = tokio::io::BufReader::new(tokio::io::stdin());
      session::run(interceptor, input, tokio::io::stdout()).await?;
    }

    Commands::Notify { .. } => {}
  }

  Ok(())
}

fn parse_window(arg: &str) -> std::result::Result<ClientWindow, String> {
  match arg.split_once('=') {
    Some((id, url)) if !id.is_empty() && !url.is_empty() => Ok(ClientWindow {
      id: id.to_string(),
      url: url.to_string(),
    }),
    _ => Err(format!("expected ID=URL, got '{}'", arg)),
  }
}

fn print_json(value: &impl Serialize) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}
