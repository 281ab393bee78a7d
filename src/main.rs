use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use echoview::aspect::AspectFilter;
use echoview::config::{self, ConfigSource, FileConfigSource};
use echoview::constants::constants;
use echoview::embed::{EmbedClassifier, RemoteEmbedBackend};
use echoview::engine::{EngineDeps, Presentation, SlideshowEngine};
use echoview::library::MediaLibrary;
use echoview::spotify::{PlaybackSource, SpotifyWebApi};
use echoview::video::MpvLauncher;

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Args {
  /// Config file (default: $ECHOVIEW_CONFIG or the platform config dir)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Drive the slideshow engines until interrupted
  Run {
    /// Displays to run (default: every configured display)
    #[arg(long = "display")]
    displays: Vec<String>,
    /// Viewport size used for background composition, as WIDTHxHEIGHT
    #[arg(long, default_value = "1920x1080", value_parser = parse_viewport)]
    viewport: (u32, u32),
  },
  /// Classify a URL for embedding and print the metadata as JSON
  Classify { url: String },
  /// Print the aspect label of each file
  Aspect { paths: Vec<PathBuf> },
  /// List media categories under the media root
  Library,
}

fn parse_viewport(s: &str) -> Result<(u32, u32), String> {
  let (w, h) = s.split_once(['x', 'X']).ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
  let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| format!("invalid size '{v}': {e}"));
  Ok((parse(w)?, parse(h)?))
}

// --- Logging ---

fn init_tracing() -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("{}=info", constants().app_name).into());
  let (file_layer, guard) = match config::data_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir.join("logs"), format!("{}.log", constants().app_name));
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
    }
    None => (None, None),
  };
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();
  guard
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  let _guard = init_tracing();

  let path = args.config.or_else(config::default_config_path).ok_or_else(|| anyhow!("No config path available"))?;
  let source = Arc::new(FileConfigSource::new(path));

  match args.command {
    Command::Run { displays, viewport } => run(source, displays, viewport).await,
    Command::Classify { url } => {
      let classifier = EmbedClassifier::new(Arc::new(RemoteEmbedBackend::new(http_client()?)));
      let metadata = classifier.classify(&url).await;
      println!("{}", serde_json::to_string_pretty(&metadata)?);
      Ok(())
    }
    Command::Aspect { paths } => {
      let filter = AspectFilter::default();
      for path in paths {
        println!("{}\t{}", filter.classify(&path).as_str(), path.display());
      }
      Ok(())
    }
    Command::Library => {
      #[derive(Serialize)]
      struct Category {
        name: String,
        media: usize,
      }
      let config = source.load()?;
      let library = MediaLibrary::new(config.media_root);
      let categories: Vec<Category> = library
        .subfolders()
        .into_iter()
        .map(|name| Category { media: library.count_media(&name), name })
        .collect();
      println!("{}", serde_json::to_string_pretty(&categories)?);
      Ok(())
    }
  }
}

fn http_client() -> Result<Client> {
  Client::builder().timeout(constants().http_timeout()).build().context("Failed to build HTTP client")
}

async fn run(source: Arc<FileConfigSource>, displays: Vec<String>, viewport: (u32, u32)) -> Result<()> {
  let config = source.load()?;
  let http = http_client()?;
  let spotify = SpotifyWebApi::from_config(http.clone(), &config.spotify).map(|api| Arc::new(api) as Arc<dyn PlaybackSource>);
  if spotify.is_none() {
    info!("spotify: no credentials configured");
  }
  let deps = EngineDeps {
    config: source.clone(),
    aspect: Arc::new(AspectFilter::default()),
    embed: Arc::new(EmbedClassifier::new(Arc::new(RemoteEmbedBackend::new(http)))),
    launcher: Arc::new(MpvLauncher::default()),
    spotify,
  };

  let names = if !displays.is_empty() {
    displays
  } else if !config.displays.is_empty() {
    config.displays.keys().cloned().collect()
  } else {
    vec!["default".to_string()]
  };

  let mut engines = Vec::new();
  for name in names {
    let engine = SlideshowEngine::new(name, deps.clone(), viewport)?;
    engine.start().await.with_context(|| format!("Failed to start display {}", engine.name()))?;
    tokio::spawn(log_presentations(engine.clone()));
    engines.push(engine);
  }
  info!(displays = engines.len(), config = %source.path().display(), "run: started");

  let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
  let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
  loop {
    tokio::select! {
      _ = hangup.recv() => {
        info!("run: reloading config");
        for engine in &engines {
          if let Err(e) = engine.reload().await {
            warn!(display = engine.name(), err = %e, "run: reload failed");
            continue;
          }
          engine.advance(true).await;
        }
      }
      _ = terminate.recv() => break,
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  info!("run: shutting down");
  for engine in &engines {
    engine.shutdown().await;
  }
  Ok(())
}

async fn log_presentations(engine: Arc<SlideshowEngine>) {
  let mut rx = engine.subscribe();
  while rx.changed().await.is_ok() {
    let presentation = rx.borrow_and_update().clone();
    let summary = match &presentation {
      Presentation::Message { text, .. } => text.clone(),
      Presentation::Image { path, .. } => path.display().to_string(),
      Presentation::Spotify { text, .. } => text.replace('\n', " | "),
      Presentation::Webpage { url, .. } | Presentation::Stream { url, .. } => url.clone(),
      Presentation::Video { path } => path.display().to_string(),
    };
    info!(display = engine.name(), state = ?presentation.state(), item = %summary, "run: showing");
  }
}
