//! External-player video sessions.
//!
//! At most one player process runs per controller. Each session has a
//! watcher task that reports completion (natural exit, the `max_seconds`
//! limit, or a launch failure) on an mpsc channel; [`VideoPlaybackController::spawn_chain`]
//! turns each report for the current session into the next `play_next`.

use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DisplayConfig;
use crate::constants::constants;
use crate::error::MediaError;

// --- Options ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerOptions {
  pub mute: bool,
  pub volume: u8,
  pub play_to_end: bool,
  pub max_seconds: u64,
}

impl Default for PlayerOptions {
  fn default() -> Self {
    Self::from_display(&DisplayConfig::default())
  }
}

impl PlayerOptions {
  pub fn from_display(display: &DisplayConfig) -> Self {
    Self {
      mute: display.video_mute,
      volume: display.video_volume.clamp(0, 100) as u8,
      play_to_end: display.video_play_to_end,
      max_seconds: display.video_max_seconds.max(1),
    }
  }

  /// Playback limit, `None` when videos play to their natural end.
  pub fn limit(&self) -> Option<Duration> {
    (!self.play_to_end).then(|| Duration::from_secs(self.max_seconds))
  }
}

/// mpv arguments for one session.
pub fn build_player_args(options: &PlayerOptions, path: &Path) -> Vec<String> {
  let mut args: Vec<String> =
    ["--fullscreen", "--no-terminal", "--no-osc", "--keep-open=no", "--loop-file=no"].map(String::from).to_vec();
  if options.mute {
    args.extend(["--mute=yes".to_string(), "--volume=0".to_string()]);
  } else {
    args.extend(["--mute=no".to_string(), format!("--volume={}", options.volume)]);
  }
  args.push("--".to_string());
  args.push(path.to_string_lossy().into_owned());
  args
}

// --- Launcher ---

/// Starts a player process.
pub trait PlayerLauncher: Send + Sync {
  fn launch(&self, path: &Path, args: &[String]) -> anyhow::Result<Child>;
}

pub struct MpvLauncher {
  binary: String,
}

impl Default for MpvLauncher {
  fn default() -> Self {
    Self { binary: constants().mpv_binary.clone() }
  }
}

impl PlayerLauncher for MpvLauncher {
  fn launch(&self, _path: &Path, args: &[String]) -> anyhow::Result<Child> {
    Command::new(&self.binary)
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
          anyhow!("{} not found. Install it with: apt install mpv (Linux) or brew install mpv (macOS)", self.binary)
        } else {
          anyhow!(e).context(format!("Failed to spawn {}", self.binary))
        }
      })
  }
}

/// Ask the process to exit, then kill it if it is still alive after `grace`.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
  #[cfg(unix)]
  if let Some(pid) = child.id() {
    // SAFETY: pid belongs to a child we own and have not reaped yet.
    unsafe {
      libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
  }
  if tokio::time::timeout(grace, child.wait()).await.is_err() {
    debug!("video: player ignored SIGTERM, killing");
    let _ = child.kill().await;
  }
}

// --- Sessions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
  Exited(Option<i32>),
  TimedOut,
  LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEvent {
  Finished { session: u64, path: PathBuf, outcome: SessionOutcome },
  SkipRequested,
}

/// Presentation view of the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSessionInfo {
  pub id: u64,
  pub path: PathBuf,
  pub started_at: Instant,
}

struct VideoSession {
  info: VideoSessionInfo,
  stop: Option<oneshot::Sender<()>>,
  watcher: JoinHandle<()>,
}

struct ControllerState {
  sequence: Arc<Vec<PathBuf>>,
  index: usize,
  options: PlayerOptions,
  session: Option<VideoSession>,
}

pub struct VideoPlaybackController {
  launcher: Arc<dyn PlayerLauncher>,
  state: Mutex<ControllerState>,
  events: mpsc::UnboundedSender<VideoEvent>,
  current: watch::Sender<Option<VideoSessionInfo>>,
  next_id: AtomicU64,
  grace: Duration,
  failure_backoff: Duration,
}

impl VideoPlaybackController {
  pub fn new(launcher: Arc<dyn PlayerLauncher>) -> (Arc<Self>, mpsc::UnboundedReceiver<VideoEvent>) {
    let c = constants();
    Self::with_timing(launcher, c.video_stop_grace(), c.video_failure_backoff())
  }

  pub fn with_timing(
    launcher: Arc<dyn PlayerLauncher>,
    grace: Duration,
    failure_backoff: Duration,
  ) -> (Arc<Self>, mpsc::UnboundedReceiver<VideoEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let (current, _) = watch::channel(None);
    let controller = Arc::new(Self {
      launcher,
      state: Mutex::new(ControllerState {
        sequence: Arc::new(Vec::new()),
        index: 0,
        options: PlayerOptions::default(),
        session: None,
      }),
      events,
      current,
      next_id: AtomicU64::new(1),
      grace,
      failure_backoff,
    });
    (controller, rx)
  }

  /// Replace the playlist. Stops the live session and rewinds to the first item.
  pub async fn load(&self, sequence: Vec<PathBuf>, options: PlayerOptions) {
    let mut state = self.state.lock().await;
    self.terminate(&mut state).await;
    state.sequence = Arc::new(sequence);
    state.index = 0;
    state.options = options;
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<VideoSessionInfo>> {
    self.current.subscribe()
  }

  pub fn session(&self) -> Option<VideoSessionInfo> {
    self.current.borrow().clone()
  }

  pub async fn index(&self) -> usize {
    self.state.lock().await.index
  }

  pub async fn is_current(&self, session: u64) -> bool {
    self.state.lock().await.session.as_ref().is_some_and(|s| s.info.id == session)
  }

  /// Stop any live session, start the item at the cursor and advance it.
  /// Returns the path launched, or `None` for an empty playlist.
  pub async fn play_next(&self) -> Option<PathBuf> {
    let mut state = self.state.lock().await;
    self.terminate(&mut state).await;
    if state.sequence.is_empty() {
      info!("video: no videos to play");
      return None;
    }

    let index = state.index % state.sequence.len();
    let path = state.sequence[index].clone();
    state.index = (index + 1) % state.sequence.len();
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let args = build_player_args(&state.options, &path);

    let (stop_tx, stop_rx) = oneshot::channel();
    let watcher = match self.launcher.launch(&path, &args) {
      Ok(child) => {
        info!(path = %path.display(), session = id, "video: playing");
        self.spawn_watcher(child, id, path.clone(), state.options.limit(), stop_rx)
      }
      Err(e) => {
        let failure = MediaError::ProcessFailure(format!("{e:#}"));
        error!(path = %path.display(), err = %failure, "video: launch failed");
        self.spawn_failure(id, path.clone(), stop_rx)
      }
    };

    let info = VideoSessionInfo { id, path: path.clone(), started_at: Instant::now() };
    self.current.send_replace(Some(info.clone()));
    state.session = Some(VideoSession { info, stop: Some(stop_tx), watcher });
    Some(path)
  }

  /// Terminate the live session. With `advance` the chain moves on to the next item.
  pub async fn stop(&self, advance: bool) {
    let mut state = self.state.lock().await;
    self.terminate(&mut state).await;
    drop(state);
    if advance {
      let _ = self.events.send(VideoEvent::SkipRequested);
    }
  }

  /// Drive the playlist from completion reports until the channel closes.
  pub fn spawn_chain(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<VideoEvent>) -> JoinHandle<()> {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        match event {
          VideoEvent::Finished { session, path, outcome } => {
            if !this.is_current(session).await {
              debug!(session, "video: stale completion ignored");
              continue;
            }
            debug!(session, path = %path.display(), ?outcome, "video: session finished");
            this.play_next().await;
          }
          VideoEvent::SkipRequested => {
            this.play_next().await;
          }
        }
      }
    })
  }

  async fn terminate(&self, state: &mut ControllerState) {
    let Some(mut session) = state.session.take() else {
      return;
    };
    if let Some(stop) = session.stop.take() {
      let _ = stop.send(());
    }
    if tokio::time::timeout(self.grace * 2, &mut session.watcher).await.is_err() {
      warn!(session = session.info.id, "video: watcher did not finish, aborting");
      // Aborting drops the child, which kills it.
      session.watcher.abort();
    }
    self.current.send_replace(None);
  }

  fn spawn_watcher(
    &self,
    mut child: Child,
    session: u64,
    path: PathBuf,
    limit: Option<Duration>,
    mut stop: oneshot::Receiver<()>,
  ) -> JoinHandle<()> {
    let events = self.events.clone();
    let grace = self.grace;
    tokio::spawn(async move {
      let deadline = async {
        match limit {
          Some(limit) => tokio::time::sleep(limit).await,
          None => std::future::pending().await,
        }
      };
      let outcome = tokio::select! {
        status = child.wait() => SessionOutcome::Exited(status.ok().and_then(|s| s.code())),
        _ = deadline => {
          info!(session, "video: max duration reached");
          terminate_child(&mut child, grace).await;
          SessionOutcome::TimedOut
        }
        _ = &mut stop => {
          terminate_child(&mut child, grace).await;
          return;
        }
      };
      let _ = events.send(VideoEvent::Finished { session, path, outcome });
    })
  }

  fn spawn_failure(&self, session: u64, path: PathBuf, mut stop: oneshot::Receiver<()>) -> JoinHandle<()> {
    let events = self.events.clone();
    let backoff = self.failure_backoff;
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(backoff) => {
          let _ = events.send(VideoEvent::Finished { session, path, outcome: SessionOutcome::LaunchFailed });
        }
        _ = &mut stop => {}
      }
    })
  }
}
