use std::path::PathBuf;
use thiserror::Error;

/// Failures the display engine degrades around instead of propagating.
#[derive(Debug, Error)]
pub enum MediaError {
  #[error("cannot decode {}: {reason}", path.display())]
  DecodeFailure { path: PathBuf, reason: String },

  #[error("file not found: {}", .0.display())]
  MissingFile(PathBuf),

  #[error("network failure: {0}")]
  NetworkFailure(String),

  #[error("credential failure: {0}")]
  CredentialFailure(String),

  #[error("player process failure: {0}")]
  ProcessFailure(String),
}

impl MediaError {
  pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
    Self::DecodeFailure { path: path.into(), reason: reason.to_string() }
  }

  /// Human-readable terminal label shown by the rendering surface.
  pub fn display_label(&self) -> &'static str {
    match self {
      Self::DecodeFailure { .. } => "Corrupt media",
      Self::MissingFile(_) => "Missing file",
      Self::NetworkFailure(_) => "Network unavailable",
      Self::CredentialFailure(_) => "Not signed in",
      Self::ProcessFailure(_) => "Player failed",
    }
  }
}

impl From<reqwest::Error> for MediaError {
  fn from(e: reqwest::Error) -> Self {
    Self::NetworkFailure(e.to_string())
  }
}
