//! Process-wide online/offline flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared connectivity state.
///
/// Every decision point reads the flag again rather than caching it, so a
/// transition in the middle of a request is seen by the steps that follow.
#[derive(Debug, Clone)]
pub struct Connectivity {
  online: Arc<AtomicBool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    Self {
      online: Arc::new(AtomicBool::new(online)),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Flip the flag, logging only real transitions.
  pub fn set_online(&self, online: bool) {
    let previous = self.online.swap(online, Ordering::SeqCst);
    if previous != online {
      if online {
        tracing::info!("connectivity: back online");
      } else {
        tracing::warn!("connectivity: transitioning to offline mode");
      }
    }
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}
