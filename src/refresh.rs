//! Generation-counted refresh driver.
//!
//! A `Refresh<T>` owns a fetcher closure and the latest result. Every
//! `refresh()` bumps a generation counter; results are tagged with the
//! generation that started them and `poll()` drops any that arrive after a
//! newer refresh was started, so a slow stale fetch can never overwrite a
//! fresher one.
//!
//! ```ignore
//! let mut refresh = Refresh::for_request(proxy.clone(), Request::get(url));
//! refresh.refresh();
//!
//! // on each tick
//! if refresh.poll() {
//!     render(refresh.state());
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::http::{Request, Response};
use crate::proxy::ResponseProxy;

#[derive(Debug, Clone)]
pub enum RefreshState<T> {
  /// Never started
  Idle,
  Loading,
  Success(T),
  Error(String),
}

impl<T> RefreshState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, RefreshState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      RefreshState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      RefreshState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type Tagged<T> = (u64, Result<T, String>);

pub struct Refresh<T> {
  state: RefreshState<T>,
  fetcher: FetcherFn<T>,
  generation: u64,
  sender: mpsc::UnboundedSender<Tagged<T>>,
  receiver: mpsc::UnboundedReceiver<Tagged<T>>,
}

impl<T: Send + 'static> Refresh<T> {
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      state: RefreshState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      generation: 0,
      sender,
      receiver,
    }
  }

  pub fn state(&self) -> &RefreshState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Generation of the most recently started fetch.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Start a new generation; whatever is still in flight becomes stale.
  pub fn refresh(&mut self) {
    self.generation += 1;
    self.state = RefreshState::Loading;

    let generation = self.generation;
    let sender = self.sender.clone();
    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Receiver gone means the driver was dropped
      let _ = sender.send((generation, result));
    });
  }

  /// Apply results that arrived since the last poll.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok((generation, result)) = self.receiver.try_recv() {
      if generation != self.generation {
        tracing::debug!(generation, current = self.generation, "discarding stale refresh result");
        continue;
      }
      self.state = settled(result);
      changed = true;
    }
    changed
  }

  /// Wait for the current generation to settle and return its state.
  pub async fn settle(&mut self) -> &RefreshState<T> {
    while self.state.is_loading() {
      match self.receiver.recv().await {
        Some((generation, result)) if generation == self.generation => {
          self.state = settled(result);
        }
        Some((generation, _)) => {
          tracing::debug!(generation, current = self.generation, "discarding stale refresh result");
        }
        // The driver holds a sender, so the channel never closes while it lives
        None => break,
      }
    }
    &self.state
  }
}

fn settled<T>(result: Result<T, String>) -> RefreshState<T> {
  match result {
    Ok(data) => RefreshState::Success(data),
    Err(e) => RefreshState::Error(e),
  }
}

impl Refresh<Response> {
  /// Re-issue `request` through the proxy on every refresh.
  pub fn for_request(proxy: Arc<ResponseProxy>, request: Request) -> Self {
    Refresh::new(move || {
      let proxy = proxy.clone();
      let request = request.clone();
      async move { proxy.process_request(request).await.map_err(|e| e.to_string()) }
    })
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Refresh<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Refresh")
      .field("state", &self.state)
      .field("generation", &self.generation)
      .finish_non_exhaustive()
  }
}
