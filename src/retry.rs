//! Generic retry engine.
//!
//! [`Retry::execute`] runs a fallible operation until it succeeds, fails
//! with an error that isn't retriable, or runs out of tries. Errors are
//! classified through the [`Classify`] trait, and handlers registered per
//! error kind can observe each failure or force an early return value.
//!
//! ```
//! use aspire_cache::retry::{Classify, Delay, Retry, RetryConfig};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Flaky { Transient }
//!
//! impl Classify for Flaky {
//!   type Kind = Flaky;
//!   fn kinds(&self) -> Vec<Flaky> { vec![*self] }
//! }
//!
//! let config = RetryConfig::new(3).delay(Delay::None).retriable([Flaky::Transient]);
//! let mut calls = 0;
//! let value = Retry::new(config).execute(|| {
//!   calls += 1;
//!   if calls < 3 { Err(Flaky::Transient) } else { Ok(calls) }
//! });
//! assert_eq!(value, Ok(3));
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Maps an error onto the kinds used to select handlers and decide whether
/// to retry.
pub trait Classify {
  type Kind: Copy + Eq + Hash + fmt::Debug;

  /// Kinds of this error, most specific first. A kind matches a retriable
  /// set or a handler if any entry in this list does.
  fn kinds(&self) -> Vec<Self::Kind>;
}

/// Bound on the number of attempts.
pub enum MaxTries<E> {
  /// Total number of attempts. Zero and one both mean "never retry".
  Limit(u32),
  /// Retry while the predicate returns true for the latest error.
  While(Arc<dyn Fn(&E) -> bool + Send + Sync>),
}

impl<E> Clone for MaxTries<E> {
  fn clone(&self) -> Self {
    match self {
      Self::Limit(n) => Self::Limit(*n),
      Self::While(predicate) => Self::While(Arc::clone(predicate)),
    }
  }
}

impl<E> fmt::Debug for MaxTries<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Limit(n) => f.debug_tuple("Limit").field(n).finish(),
      Self::While(_) => f.write_str("While(..)"),
    }
  }
}

/// Wait applied before each retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
  None,
  Fixed(Duration),
  /// Uniformly random in `[0, limit)`.
  UpTo(Duration),
}

impl Delay {
  /// Positive values give a fixed delay, negative values a random delay of
  /// up to the absolute value, zero none at all.
  pub fn from_secs_f64(secs: f64) -> Self {
    if !secs.is_finite() || secs == 0.0 {
      Self::None
    } else if secs > 0.0 {
      Self::Fixed(Duration::from_secs_f64(secs))
    } else {
      Self::UpTo(Duration::from_secs_f64(-secs))
    }
  }

  pub fn duration(&self) -> Duration {
    match self {
      Self::None => Duration::ZERO,
      Self::Fixed(d) => *d,
      Self::UpTo(limit) if limit.is_zero() => Duration::ZERO,
      Self::UpTo(limit) => {
        let secs = rand::rng().random_range(0.0..limit.as_secs_f64());
        Duration::from_secs_f64(secs)
      }
    }
  }
}

/// Tries, delay and retriable error kinds.
pub struct RetryConfig<E: Classify> {
  pub max_tries: MaxTries<E>,
  pub delay: Delay,
  /// Ordered set of retriable kinds.
  pub retriable: Vec<E::Kind>,
}

impl<E: Classify> RetryConfig<E> {
  pub fn new(max_tries: u32) -> Self {
    Self {
      max_tries: MaxTries::Limit(max_tries),
      delay: Delay::None,
      retriable: Vec::new(),
    }
  }

  pub fn retry_while(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
    Self {
      max_tries: MaxTries::While(Arc::new(predicate)),
      delay: Delay::None,
      retriable: Vec::new(),
    }
  }

  pub fn delay(mut self, delay: Delay) -> Self {
    self.delay = delay;
    self
  }

  pub fn retriable(mut self, kinds: impl IntoIterator<Item = E::Kind>) -> Self {
    for kind in kinds {
      if !self.retriable.contains(&kind) {
        self.retriable.push(kind);
      }
    }
    self
  }

  fn is_retriable_kind(&self, kinds: &[E::Kind]) -> bool {
    kinds.iter().any(|kind| self.retriable.contains(kind))
  }
}

impl<E: Classify> Clone for RetryConfig<E> {
  fn clone(&self) -> Self {
    Self {
      max_tries: self.max_tries.clone(),
      delay: self.delay,
      retriable: self.retriable.clone(),
    }
  }
}

impl<E: Classify> fmt::Debug for RetryConfig<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryConfig")
      .field("max_tries", &self.max_tries)
      .field("delay", &self.delay)
      .field("retriable", &self.retriable)
      .finish()
  }
}

/// What a handler wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<T> {
  /// Carry on with the normal classification.
  Continue,
  /// Retry even if the error kind isn't in the retriable set, as long as
  /// tries remain.
  Retry,
  /// Stop immediately and return this value from `execute`.
  Return(T),
}

/// Which failures a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKey<K> {
  /// Runs on every failure, before the kind-specific handler.
  Default,
  /// Runs after the delay, just before the operation is re-invoked.
  Retry,
  Kind(K),
}

/// The failure a handler is asked about.
#[derive(Debug)]
pub struct Attempt<'a, E> {
  pub error: &'a E,
  /// 1-based number of the attempt that failed.
  pub attempt: u32,
  /// Tries left after this one, if the bound is a count.
  pub tries_left: Option<u32>,
  pub retriable: bool,
}

type Handler<'h, T, E> = Box<dyn FnMut(&Attempt<'_, E>) -> Result<Action<T>, E> + 'h>;

/// A configured retry loop with its handlers.
pub struct Retry<'h, T, E: Classify> {
  config: RetryConfig<E>,
  handlers: Vec<(HandlerKey<E::Kind>, Handler<'h, T, E>)>,
  sleep: fn(Duration),
}

impl<'h, T, E: Classify> Retry<'h, T, E> {
  pub fn new(config: RetryConfig<E>) -> Self {
    Self {
      config,
      handlers: Vec::new(),
      sleep: std::thread::sleep,
    }
  }

  /// Register a handler. A later registration for the same key replaces the
  /// earlier one.
  pub fn on<F>(mut self, key: HandlerKey<E::Kind>, handler: F) -> Self
  where
    F: FnMut(&Attempt<'_, E>) -> Result<Action<T>, E> + 'h,
  {
    self.handlers.retain(|(k, _)| *k != key);
    self.handlers.push((key, Box::new(handler)));
    self
  }

  pub fn on_default<F>(self, handler: F) -> Self
  where
    F: FnMut(&Attempt<'_, E>) -> Result<Action<T>, E> + 'h,
  {
    self.on(HandlerKey::Default, handler)
  }

  pub fn on_retry<F>(self, handler: F) -> Self
  where
    F: FnMut(&Attempt<'_, E>) -> Result<Action<T>, E> + 'h,
  {
    self.on(HandlerKey::Retry, handler)
  }

  pub fn on_kind<F>(self, kind: E::Kind, handler: F) -> Self
  where
    F: FnMut(&Attempt<'_, E>) -> Result<Action<T>, E> + 'h,
  {
    self.on(HandlerKey::Kind(kind), handler)
  }

  /// Replace the function used to wait between attempts.
  pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
    self.sleep = sleep;
    self
  }

  /// Run `operation` until it succeeds or a failure is final.
  pub fn execute<F>(&mut self, mut operation: F) -> Result<T, E>
  where
    F: FnMut() -> Result<T, E>,
  {
    let mut tries_left = match &self.config.max_tries {
      MaxTries::Limit(n) => Some(*n),
      MaxTries::While(_) => None,
    };
    let mut attempt = 0u32;

    loop {
      attempt += 1;
      let error = match operation() {
        Ok(value) => return Ok(value),
        Err(error) => error,
      };

      if let Some(n) = tries_left.as_mut() {
        *n = n.saturating_sub(1);
      }
      let tries_remain = match &self.config.max_tries {
        MaxTries::Limit(_) => tries_left != Some(0),
        MaxTries::While(predicate) => predicate(&error),
      };
      let kinds = error.kinds();
      let mut retriable = tries_remain && self.config.is_retriable_kind(&kinds);

      let mut forced_retry = false;
      {
        let ctx = Attempt {
          error: &error,
          attempt,
          tries_left,
          retriable,
        };
        let specific = kinds
          .iter()
          .map(|kind| HandlerKey::Kind(*kind))
          .find(|key| self.has_handler(key));
        for key in std::iter::once(HandlerKey::Default).chain(specific) {
          match self.run_handler(&key, &ctx)? {
            Some(Action::Return(value)) => return Ok(value),
            Some(Action::Retry) => forced_retry = true,
            Some(Action::Continue) | None => {}
          }
        }
      }
      if forced_retry && tries_remain {
        retriable = true;
      }
      if !retriable {
        return Err(error);
      }

      let wait = self.config.delay.duration();
      debug!(attempt, ?tries_left, ?wait, "retrying after failure");
      if !wait.is_zero() {
        (self.sleep)(wait);
      }

      let ctx = Attempt {
        error: &error,
        attempt,
        tries_left,
        retriable,
      };
      if let Some(Action::Return(value)) = self.run_handler(&HandlerKey::Retry, &ctx)? {
        return Ok(value);
      }
    }
  }

  fn has_handler(&self, key: &HandlerKey<E::Kind>) -> bool {
    self.handlers.iter().any(|(k, _)| k == key)
  }

  fn run_handler(
    &mut self,
    key: &HandlerKey<E::Kind>,
    ctx: &Attempt<'_, E>,
  ) -> Result<Option<Action<T>>, E> {
    match self.handlers.iter_mut().find(|(k, _)| k == key) {
      Some((_, handler)) => handler(ctx).map(Some),
      None => Ok(None),
    }
  }
}
