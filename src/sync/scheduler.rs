//! Per-key polling state machine.
//!
//! Each scheduler is one tokio task that owns a timer and a backoff
//! multiplier, and decides whether and when to refetch its key:
//!
//! ```text
//!   Idle ──start──▶ Scheduled ──tick (eligible)──▶ Fetching ──ok──▶ Scheduled
//!                      ▲                              │
//!                      └──── delay elapsed ── Suspended ◀──429
//!
//!   403 ──▶ Disabled (terminal)      background/teardown ──▶ Idle
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::cache::QueryKey;

use super::backoff::Backoff;
use super::layer::{CacheLayer, FetchOutcome};
use super::policy::PollPolicy;
use super::rate_limit::RateLimitGuard;
use super::visibility::{Visibility, VisibilityController};

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  /// No timer armed
  Idle,
  /// Timer armed, waiting for the next tick
  Scheduled,
  /// Request in flight
  Fetching,
  /// Waiting out a rate-limit window
  Suspended,
  /// The backend refused access; never polls again
  Disabled,
}

#[derive(Debug)]
enum Command {
  Start,
  Shutdown,
}

/// Shared collaborators every scheduler needs.
#[derive(Clone)]
pub struct SchedulerContext {
  pub layer: CacheLayer,
  pub visibility: VisibilityController,
  pub max_multiplier: u32,
}

/// What the worker is waiting for.
#[derive(Debug, Clone, Copy)]
enum Wait {
  Idle,
  Tick(Instant),
  Suspended(Instant),
  Disabled,
}

impl Wait {
  fn deadline(&self) -> Option<Instant> {
    match self {
      Self::Tick(at) | Self::Suspended(at) => Some(*at),
      Self::Idle | Self::Disabled => None,
    }
  }
}

/// Handle to a running scheduler task. Dropping it tears the task down.
pub struct PollingScheduler {
  key: QueryKey,
  state: watch::Receiver<SchedulerState>,
  backoff: Arc<Mutex<Backoff>>,
  commands: mpsc::UnboundedSender<Command>,
}

impl PollingScheduler {
  /// Spawn an idle scheduler for `key`. Call [`start`](Self::start) to arm it.
  pub fn spawn(key: QueryKey, policy: PollPolicy, ctx: SchedulerContext) -> Self {
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let backoff = Arc::new(Mutex::new(Backoff::new(ctx.max_multiplier)));
    let guard = ctx.layer.guard().clone();

    let worker = Worker {
      key: key.clone(),
      policy,
      limit: guard.subscribe(),
      guard,
      visibility: ctx.visibility.subscribe(),
      layer: ctx.layer,
      backoff: backoff.clone(),
      state: state_tx,
      commands: command_rx,
      started: false,
    };
    let span = tracing::debug_span!("scheduler", key = %key);
    tokio::spawn(worker.run().instrument(span));

    Self {
      key,
      state: state_rx,
      backoff,
      commands: command_tx,
    }
  }

  /// Arm the timer, checking eligibility immediately.
  pub fn start(&self) {
    let _ = self.commands.send(Command::Start);
  }

  /// Clear the timer and end the task.
  pub fn shutdown(&self) {
    let _ = self.commands.send(Command::Shutdown);
  }

  pub fn state(&self) -> SchedulerState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
    self.state.clone()
  }

  pub fn multiplier(&self) -> u32 {
    self.backoff.lock().unwrap_or_else(|e| e.into_inner()).multiplier()
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for PollingScheduler {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl std::fmt::Debug for PollingScheduler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PollingScheduler")
      .field("key", &self.key)
      .field("state", &self.state())
      .field("multiplier", &self.multiplier())
      .finish()
  }
}

struct Worker {
  key: QueryKey,
  policy: PollPolicy,
  layer: CacheLayer,
  guard: RateLimitGuard,
  limit: watch::Receiver<Option<Instant>>,
  visibility: watch::Receiver<Visibility>,
  backoff: Arc<Mutex<Backoff>>,
  state: watch::Sender<SchedulerState>,
  commands: mpsc::UnboundedReceiver<Command>,
  /// Whether a consumer asked for polling
  started: bool,
}

async fn sleep_opt(deadline: Option<Instant>) {
  match deadline {
    Some(at) => sleep_until(at).await,
    None => std::future::pending().await,
  }
}

impl Worker {
  async fn run(mut self) {
    let mut wait = Wait::Idle;
    loop {
      wait = match wait {
        Wait::Disabled => match self.commands.recv().await {
          None | Some(Command::Shutdown) => break,
          Some(Command::Start) => Wait::Disabled,
        },
        current => {
          tokio::select! {
            biased;
            command = self.commands.recv() => match command {
              None | Some(Command::Shutdown) => break,
              Some(Command::Start) => self.on_start(current),
            },
            changed = self.visibility.changed() => match changed {
              Ok(()) => self.on_visibility(current),
              Err(_) => break,
            },
            changed = self.limit.changed(), if !matches!(current, Wait::Suspended(_)) => match changed {
              Ok(()) => self.on_limit(current),
              Err(_) => break,
            },
            () = sleep_opt(current.deadline()) => match current {
              Wait::Suspended(_) => {
                debug!("suspension over");
                self.schedule_at(Instant::now())
              }
              _ => self.tick().await,
            },
          }
        }
      };
    }
    self.state.send_replace(SchedulerState::Idle);
    debug!("scheduler stopped");
  }

  fn on_start(&mut self, current: Wait) -> Wait {
    self.started = true;
    if !self.is_foreground() {
      return self.idle();
    }
    match current {
      Wait::Idle => self.schedule_at(Instant::now()),
      other => other,
    }
  }

  fn on_visibility(&mut self, current: Wait) -> Wait {
    let visibility = *self.visibility.borrow_and_update();
    match visibility {
      Visibility::Background => self.idle(),
      Visibility::Foreground if self.started => {
        self.backoff().reset();
        self.schedule_at(Instant::now())
      }
      Visibility::Foreground => current,
    }
  }

  /// Another key tripped the shared limit: wait it out with everyone else.
  fn on_limit(&mut self, current: Wait) -> Wait {
    self.limit.borrow_and_update();
    match (current, self.guard.expires_at()) {
      (Wait::Tick(_), Some(until)) => {
        debug!("suspending for shared rate limit");
        self.suspend_until(until)
      }
      _ => current,
    }
  }

  async fn tick(&mut self) -> Wait {
    if !self.started || !self.is_foreground() {
      return self.idle();
    }
    if let Some(until) = self.guard.expires_at() {
      return self.suspend_until(until);
    }

    let state = self.layer.store().get(&self.key);
    if state.is_fetching() {
      debug!("fetch already in flight, skipping tick");
      return self.schedule_next();
    }
    if !state.is_stale(self.policy.stale_time, Instant::now()) {
      debug!("data is fresh, skipping tick");
      return self.schedule_next();
    }

    self.set_state(SchedulerState::Fetching);
    match self.layer.fetch(&self.key).await {
      FetchOutcome::Success => {
        self.backoff().reset();
        self.schedule_next()
      }
      FetchOutcome::InFlight | FetchOutcome::Failed(_) | FetchOutcome::Superseded => {
        self.schedule_next()
      }
      FetchOutcome::Suppressed => match self.guard.expires_at() {
        Some(until) => self.suspend_until(until),
        None => self.schedule_next(),
      },
      FetchOutcome::RateLimited { retry_after } => {
        let (multiplier, cooldown) = {
          let mut backoff = self.backoff();
          let multiplier = backoff.escalate();
          (
            multiplier,
            backoff.cooldown(self.policy.base_interval, self.layer.floor()),
          )
        };
        let delay = retry_after.map_or(cooldown, |r| r.max(cooldown));
        self.guard.set_limited(delay);
        self.limit.borrow_and_update();
        info!(
          multiplier,
          delay_ms = delay.as_millis() as u64,
          "rate limited, backing off"
        );
        self.suspend_until(Instant::now() + delay)
      }
      FetchOutcome::Forbidden => {
        warn!("polling disabled for this session");
        self.set_state(SchedulerState::Disabled);
        Wait::Disabled
      }
    }
  }

  fn schedule_next(&mut self) -> Wait {
    let interval = self.backoff().interval(self.policy.base_interval);
    self.schedule_at(Instant::now() + interval)
  }

  fn schedule_at(&mut self, at: Instant) -> Wait {
    self.set_state(SchedulerState::Scheduled);
    Wait::Tick(at)
  }

  fn suspend_until(&mut self, until: Instant) -> Wait {
    self.set_state(SchedulerState::Suspended);
    Wait::Suspended(until)
  }

  fn idle(&mut self) -> Wait {
    self.set_state(SchedulerState::Idle);
    Wait::Idle
  }

  fn set_state(&self, state: SchedulerState) {
    self.state.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });
  }

  fn is_foreground(&self) -> bool {
    *self.visibility.borrow() == Visibility::Foreground
  }

  fn backoff(&self) -> MutexGuard<'_, Backoff> {
    self.backoff.lock().unwrap_or_else(|e| e.into_inner())
  }
}
