use crate::event::{Event, EventHandler};
use chrono::Local;
use clinic_sync::cache::{record_id, CacheData};
use clinic_sync::clinic::{Appointment, AppointmentStatus, ClinicClient, Invoice, Resource};
use clinic_sync::config::Config;
use clinic_sync::sync::{self, FetchOutcome, QueryBinding, SyncEngine, Visibility};
use color_eyre::Result;
use crossterm::event::{DisableFocusChange, EnableFocusChange, KeyCode, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::ExecutableCommand;
use futures::future::{join_all, select_all};
use std::io::{stdout, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What woke the main loop
enum Step {
  Event(Option<Event>),
  Changed { index: usize, alive: bool },
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  engine: SyncEngine,

  /// One binding per configured view, in config order
  views: Vec<QueryBinding>,

  /// Last rate-limit status printed
  rate_limited: bool,

  /// Whether to quit
  should_quit: bool,
}

fn bind_views(engine: &SyncEngine, config: &Config) -> Vec<QueryBinding> {
  config
    .view_keys()
    .into_iter()
    .map(|key| engine.bind(key))
    .collect()
}

/// Resolves when any view changes; `alive` is false once a view's entry is gone.
async fn next_change(views: &mut [QueryBinding]) -> (usize, bool) {
  if views.is_empty() {
    return std::future::pending().await;
  }
  let (alive, index, _) = select_all(views.iter_mut().map(|v| Box::pin(v.changed()))).await;
  (index, alive)
}

fn print_line(line: &str) {
  let mut out = stdout();
  // Raw mode: no implicit carriage return.
  let _ = write!(out, "{}\r\n", line);
  let _ = out.flush();
}

/// Short description of a view's data, with per-resource extras.
fn summarize(resource: &str, data: &CacheData) -> String {
  if let CacheData::Detail(record) = data {
    return format!("entity {}", record_id(record).unwrap_or_else(|| "?".to_string()));
  }

  let mut text = match data.pagination() {
    Some(p) => format!(
      "{} items (page {}/{}, {} total)",
      data.len(),
      p.page,
      p.total_pages.max(1),
      p.total
    ),
    None => format!("{} items", data.len()),
  };

  match resource.parse::<Resource>() {
    Ok(Resource::Appointments) => {
      let appointments: Vec<Appointment> = data.typed();
      let count = |status| appointments.iter().filter(|a| a.status == status).count();
      text.push_str(&format!(
        ", {} pending, {} done",
        count(AppointmentStatus::Pending),
        count(AppointmentStatus::Done)
      ));
    }
    Ok(Resource::Invoices) => {
      let unpaid: f64 = data
        .typed::<Invoice>()
        .iter()
        .filter(|i| !i.is_paid())
        .map(|i| i.amount)
        .sum();
      text.push_str(&format!(", {:.2} unpaid", unpaid));
    }
    _ => {}
  }
  text
}

/// One status line for a view.
fn describe(view: &QueryBinding) -> String {
  let state = view.state();
  let mut line = format!("{} {}", Local::now().format("%H:%M:%S"), view.key());

  match &state.data {
    Some(data) => {
      line.push_str(": ");
      line.push_str(&summarize(view.key().resource(), data));
      if state.is_fetching() {
        line.push_str(" (refreshing)");
      }
    }
    None if state.is_loading() => line.push_str(": loading"),
    None => line.push_str(": no data"),
  }
  if let Some(err) = &state.error {
    line.push_str(&format!(" [{}: {}]", err.kind, err.message));
  }
  line
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = ClinicClient::new(&config)?;
    let engine = sync::init(config.sync_settings(), Arc::new(client));
    let views = bind_views(&engine, &config);
    info!(views = views.len(), backend = %config.backend.url, "watching views");

    Ok(Self {
      config,
      engine,
      views,
      rate_limited: false,
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    enable_raw_mode()?;
    stdout().execute(EnableFocusChange)?;

    let result = self.event_loop().await;

    stdout().execute(DisableFocusChange)?;
    disable_raw_mode()?;

    // Session over: stop polling and drop cached data.
    sync::reset();
    result
  }

  async fn event_loop(&mut self) -> Result<()> {
    let mut events = EventHandler::new(Duration::from_millis(250));
    print_line(&format!(
      "watching {} views on {}  (q quit, r refetch, b background, x reset session)",
      self.views.len(),
      self.config.backend.url
    ));

    while !self.should_quit {
      let step = tokio::select! {
        event = events.next() => Step::Event(event),
        (index, alive) = next_change(&mut self.views) => Step::Changed { index, alive },
      };

      match step {
        Step::Event(Some(event)) => self.handle_event(event).await,
        Step::Event(None) => break,
        Step::Changed { index, alive: true } => print_line(&describe(&self.views[index])),
        Step::Changed { index, alive: false } => {
          self.views.remove(index);
        }
      }
    }

    Ok(())
  }

  async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key).await,
      Event::Focus(visibility) => {
        self.engine.visibility().set(visibility);
      }
      Event::Tick => self.check_rate_limit(),
    }
  }

  async fn handle_key(&mut self, key: crossterm::event::KeyEvent) {
    match key.code {
      KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
        self.should_quit = true;
      }
      KeyCode::Char('r') => self.refetch_all().await,
      KeyCode::Char('b') => {
        let next = match self.engine.visibility().current() {
          Visibility::Foreground => Visibility::Background,
          Visibility::Background => Visibility::Foreground,
        };
        self.engine.visibility().set(next);
        print_line(match next {
          Visibility::Foreground => "polling resumed",
          Visibility::Background => "polling paused",
        });
      }
      KeyCode::Char('x') => self.reset_session(),
      _ => {}
    }
  }

  async fn refetch_all(&self) {
    let outcomes = join_all(self.views.iter().map(|v| v.refetch())).await;
    let fetched = outcomes
      .iter()
      .filter(|o| **o == FetchOutcome::Success)
      .count();
    print_line(&format!("refetched {}/{} views", fetched, outcomes.len()));
  }

  /// Drop every binding, clear the engine, and subscribe again.
  fn reset_session(&mut self) {
    // Bindings must go before the reset so they release their schedulers.
    self.views.clear();
    self.engine.reset();
    self.views = bind_views(&self.engine, &self.config);
    self.rate_limited = false;
    print_line("session reset");
  }

  fn check_rate_limit(&mut self) {
    let limited = self.engine.guard().is_limited();
    if limited == self.rate_limited {
      return;
    }
    self.rate_limited = limited;
    match self.engine.guard().remaining() {
      Some(left) if limited => print_line(&format!(
        "backend busy, polling paused for {}s",
        left.as_secs()
      )),
      _ => print_line("rate limit cleared, polling resumed"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clinic_sync::cache::{Page, Pagination, Record};
  use serde_json::json;

  fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
    values
      .into_iter()
      .filter_map(|v| v.as_object().cloned())
      .collect()
  }

  #[test]
  fn test_summarize_appointment_page() {
    let data = CacheData::Page(Page {
      items: records(vec![
        json!({"_id": "a1", "status": "pending"}),
        json!({"_id": "a2", "status": "done"}),
        json!({"_id": "a3", "status": "pending"}),
      ]),
      pagination: Pagination {
        page: 1,
        limit: 3,
        total: 7,
        total_pages: 3,
      },
    });
    assert_eq!(
      summarize("appointments", &data),
      "3 items (page 1/3, 7 total), 2 pending, 1 done"
    );
  }

  #[test]
  fn test_summarize_unpaid_invoices() {
    let data = CacheData::Collection(records(vec![
      json!({"_id": "i1", "status": "issued", "amount": 40.0}),
      json!({"_id": "i2", "status": "paid", "amount": 99.0}),
      json!({"_id": "i3", "status": "draft", "amount": 10.5}),
    ]));
    assert_eq!(summarize("invoices", &data), "3 items, 50.50 unpaid");
  }

  #[test]
  fn test_summarize_detail() {
    let data = CacheData::Detail(records(vec![json!({"id": 17, "name": "Ana"})]).remove(0));
    assert_eq!(summarize("clients", &data), "entity 17");
  }
}
