use crossterm::event::{self, Event as CrosstermEvent, KeyEvent, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;

use clinic_sync::sync::Visibility;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Terminal key press
  Key(KeyEvent),
  /// Terminal gained or lost focus
  Focus(Visibility),
  /// Periodic tick for status checks
  Tick,
}

/// Event handler that produces events from terminal input and a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // crossterm reads block, so keep them off the async workers.
    tokio::task::spawn_blocking(move || {
      while !tx.is_closed() {
        let event = if event::poll(tick_rate).unwrap_or(false) {
          match event::read() {
            Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => Event::Key(key),
            Ok(CrosstermEvent::FocusGained) => Event::Focus(Visibility::Foreground),
            Ok(CrosstermEvent::FocusLost) => Event::Focus(Visibility::Background),
            _ => continue,
          }
        } else {
          Event::Tick
        };
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
