use std::time::Duration;
use tokio::sync::mpsc;

/// Loop events for the watch command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for binding polling
  Tick,
  /// Ctrl-C
  Interrupt,
}

/// Event handler that produces ticks until interrupted
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      let interrupt = tokio::signal::ctrl_c();
      tokio::pin!(interrupt);
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if tx.send(Event::Tick).is_err() {
              break;
            }
          }
          _ = &mut interrupt => {
            let _ = tx.send(Event::Interrupt);
            break;
          }
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

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_ticks() {
    let mut events = EventHandler::new(Duration::from_millis(5));
    assert_eq!(events.next().await, Some(Event::Tick));
    assert_eq!(events.next().await, Some(Event::Tick));
  }
}
