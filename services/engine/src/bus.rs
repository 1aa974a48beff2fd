//! Event bus.
//!
//! Producers push [`Event`]s into a bounded channel; [`EventBus::listen`]
//! drains it and hands every event to each registered listener, in
//! registration order.

use std::sync::Arc;

use flotilla_events::Event;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Receives every event delivered by the bus.
///
/// Called from the bus task; implementations must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

pub struct EventBus {
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    listeners: Vec<(String, Arc<dyn EventListener>)>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx,
            listeners: Vec::new(),
        }
    }

    /// Sender for producers.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    pub fn add_listener(&mut self, name: impl Into<String>, listener: Arc<dyn EventListener>) {
        self.listeners.push((name.into(), listener));
    }

    /// Deliver events until `shutdown` flips to `true` or every sender has
    /// been dropped.
    pub async fn listen(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            tx,
            mut rx,
            listeners,
        } = self;
        // Only producers keep the channel open.
        drop(tx);

        info!(listeners = listeners.len(), "Event bus listening");

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("All event producers gone");
                        break;
                    };
                    for (name, listener) in &listeners {
                        trace!(listener = %name, event = %event, "Dispatching event");
                        listener.on_event(&event);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Event bus stopped");
    }
}
