//! Reconciliation worker.
//!
//! Wires the engine to its event sources. Every event reaching the bus
//! wakes the worker, which runs one reconciliation pass per wake. Wakes
//! that arrive while a pass is queued are coalesced, so a burst of events
//! costs at most one extra pass.

use std::sync::Arc;

use flotilla_events::Event;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace};

use crate::bus::{EventBus, EventListener};
use crate::engine::Engine;
use crate::registry::RegistryEventStream;

/// Bus listener that turns any event into a coalesced wake.
pub struct WakeListener {
    wake: mpsc::Sender<()>,
}

impl WakeListener {
    pub fn new(wake: mpsc::Sender<()>) -> Self {
        Self { wake }
    }
}

impl EventListener for WakeListener {
    fn on_event(&self, event: &Event) {
        match self.wake.try_send(()) {
            Ok(()) => trace!(event = %event, "Queued reconciliation"),
            Err(TrySendError::Full(())) => trace!(event = %event, "Reconciliation already queued"),
            Err(TrySendError::Closed(())) => debug!("Worker gone, dropping wake"),
        }
    }
}

pub struct EngineWorker {
    engine: Arc<Engine>,
    registry_stream: Arc<dyn RegistryEventStream>,
    bus: EventBus,
    wake_rx: mpsc::Receiver<()>,
}

impl EngineWorker {
    /// Create a worker. One wake is queued up front so the first pass runs
    /// as soon as the worker starts.
    pub fn new(
        engine: Arc<Engine>,
        registry_stream: Arc<dyn RegistryEventStream>,
        event_buffer: usize,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let _ = wake_tx.try_send(());

        let mut bus = EventBus::new(event_buffer);
        bus.add_listener("engine", Arc::new(WakeListener::new(wake_tx)));

        Self {
            engine,
            registry_stream,
            bus,
            wake_rx,
        }
    }

    /// Sender for additional event producers, such as the unit-state stream.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.bus.sender()
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// A pass in progress is always finished before shutdown is observed.
    #[instrument(skip_all, fields(machine_id = %self.engine.machine_id()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            engine,
            registry_stream,
            bus,
            mut wake_rx,
        } = self;

        info!("Starting engine worker");

        let stream_handle = tokio::spawn({
            let sink = bus.sender();
            let shutdown = shutdown.clone();
            async move { registry_stream.stream(0, sink, shutdown).await }
        });
        let bus_handle = tokio::spawn(bus.listen(shutdown.clone()));

        let mut passes: u64 = 0;
        loop {
            tokio::select! {
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        debug!("Wake channel closed");
                        break;
                    }
                    engine.reconcile().await;
                    passes += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (task, handle) in [("registry_stream", stream_handle), ("event_bus", bus_handle)] {
            if let Err(e) = handle.await {
                error!(task, error = %e, "Worker task failed");
            }
        }

        info!(passes, "Engine worker stopped");
    }
}
