//! Local unit-state stream.
//!
//! Turns batches of unit status changes from the service manager into
//! `unit.state_updated` events on the bus.

use std::collections::HashMap;

use flotilla_events::{translate_unit_status_events, Event, UnitStatus};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// A batch of unit changes keyed by unit name. `None` marks a unit that
/// disappeared.
pub type UnitChanges = HashMap<String, Option<UnitStatus>>;

/// Forward translated unit changes to `events` until shutdown, until the
/// batch source closes, or until the bus goes away.
pub async fn run_unit_state_stream(
    mut changes: mpsc::Receiver<UnitChanges>,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Unit state stream started");

    loop {
        tokio::select! {
            batch = changes.recv() => {
                let Some(batch) = batch else {
                    debug!("Unit change source closed");
                    break;
                };

                debug!(units = batch.len(), "Translating unit changes");
                for event in translate_unit_status_events(&batch) {
                    if events.send(event).await.is_err() {
                        debug!("Event bus closed, stopping unit state stream");
                        return;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Unit state stream stopped");
}
