use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// A product the picking stage left short, carried on
/// `Event::PickingCompleted` when a partial-fulfillment override was used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shortfall {
    pub product_id: Uuid,
    pub quantity_needed: i32,
    pub quantity_picked: i32,
}

/// Domain events emitted by the fulfillment core. Downstream consumers
/// (shipping, labeling, customer notification) subscribe to the channel;
/// `SessionCompleted` and `OrderReadyToShip` are the completion hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    SessionCreated {
        session_id: Uuid,
        code: String,
        order_ids: Vec<Uuid>,
    },
    PickRecorded {
        session_id: Uuid,
        product_id: Uuid,
        quantity_picked: i32,
        quantity_needed: i32,
    },
    PickingCompleted {
        session_id: Uuid,
        shortfalls: Vec<Shortfall>,
    },
    SessionCompleted {
        session_id: Uuid,
        completed_at: DateTime<Utc>,
    },
    SessionCancelled {
        session_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderReadyToShip {
        order_id: Uuid,
        session_id: Option<Uuid>,
    },
    OrderCancelled {
        order_id: Uuid,
        stock_restored: bool,
    },
    StockMovementRecorded {
        product_id: Uuid,
        delta: i32,
        resulting_stock: i32,
        reference_type: String,
        reference_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Builds a connected sender/receiver pair with the given channel depth.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

/// Consumes the event stream, logging each event. Embedding applications
/// that need to fan events out to carriers or notification systems run
/// their own consumer instead of this loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::SessionCompleted { session_id, .. } => {
                info!(session_id = %session_id, "Session completed");
            }
            Event::OrderReadyToShip { order_id, .. } => {
                info!(order_id = %order_id, "Order ready to ship");
            }
            Event::PickingCompleted { session_id, shortfalls } if !shortfalls.is_empty() => {
                warn!(
                    session_id = %session_id,
                    shortfall_count = shortfalls.len(),
                    "Picking finished short"
                );
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}"));
                info!(event = %payload, "Received event");
            }
        }
    }

    info!("Event processing loop stopped");
}
