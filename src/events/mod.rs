//! In-process dispatch of device lifecycle events.
//!
//! Handlers subscribe per [`EventKind`]. Dispatch is synchronous: the caller
//! awaits every handler, in subscription order, and gets the first failure.
//! Events for one device are delivered while holding that device's
//! [`DeviceTurn`], so they reach handlers in the order they were raised.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{DeviceSnapshot, DeviceStatus};
use crate::locks::{KeyGuard, KeyedLocks};

/// Raised when a device's status changes. `device` is the state before the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusChangedEvent {
    pub device: DeviceSnapshot,
    pub status: DeviceStatus,
}

/// Raised when a device's sample frequency changes. `device` is the state
/// before the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceFrequencyChangedEvent {
    pub device: DeviceSnapshot,
    pub frequency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceEvent {
    StatusChanged(DeviceStatusChangedEvent),
    FrequencyChanged(DeviceFrequencyChangedEvent),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::StatusChanged(_) => EventKind::StatusChanged,
            DeviceEvent::FrequencyChanged(_) => EventKind::FrequencyChanged,
        }
    }

    pub fn device_id(&self) -> Uuid {
        match self {
            DeviceEvent::StatusChanged(e) => e.device.id,
            DeviceEvent::FrequencyChanged(e) => e.device.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusChanged,
    FrequencyChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::StatusChanged => f.write_str("status-changed"),
            EventKind::FrequencyChanged => f.write_str("frequency-changed"),
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DeviceEvent, cancel: CancellationToken)
        -> Result<(), HandlerError>;
}

/// Dispatch error types.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{kind} handler failed for device {device_id}: {reason}")]
    Handler {
        kind: EventKind,
        device_id: Uuid,
        reason: HandlerError,
    },
    #[error("event bus is shut down")]
    Cancelled,
}

/// Exclusive access to one device's event stream.
pub struct DeviceTurn {
    device_id: Uuid,
    _guard: KeyGuard<Uuid>,
}

impl DeviceTurn {
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }
}

pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    turns: KeyedLocks<Uuid>,
    shutdown: CancellationToken,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            turns: KeyedLocks::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push(handler);
    }

    pub async fn has_subscribers(&self, kind: EventKind) -> bool {
        let handlers = self.handlers.read().await;
        handlers.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Wait for exclusive access to `device_id`'s events.
    ///
    /// Hold the turn across read, persist and [`EventBus::dispatch`] so that
    /// concurrent writers of the same device are serialized.
    pub async fn turn(&self, device_id: Uuid) -> DeviceTurn {
        DeviceTurn {
            device_id,
            _guard: self.turns.lock(device_id).await,
        }
    }

    /// Deliver `events` to their subscribers in order.
    ///
    /// Returns the number of handler invocations.
    pub async fn dispatch(
        &self,
        turn: &DeviceTurn,
        events: Vec<DeviceEvent>,
    ) -> Result<usize, DispatchError> {
        if events.is_empty() {
            return Ok(0);
        }
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let handlers = self.handlers.read().await.clone();
        let mut delivered = 0;

        for event in &events {
            debug_assert_eq!(event.device_id(), turn.device_id());
            let kind = event.kind();
            let Some(subscribers) = handlers.get(&kind) else {
                continue;
            };

            for handler in subscribers {
                handler
                    .handle(event, self.shutdown.child_token())
                    .await
                    .map_err(|reason| DispatchError::Handler {
                        kind,
                        device_id: event.device_id(),
                        reason,
                    })?;
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Cancel in-flight handlers and refuse further dispatch.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
