//! Scoped view of the shared connection for one consumer.
//!
//! A [`Session`] subscribes to the manager when created and unsubscribes when
//! dropped, so a consumer that goes away cannot leave listeners behind.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ConnectionManager;
use crate::listeners::Subscription;
use crate::protocol::{Inbound, WireMessage};

/// What a session observes, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message(Inbound),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Call `connect()` on attach. Idempotent if already connected.
    pub auto_connect: bool,
    /// Send `roster_request` after every (re)connect so presence is rebuilt
    /// from the relay's roster instead of the event stream alone.
    pub request_roster_on_connect: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            request_roster_on_connect: true,
        }
    }
}

pub struct Session {
    manager: ConnectionManager,
    subscriptions: Vec<Subscription>,
    last_message: Arc<Mutex<Option<Inbound>>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Session {
    pub fn attach(manager: &ConnectionManager) -> Self {
        Self::with_options(manager, SessionOptions::default())
    }

    pub fn with_options(manager: &ConnectionManager, options: SessionOptions) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let last_message = Arc::new(Mutex::new(None));
        let mut subscriptions = Vec::with_capacity(3);

        {
            let tx = tx.clone();
            let last = Arc::clone(&last_message);
            subscriptions.push(manager.on_message(move |inbound| {
                if let Ok(mut slot) = last.lock() {
                    *slot = Some(inbound.clone());
                }
                let _ = tx.send(SessionEvent::Message(inbound.clone()));
            }));
        }
        {
            let tx = tx.clone();
            let roster_via = options
                .request_roster_on_connect
                .then(|| manager.clone());
            subscriptions.push(manager.on_connect(move || {
                let _ = tx.send(SessionEvent::Connected);
                if let Some(manager) = &roster_via {
                    if manager.send(&WireMessage::RosterRequest) {
                        debug!("roster requested after connect");
                    }
                }
            }));
        }
        subscriptions.push(manager.on_disconnect(move || {
            let _ = tx.send(SessionEvent::Disconnected);
        }));

        if options.auto_connect {
            manager.connect();
        }

        Self {
            manager: manager.clone(),
            subscriptions,
            last_message,
            events,
        }
    }

    /// Read from the manager, so it cannot drift from the real socket state
    /// when events from an old and a new socket interleave.
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// The most recent inbound frame, if any arrived while attached.
    pub fn last_message(&self) -> Option<Inbound> {
        self.last_message.lock().ok().and_then(|slot| slot.clone())
    }

    /// See [`ConnectionManager::send`].
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        self.manager.send(message)
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.manager.send_text(text)
    }

    /// Wait for the next event. Pending forever while nothing happens.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for sub in self.subscriptions.drain(..) {
            self.manager.unsubscribe(sub);
        }
    }
}
