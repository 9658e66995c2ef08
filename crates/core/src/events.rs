//! Event System
//!
//! Pub/sub bus for emulator lifecycle notifications.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::debug;

/// Events emitted while an emulator lifecycle runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Ports reserved for an instance
    PortsLeased { command_port: u16, bridge_port: u16 },
    /// Emulator process spawned
    EmulatorLaunched { avd_name: String, command_port: u16 },
    /// Emulator reported its console port on the callback port
    ConsoleReported { port: u16 },
    /// Boot completion signal observed
    BootCompleted { serial: String, elapsed_ms: u64 },
    /// Boot completion signal never observed
    BootTimedOut { serial: String, timeout_ms: u64 },
    /// A console session finished
    ConsoleCommandFinished { command: String, success: bool, timed_out: bool },
    /// One teardown step ran
    TeardownStep { step: String, ok: bool },
    /// Teardown complete
    TornDown { serial: String },
}

/// Subscriber handle for receiving events
#[derive(Clone)]
pub struct EventSubscription {
    receiver: Receiver<Event>,
}

impl EventSubscription {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> Result<Event, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Result<Event, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything received so far
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}

/// Event bus for publish/subscribe pattern
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<Event>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = unbounded();
        self.subscribers.write().push(sender);
        EventSubscription { receiver }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: Event) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for sender in subscribers.iter() {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        debug!("Event {:?} delivered to {} subscribers", event, delivered);
        delivered
    }

    /// Get the number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
