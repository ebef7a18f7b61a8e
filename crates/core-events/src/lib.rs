//! Signal bus for the device stack.
//!
//! Topics are plain strings (`"pipe;buffer"`, `"interpreter;mode"`, ...) and
//! payloads are the [`Signal`] union below, covering every type the pipe and
//! interpreter publish. Listeners are registered per topic and released by
//! the id returned at registration.
//!
//! Delivery contract:
//! - `publish` invokes listeners synchronously on the publishing thread, in
//!   registration order. Listeners must not block; a GUI or monitor that
//!   needs its own thread forwards the payload through a channel.
//! - A topic with no listeners is not an error; the publish is counted and
//!   dropped.
//! - Registration and release are safe from any thread, including from
//!   inside a listener on a *different* topic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// Telemetry counters, inspectable in tests or logged periodically.
pub static SIGNALS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
pub static SIGNALS_DELIVERED: AtomicU64 = AtomicU64::new(0);
pub static SIGNALS_DROPPED: AtomicU64 = AtomicU64::new(0); // published with no listener

/// Sender-thread lifecycle, observed via the `pipe;thread` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unstarted,
    Started,
    Paused,
    Finished,
    Abort,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Unstarted => "Unstarted",
            ThreadState::Started => "Started",
            ThreadState::Paused => "Paused",
            ThreadState::Finished => "Finished",
            ThreadState::Abort => "Aborted",
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ThreadState::Unstarted => 0,
            ThreadState::Started => 1,
            ThreadState::Paused => 2,
            ThreadState::Finished => 3,
            ThreadState::Abort => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<ThreadState> {
        match code {
            0 => Some(ThreadState::Unstarted),
            1 => Some(ThreadState::Started),
            2 => Some(ThreadState::Paused),
            3 => Some(ThreadState::Finished),
            -1 => Some(ThreadState::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload union for every published topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// `pipe;buffer`: bytes pending in the pipe.
    Buffer(usize),
    /// `pipe;packet`: the exact bytes handed to the driver (32-byte frame,
    /// or the 30-byte payload in mock mode).
    Packet(Vec<u8>),
    /// `pipe;packet_text`: same bytes, published for textual viewers.
    PacketText(Vec<u8>),
    /// `pipe;status`: last 6-byte status word.
    Status([u8; 6]),
    /// `pipe;usb_state`: USB lifecycle code.
    UsbState(i32),
    /// `pipe;usb_status`: display name for the current USB state.
    UsbStatus(String),
    /// `pipe;chipv`: CH341 chip version.
    ChipVersion(i32),
    /// `pipe;thread`: sender-thread lifecycle.
    Thread(ThreadState),
    /// `pipe;wait`: status byte and attempt count while polling.
    Wait { status: u8, attempt: u32 },
    /// `pipe;error`: consecutive refused-connection count at abort.
    Error(u32),
    /// `interpreter;position`: head position after a move, with the prior
    /// position for delta rendering.
    Position { x: i32, y: i32, from_x: i32, from_y: i32 },
    /// `interpreter;mode`: interpreter mode code.
    Mode(u8),
    /// `interpreter;plot`: single plotted step.
    Plot { x: i32, y: i32, on: u8 },
    /// Free-form text payloads (`interpreter;status`, user signals).
    Text(String),
}

type Listener = Box<dyn Fn(&Signal) + Send + Sync>;

/// Handle returned by [`SignalBus::listen`]; pass to `unlisten` to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, Vec<(ListenerId, Listener)>>,
}

/// Cloneable handle to a shared topic registry.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<Mutex<BusInner>>,
    next_id: Arc<AtomicU64>,
}

impl SignalBus {
    pub fn new() -> SignalBus {
        SignalBus::default()
    }

    /// Register `listener` for `topic`.
    pub fn listen<F>(&self, topic: &str, listener: F) -> ListenerId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().expect("bus poisoned");
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Release a listener. Releasing an unknown id is a no-op.
    pub fn unlisten(&self, id: ListenerId) {
        let mut inner = self.inner.lock().expect("bus poisoned");
        for listeners in inner.topics.values_mut() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }

    /// Publish `signal` on `topic`, invoking listeners on this thread.
    pub fn publish(&self, topic: &str, signal: Signal) {
        SIGNALS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
        // Listeners run outside the registry lock; a listener may
        // register/release on other topics during delivery.
        let listeners = {
            let mut inner = self.inner.lock().expect("bus poisoned");
            match inner.topics.get_mut(topic) {
                Some(l) if !l.is_empty() => std::mem::take(l),
                _ => {
                    SIGNALS_DROPPED.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(topic, "signal dropped (no listener)");
                    return;
                }
            }
        };
        for (_, listener) in &listeners {
            listener(&signal);
            SIGNALS_DELIVERED.fetch_add(1, Ordering::Relaxed);
        }
        let mut inner = self.inner.lock().expect("bus poisoned");
        let slot = inner.topics.entry(topic.to_string()).or_default();
        // Listeners registered during delivery land behind the restored set.
        let added = std::mem::take(slot);
        *slot = listeners;
        slot.extend(added);
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("bus poisoned");
        let topics: Vec<(&str, usize)> = inner
            .topics
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("SignalBus").field("topics", &topics).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listen_receives_publish() {
        let bus = SignalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.listen("pipe;buffer", move |s| {
            sink.lock().unwrap().push(s.clone());
        });
        bus.publish("pipe;buffer", Signal::Buffer(42));
        bus.publish("pipe;other", Signal::Buffer(7));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Signal::Buffer(42)]);
    }

    #[test]
    fn unlisten_releases() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let id = bus.listen("pipe;status", move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        });
        bus.publish("pipe;status", Signal::Status([0, 206, 0, 0, 0, 1]));
        bus.unlisten(id);
        bus.publish("pipe;status", Signal::Status([0, 206, 0, 0, 0, 1]));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = SignalBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let sink = order.clone();
            bus.listen("pipe;thread", move |_| {
                sink.lock().unwrap().push(tag);
            });
        }
        bus.publish("pipe;thread", Signal::Thread(ThreadState::Started));
        assert_eq!(order.lock().unwrap().as_slice(), &["a", "b", "c"]);
    }

    #[test]
    fn listener_may_register_during_delivery() {
        let bus = SignalBus::new();
        let bus2 = bus.clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        bus.listen("pipe;wait", move |_| {
            let fired3 = fired2.clone();
            bus2.listen("pipe;error", move |_| {
                fired3.fetch_add(1, Ordering::Relaxed);
            });
        });
        bus.publish("pipe;wait", Signal::Wait { status: 206, attempt: 0 });
        bus.publish("pipe;error", Signal::Error(5));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn thread_state_codes_round_trip() {
        for state in [
            ThreadState::Unstarted,
            ThreadState::Started,
            ThreadState::Paused,
            ThreadState::Finished,
            ThreadState::Abort,
        ] {
            assert_eq!(ThreadState::from_code(state.code()), Some(state));
        }
        assert_eq!(ThreadState::from_code(99), None);
    }
}
