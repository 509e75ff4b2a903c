//! Wake-ups from interrupt context to the tasks consuming the rings.

use core::sync::atomic::{AtomicUsize, Ordering};

use event_listener::{Event, EventListener};

/// A wake-up primitive the interrupt handler uses to notify tasks.
///
/// Both methods are called in interrupt context and must not block.
pub trait CompletionSignal: Send + Sync {
    /// Received frames are waiting on the ready list.
    fn rx_ready(&self);

    /// Transmit descriptors were reclaimed.
    fn tx_ready(&self);
}

/// Signal that drops every notification.
impl CompletionSignal for () {
    fn rx_ready(&self) {}

    fn tx_ready(&self) {}
}

/// [`CompletionSignal`] backed by one [`Event`] per direction.
///
/// Tasks register a listener first, re-check the ring, then await the
/// listener, so a notification fired in between is never lost.
pub struct EventSignal {
    rx: Event,
    tx: Event,
    rx_count: AtomicUsize,
    tx_count: AtomicUsize,
}

impl EventSignal {
    pub const fn new() -> Self {
        Self {
            rx: Event::new(),
            tx: Event::new(),
            rx_count: AtomicUsize::new(0),
            tx_count: AtomicUsize::new(0),
        }
    }

    /// Listener woken by the next [`CompletionSignal::rx_ready`].
    pub fn listen_rx(&self) -> EventListener {
        self.rx.listen()
    }

    /// Listener woken by the next [`CompletionSignal::tx_ready`].
    pub fn listen_tx(&self) -> EventListener {
        self.tx.listen()
    }

    /// Number of receive notifications so far.
    pub fn rx_notifications(&self) -> usize {
        self.rx_count.load(Ordering::Relaxed)
    }

    /// Number of transmit notifications so far.
    pub fn tx_notifications(&self) -> usize {
        self.tx_count.load(Ordering::Relaxed)
    }
}

impl Default for EventSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal for EventSignal {
    fn rx_ready(&self) {
        self.rx_count.fetch_add(1, Ordering::Relaxed);
        self.rx.notify(1);
    }

    fn tx_ready(&self) {
        self.tx_count.fetch_add(1, Ordering::Relaxed);
        self.tx.notify(usize::MAX);
    }
}
