//! Flush scheduling
//!
//! Live updates accumulate in a buffer between ticks. Every tick either
//! drains the whole buffer as one batch or, while paused, leaves it in
//! place. The buffer is unbounded: a long pause grows it without limit and
//! nothing is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kline_types::candle::Candle;
use tokio::time::{self, Interval, MissedTickBehavior};

/// Shared pause flag for the flush loop.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    paused: Arc<AtomicBool>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag, returning the previous value.
    pub fn set(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Result of one flush tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Paused; `pending` updates stay buffered.
    Paused { pending: usize },
    /// Nothing buffered.
    Empty,
    /// The whole buffer, in arrival order.
    Drained(Vec<Candle>),
}

/// Updates buffered between flushes.
#[derive(Debug, Default)]
pub struct FlushBuffer {
    pending: Vec<Candle>,
}

impl FlushBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candle: Candle) {
        self.pending.push(candle);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything buffered unless the gate is closed.
    pub fn drain(&mut self, gate: &PauseGate) -> FlushOutcome {
        if gate.is_paused() {
            return FlushOutcome::Paused {
                pending: self.pending.len(),
            };
        }
        if self.pending.is_empty() {
            return FlushOutcome::Empty;
        }
        FlushOutcome::Drained(std::mem::take(&mut self.pending))
    }
}

/// Periodic flush timer paired with its buffer and pause gate.
pub struct FlushScheduler {
    interval: Interval,
    buffer: FlushBuffer,
    gate: PauseGate,
}

impl FlushScheduler {
    pub fn new(period: Duration, gate: PauseGate) -> Self {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            buffer: FlushBuffer::new(),
            gate,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        self.buffer.push(candle);
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Wait for the next tick and drain. Cancel-safe: the buffer is only
    /// touched after the tick fires.
    pub async fn tick(&mut self) -> FlushOutcome {
        self.interval.tick().await;
        self.buffer.drain(&self.gate)
    }
}
