//! Interrupt aggregation.
//!
//! Every peripheral reduces some set of (enable, pending) pairs to one
//! output line. Most just OR them; the interrupt controller arbitrates by
//! priority and reports which source won.

use crate::line::{InterruptLine, Sink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptSource {
    pub enabled: bool,
    pub pending: bool,
    pub priority: u8,
}

impl InterruptSource {
    pub fn is_active(&self) -> bool {
        self.enabled && self.pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// Output is the OR of all active sources.
    Or,
    /// Highest priority active source wins, lowest index on ties.
    Priority,
}

/// Highest-priority active source; equal priorities go to the lowest index.
pub fn select(sources: &[InterruptSource]) -> Option<usize> {
    sources
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_active())
        .fold(None, |best: Option<(usize, u8)>, (i, s)| match best {
            Some((_, p)) if p >= s.priority => best,
            _ => Some((i, s.priority)),
        })
        .map(|(i, _)| i)
}

#[derive(Debug)]
pub struct InterruptAggregator {
    sources: Vec<InterruptSource>,
    arbitration: Arbitration,
    line: InterruptLine,
}

impl InterruptAggregator {
    pub fn new(count: usize, arbitration: Arbitration) -> Self {
        assert!(count > 0, "aggregator needs at least one source");
        Self {
            sources: vec![InterruptSource::default(); count],
            arbitration,
            line: InterruptLine::new(),
        }
    }

    pub fn or(count: usize) -> Self {
        Self::new(count, Arbitration::Or)
    }

    pub fn priority(count: usize) -> Self {
        Self::new(count, Arbitration::Priority)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[InterruptSource] {
        &self.sources
    }

    pub fn source(&self, index: usize) -> Option<&InterruptSource> {
        self.sources.get(index)
    }

    pub fn source_mut(&mut self, index: usize) -> Option<&mut InterruptSource> {
        self.sources.get_mut(index)
    }

    /// Set both halves of a level-derived source in one go.
    pub fn set(&mut self, index: usize, enabled: bool, pending: bool) {
        if let Some(s) = self.sources.get_mut(index) {
            s.enabled = enabled;
            s.pending = pending;
        }
    }

    pub fn set_pending(&mut self, index: usize, pending: bool) {
        if let Some(s) = self.sources.get_mut(index) {
            s.pending = pending;
        }
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) {
        if let Some(s) = self.sources.get_mut(index) {
            s.enabled = enabled;
        }
    }

    pub fn set_priority(&mut self, index: usize, priority: u8) {
        if let Some(s) = self.sources.get_mut(index) {
            s.priority = priority;
        }
    }

    /// Bit i = source i pending (first 32 sources).
    pub fn pending_word(&self) -> u32 {
        self.pack(|s| s.pending)
    }

    pub fn enabled_word(&self) -> u32 {
        self.pack(|s| s.enabled)
    }

    pub fn set_pending_word(&mut self, word: u32) {
        self.unpack(word, |s, b| s.pending = b);
    }

    pub fn set_enabled_word(&mut self, word: u32) {
        self.unpack(word, |s, b| s.enabled = b);
    }

    fn pack(&self, bit: impl Fn(&InterruptSource) -> bool) -> u32 {
        self.sources
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, s)| bit(s))
            .fold(0, |w, (i, _)| w | (1 << i))
    }

    fn unpack(&mut self, word: u32, mut set: impl FnMut(&mut InterruptSource, bool)) {
        for (i, s) in self.sources.iter_mut().take(32).enumerate() {
            set(s, (word >> i) & 1 != 0);
        }
    }

    /// The source that currently drives the output, if any. In OR mode
    /// this is simply the first active one.
    pub fn active(&self) -> Option<usize> {
        match self.arbitration {
            Arbitration::Or => self.sources.iter().position(|s| s.is_active()),
            Arbitration::Priority => select(&self.sources),
        }
    }

    /// Re-evaluate the output line. Idempotent; the line only notifies
    /// its sink on a change.
    pub fn update(&mut self) -> bool {
        let level = self.active().is_some();
        self.line.set(level);
        level
    }

    pub fn is_asserted(&self) -> bool {
        self.line.is_set()
    }

    pub fn connect(&mut self, sink: Sink) {
        self.line.connect(sink);
    }

    /// Clear every source and drop the line.
    pub fn reset(&mut self) {
        for s in self.sources.iter_mut() {
            *s = InterruptSource::default();
        }
        self.update();
    }
}
