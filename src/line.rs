//! Single-wire outputs (IRQs, GPIO pins, PWM outputs).

use std::fmt;

/// Receiver of level changes on a line. Attached by whoever routes the
/// line; the owning peripheral never sees it.
pub type Sink = Box<dyn FnMut(bool) + Send>;

/// A level-driven boolean output. The attached sink only hears about
/// transitions, so repeated `set` calls with the same level are free.
#[derive(Default)]
pub struct InterruptLine {
    level: bool,
    sink: Option<Sink>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink. It is told the current level right away when the
    /// line is already asserted.
    pub fn connect(&mut self, mut sink: Sink) {
        if self.level {
            sink(true);
        }
        self.sink = Some(sink);
    }

    pub fn disconnect(&mut self) -> Option<Sink> {
        self.sink.take()
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn is_set(&self) -> bool {
        self.level
    }

    /// Drive the line; returns true if the level changed.
    pub fn set(&mut self, level: bool) -> bool {
        if self.level == level {
            return false;
        }
        self.level = level;
        if let Some(sink) = self.sink.as_mut() {
            sink(level);
        }
        true
    }
}

impl fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptLine")
            .field("level", &self.level)
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, Sink) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        (log, Box::new(move |level| l.lock().unwrap().push(level)))
    }

    #[test]
    fn test_notifies_only_on_change() {
        let (log, sink) = recorder();
        let mut line = InterruptLine::new();
        line.connect(sink);

        assert!(line.set(true));
        assert!(!line.set(true));
        assert!(line.set(false));
        assert!(!line.set(false));
        assert_eq!(*log.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_connect_reports_asserted_level() {
        let (log, sink) = recorder();
        let mut line = InterruptLine::new();
        line.set(true);
        line.connect(sink);
        assert!(line.is_connected());
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_unconnected_line_tracks_level() {
        let mut line = InterruptLine::new();
        line.set(true);
        assert!(line.is_set());
        assert!(line.disconnect().is_none());
    }
}
