//! Timer counting and compare channels.
//!
//! A [`TimerChannel`] counts up from 0 towards its limit, once every
//! `prescaler` external ticks. Reaching the limit is an overflow: periodic
//! timers wrap to 0 on the same tick, one-shot timers stop at the limit.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    #[default]
    Periodic,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    /// The counter value changed.
    pub advanced: bool,
    /// The limit was reached. At most once per tick.
    pub overflow: bool,
}

#[derive(Debug, Clone)]
pub struct TimerChannel {
    value: u32,
    limit: u32,
    prescaler: u32,
    prescale_count: u32,
    mode: TimerMode,
    enabled: bool,
}

impl TimerChannel {
    pub fn new(limit: u32) -> Self {
        Self {
            value: 0,
            limit,
            prescaler: 1,
            prescale_count: 0,
            mode: TimerMode::Periodic,
            enabled: false,
        }
    }

    pub fn reset(&mut self, limit: u32) {
        *self = Self::new(limit);
    }

    pub fn tick(&mut self) -> Tick {
        if !self.enabled {
            return Tick::default();
        }

        self.prescale_count += 1;
        if self.prescale_count < self.prescaler {
            return Tick::default();
        }
        self.prescale_count = 0;

        let next = self.value.wrapping_add(1);
        if self.value >= self.limit || next >= self.limit {
            match self.mode {
                TimerMode::Periodic => self.value = 0,
                TimerMode::OneShot => {
                    self.value = self.limit;
                    self.enabled = false;
                }
            }
            return Tick { advanced: true, overflow: true };
        }

        self.value = next;
        Tick { advanced: true, overflow: false }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Values beyond the limit are clamped to it.
    pub fn set_value(&mut self, value: u32) {
        if value > self.limit {
            log::warn!("timer value 0x{value:x} beyond limit 0x{:x}, clamped", self.limit);
        }
        self.value = value.min(self.limit);
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// A limit below the current value restarts the count from 0.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        if self.value > limit {
            self.value = 0;
        }
    }

    pub fn prescaler(&self) -> u32 {
        self.prescaler
    }

    /// Ticks per increment. Zero is rejected.
    pub fn set_prescaler(&mut self, divisor: u32) -> bool {
        if divisor == 0 {
            log::warn!("timer prescaler divisor 0 ignored");
            return false;
        }
        self.prescaler = divisor;
        self.prescale_count = 0;
        true
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TimerMode) {
        self.mode = mode;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.prescale_count = 0;
            // A one-shot that already expired starts over
            if self.value >= self.limit && self.mode == TimerMode::OneShot {
                self.value = 0;
            }
        }
        self.enabled = enabled;
    }
}

/// Comparator against a timer's running value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompareChannel {
    pub target: u32,
    pub interrupt_enabled: bool,
    pub pending: bool,
}

impl CompareChannel {
    /// Latch a match if `value` equals the target.
    pub fn check(&mut self, value: u32) -> bool {
        if value == self.target {
            self.pending = true;
            return true;
        }
        false
    }

    pub fn is_active(&self) -> bool {
        self.interrupt_enabled && self.pending
    }

    pub fn clear(&mut self) {
        self.pending = false;
    }
}
