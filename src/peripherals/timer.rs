//! Up-counting timer with four compare channels and PWM outputs.
//!
//! The counter advances from [`Peripheral::tick`] (or [`Timer::advance`]),
//! once every `PRESCALER + 1` ticks. The main IRQ is the OR of the overflow
//! interrupt and every compare interrupt; each compare channel also has
//! its own line.

use std::any::Any;

use crate::counter::{CompareChannel, TimerChannel, TimerMode};
use crate::irq::InterruptAggregator;
use crate::line::{InterruptLine, Sink};
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::Peripheral;

pub const NUM_COMPARE: usize = 4;

const COMPARE_BASE: u32 = 0x20;
const COMPARE_STRIDE: u32 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Control,
    Value,
    Reload,
    Prescaler,
    Status,
    PwmControl,
}

const IRQ_OVERFLOW: usize = 0;

fn irq_compare(ch: usize) -> usize {
    1 + ch
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PwmMode {
    /// Output high while the counter is below the compare target.
    #[default]
    EdgeAligned,
    /// Output toggles on every compare match.
    CenterAligned,
}

pub struct TimerState {
    counter: TimerChannel,
    enable_request: bool,
    overflow_ie: bool,
    overflow: bool,
    compare: [CompareChannel; NUM_COMPARE],
    compare_lines: Vec<InterruptLine>,
    pwm_enabled: bool,
    pwm_mode: PwmMode,
    pwm_lines: Vec<InterruptLine>,
    irq: InterruptAggregator,
}

impl TimerState {
    fn new() -> Self {
        Self {
            counter: TimerChannel::new(u32::MAX),
            enable_request: false,
            overflow_ie: false,
            overflow: false,
            compare: [CompareChannel::default(); NUM_COMPARE],
            compare_lines: (0..NUM_COMPARE).map(|_| InterruptLine::new()).collect(),
            pwm_enabled: false,
            pwm_mode: PwmMode::EdgeAligned,
            pwm_lines: (0..NUM_COMPARE).map(|_| InterruptLine::new()).collect(),
            irq: InterruptAggregator::or(1 + NUM_COMPARE),
        }
    }

    fn reset(&mut self) {
        self.counter.reset(u32::MAX);
        self.enable_request = false;
        self.overflow_ie = false;
        self.overflow = false;
        self.compare = [CompareChannel::default(); NUM_COMPARE];
        self.pwm_enabled = false;
        self.pwm_mode = PwmMode::EdgeAligned;
        for line in self.pwm_lines.iter_mut() {
            line.set(false);
        }
        self.update_interrupts();
    }

    fn tick(&mut self) {
        let tick = self.counter.tick();
        if tick.overflow {
            log::trace!("timer: overflow");
            self.overflow = true;
        }
        if tick.advanced {
            let value = self.counter.value();
            for ch in 0..NUM_COMPARE {
                self.check_compare(ch, value);
            }
            self.refresh_pwm();
            self.update_interrupts();
        }
    }

    fn check_compare(&mut self, ch: usize, value: u32) {
        if !self.compare[ch].check(value) {
            return;
        }
        log::trace!("timer: compare match on channel {ch} at {value}");
        if self.pwm_enabled && self.pwm_mode == PwmMode::CenterAligned {
            let line = &mut self.pwm_lines[ch];
            let level = !line.is_set();
            line.set(level);
        }
    }

    fn refresh_pwm(&mut self) {
        if self.pwm_mode == PwmMode::CenterAligned && self.pwm_enabled {
            return;
        }
        let value = self.counter.value();
        for (line, cmp) in self.pwm_lines.iter_mut().zip(self.compare.iter()) {
            line.set(self.pwm_enabled && value < cmp.target);
        }
    }

    fn apply_control(&mut self) {
        self.counter.set_enabled(self.enable_request);
        self.update_interrupts();
    }

    fn set_one_shot(&mut self, value: u32) {
        let mode = if value != 0 { TimerMode::OneShot } else { TimerMode::Periodic };
        self.counter.set_mode(mode);
    }

    fn set_value(&mut self, value: u32) {
        self.counter.set_value(value);
        self.refresh_pwm();
    }

    fn set_prescaler(&mut self, value: u32) {
        self.counter.set_prescaler(value + 1);
    }

    fn set_compare(&mut self, ch: usize, target: u32) {
        self.compare[ch].target = target;
        // A target equal to the running value matches right away
        if self.counter.is_enabled() {
            self.check_compare(ch, self.counter.value());
        }
        self.refresh_pwm();
        self.update_interrupts();
    }

    fn set_pwm_mode(&mut self, value: u32) {
        self.pwm_mode = match value {
            0 => PwmMode::EdgeAligned,
            1 => PwmMode::CenterAligned,
            _ => {
                log::warn!("timer: PWM mode {value} is reserved, using edge-aligned");
                PwmMode::EdgeAligned
            }
        };
    }

    fn update_interrupts(&mut self) {
        self.irq.set(IRQ_OVERFLOW, self.overflow_ie, self.overflow);
        for (ch, cmp) in self.compare.iter().enumerate() {
            self.irq.set(irq_compare(ch), cmp.interrupt_enabled, cmp.pending);
            self.compare_lines[ch].set(cmp.is_active());
        }
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<TimerState>) {
    bank.define(Registers::Control, |r| r
        .field(Field::flag("ENABLE", 0, Access::ReadWrite)
            .on_read(|s: &mut TimerState| flag(s.counter.is_enabled()))
            .on_write(|s: &mut TimerState, v| s.enable_request = v != 0))
        .field(Field::flag("OVF_IE", 1, Access::ReadWrite)
            .on_write(|s: &mut TimerState, v| s.overflow_ie = v != 0))
        .field(Field::flag("ONE_SHOT", 2, Access::ReadWrite)
            .on_write(TimerState::set_one_shot))
        .reserved(3, 29)
        .after_write(TimerState::apply_control));

    bank.define(Registers::Value, |r| r
        .field(Field::new("VALUE", 0, 32, Access::ReadWrite)
            .on_read(|s: &mut TimerState| s.counter.value())
            .on_write(TimerState::set_value))
        .after_write(TimerState::update_interrupts));

    bank.define(Registers::Reload, |r| r
        .field(Field::new("RELOAD", 0, 32, Access::ReadWrite)
            .with_reset(u32::MAX)
            .on_read(|s: &mut TimerState| s.counter.limit())
            .on_write(|s: &mut TimerState, v| s.counter.set_limit(v))));

    bank.define(Registers::Prescaler, |r| r
        .field(Field::new("PRESCALER", 0, 16, Access::ReadWrite)
            .on_write(TimerState::set_prescaler))
        .reserved(16, 16));

    bank.define(Registers::Status, |r| r
        .field(Field::flag("OVF", 0, Access::WriteOneToClear)
            .on_read(|s: &mut TimerState| flag(s.overflow))
            .on_write(|s: &mut TimerState, _| s.overflow = false))
        .reserved(1, 31)
        .after_write(TimerState::update_interrupts));

    bank.define(Registers::PwmControl, |r| r
        .field(Field::flag("PWM_EN", 0, Access::ReadWrite)
            .on_write(|s: &mut TimerState, v| s.pwm_enabled = v != 0))
        .field(Field::new("PWM_MODE", 8, 2, Access::ReadWrite)
            .on_write(TimerState::set_pwm_mode))
        .reserved(1, 7)
        .reserved(10, 22)
        .after_write(TimerState::refresh_pwm));

    for ch in 0..NUM_COMPARE {
        let base = COMPARE_BASE + COMPARE_STRIDE * ch as u32;
        bank.define_at(base, format!("COMPARE{ch}"), |r| r
            .field(Field::new("TARGET", 0, 32, Access::ReadWrite)
                .on_read(move |s: &mut TimerState| s.compare[ch].target)
                .on_write(move |s: &mut TimerState, v| s.set_compare(ch, v))));

        bank.define_at(base + 4, format!("CMP_CTRL{ch}"), |r| r
            .field(Field::flag("IE", 0, Access::ReadWrite)
                .on_write(move |s: &mut TimerState, v| s.compare[ch].interrupt_enabled = v != 0))
            .field(Field::flag("STATUS", 1, Access::WriteOneToClear)
                .on_read(move |s: &mut TimerState| flag(s.compare[ch].pending))
                .on_write(move |s: &mut TimerState, _| s.compare[ch].clear()))
            .reserved(2, 30)
            .after_write(TimerState::update_interrupts));
    }
}

pub struct Timer {
    name: String,
    bank: RegisterBank<TimerState>,
    state: TimerState,
}

impl Timer {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut timer = Self {
            name,
            bank,
            state: TimerState::new(),
        };
        timer.reset();
        timer
    }

    /// `n` ticks of the input clock.
    pub fn advance(&mut self, n: u32) {
        for _ in 0..n {
            self.state.tick();
        }
    }

    pub fn value(&self) -> u32 {
        self.state.counter.value()
    }

    pub fn connect_compare(&mut self, ch: usize, sink: Sink) {
        match self.state.compare_lines.get_mut(ch) {
            Some(line) => line.connect(sink),
            None => log::warn!("{}: compare channel {ch} out of range", self.name),
        }
    }

    pub fn connect_pwm(&mut self, ch: usize, sink: Sink) {
        match self.state.pwm_lines.get_mut(ch) {
            Some(line) => line.connect(sink),
            None => log::warn!("{}: PWM channel {ch} out of range", self.name),
        }
    }

    pub fn pwm_level(&self, ch: usize) -> bool {
        self.state.pwm_lines.get(ch).is_some_and(|l| l.is_set())
    }

    pub fn compare_asserted(&self, ch: usize) -> bool {
        self.state.compare_lines.get(ch).is_some_and(|l| l.is_set())
    }

    pub fn irq_asserted(&self) -> bool {
        self.state.irq.is_asserted()
    }
}

impl Peripheral for Timer {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        Self::SIZE
    }

    fn read(&mut self, offset: u32) -> u32 {
        self.bank.read(&mut self.state, offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.bank.write(&mut self.state, offset, value)
    }

    fn reset(&mut self) {
        self.bank.reset();
        self.state.reset();
    }

    fn connect_irq(&mut self, sink: Sink) {
        self.state.irq.connect(sink);
    }

    fn tick(&mut self) {
        self.state.tick();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const CONTROL: u32 = 0x00;
    const VALUE: u32 = 0x04;
    const RELOAD: u32 = 0x08;
    const PRESCALER: u32 = 0x0c;
    const STATUS: u32 = 0x10;
    const PWM_CONTROL: u32 = 0x14;

    const EN: u32 = 1 << 0;
    const OVF_IE: u32 = 1 << 1;
    const ONE_SHOT: u32 = 1 << 2;

    fn compare(ch: u32) -> u32 {
        0x20 + 0x10 * ch
    }

    fn cmp_ctrl(ch: u32) -> u32 {
        compare(ch) + 4
    }

    #[test]
    fn test_reset_values() {
        let mut timer = Timer::new("tim0");
        assert_eq!(timer.read(RELOAD), u32::MAX);
        assert_eq!(timer.read(CONTROL), 0);
        assert_eq!(timer.read(VALUE), 0);
    }

    #[test]
    fn test_overflow_on_limit_tick() {
        let mut timer = Timer::new("tim0");
        timer.write(RELOAD, 10);
        timer.write(CONTROL, EN | OVF_IE);

        timer.advance(9);
        assert_eq!(timer.read(VALUE), 9);
        assert!(!timer.irq_asserted());

        timer.tick();
        assert_eq!(timer.read(VALUE), 0);
        assert_eq!(timer.read(STATUS), 1);
        assert!(timer.irq_asserted());

        timer.write(STATUS, 1);
        assert_eq!(timer.read(STATUS), 0);
        assert!(!timer.irq_asserted());
    }

    #[test]
    fn test_one_shot_stops() {
        let mut timer = Timer::new("tim0");
        timer.write(RELOAD, 3);
        timer.write(CONTROL, EN | ONE_SHOT);
        timer.advance(5);
        assert_eq!(timer.read(VALUE), 3);
        assert_eq!(timer.read(CONTROL) & EN, 0);
        assert_eq!(timer.read(STATUS), 1);
    }

    #[test]
    fn test_prescaler() {
        let mut timer = Timer::new("tim0");
        timer.write(PRESCALER, 3);
        timer.write(CONTROL, EN);
        timer.advance(7);
        assert_eq!(timer.value(), 1);
        timer.tick();
        assert_eq!(timer.value(), 2);
        assert_eq!(timer.read(PRESCALER), 3);
    }

    #[test]
    fn test_compare_latches_once_per_value() {
        let mut timer = Timer::new("tim0");
        timer.write(compare(1), 3);
        timer.write(cmp_ctrl(1), 1);
        timer.write(PRESCALER, 1);
        timer.write(CONTROL, EN);

        timer.advance(5);
        assert_eq!(timer.read(cmp_ctrl(1)) & 0b10, 0);
        timer.tick();
        assert_eq!(timer.value(), 3);
        assert_eq!(timer.read(cmp_ctrl(1)), 0b11);
        assert!(timer.compare_asserted(1));
        assert!(timer.irq_asserted());

        // Clear while the counter dwells on the target: no re-latch
        timer.write(cmp_ctrl(1), 0b11);
        assert!(!timer.compare_asserted(1));
        timer.tick();
        assert_eq!(timer.value(), 3);
        assert_eq!(timer.read(cmp_ctrl(1)), 0b01);
        assert!(!timer.irq_asserted());
    }

    #[test]
    fn test_compare_write_matches_running_value() {
        let mut timer = Timer::new("tim0");
        timer.write(CONTROL, EN);
        timer.advance(4);
        timer.write(compare(0), 4);
        assert_eq!(timer.read(cmp_ctrl(0)), 0b10);

        // Stopped timers do not match on write
        timer.write(CONTROL, 0);
        timer.write(compare(2), 4);
        assert_eq!(timer.read(cmp_ctrl(2)), 0);
    }

    #[test]
    fn test_edge_aligned_pwm() {
        let levels = Arc::new(Mutex::new(Vec::new()));
        let l = levels.clone();
        let mut timer = Timer::new("tim0");
        timer.connect_pwm(0, Box::new(move |v| l.lock().unwrap().push(v)));
        timer.write(RELOAD, 4);
        timer.write(compare(0), 2);
        timer.write(PWM_CONTROL, 1);
        assert!(timer.pwm_level(0));

        timer.write(CONTROL, EN);
        timer.advance(4);
        assert!(timer.pwm_level(0));
        assert_eq!(*levels.lock().unwrap(), [true, false, true]);

        timer.write(PWM_CONTROL, 0);
        assert!(!timer.pwm_level(0));
    }

    #[test]
    fn test_center_aligned_pwm_toggles() {
        let mut timer = Timer::new("tim0");
        timer.write(RELOAD, 4);
        timer.write(compare(3), 1);
        timer.write(PWM_CONTROL, 1 << 8 | 1);
        timer.write(CONTROL, EN);

        timer.tick();
        assert!(timer.pwm_level(3));
        timer.advance(3);
        assert!(timer.pwm_level(3));
        timer.advance(2);
        assert!(!timer.pwm_level(3));
        assert_eq!(timer.read(PWM_CONTROL), 0x101);
    }
}
