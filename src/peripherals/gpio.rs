//! 32-pin GPIO port.
//!
//! DATA reads back the driven value for output pins and the external
//! level for input pins. External levels come in through
//! [`Gpio::set_input`]; output pins ignore them. Each pin can latch an
//! interrupt on a level or on an edge:
//!
//! | IT | EDGE | IP | latches when                  |
//! |----|------|----|-------------------------------|
//! | 0  | -    | 0  | the pin changes to low        |
//! | 0  | -    | 1  | the pin changes to high       |
//! | 1  | 1    | -  | any change                    |
//! | 1  | 0    | 0  | rising edge                   |
//! | 1  | 0    | 1  | falling edge                  |
//!
//! IS is write-one-to-clear.

use std::any::Any;

use crate::irq::InterruptAggregator;
use crate::line::{InterruptLine, Sink};
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::Peripheral;

pub const NUM_PINS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Data,
    Direction,
    InterruptEnable,
    InterruptStatus,
    InterruptType,
    InterruptPolarity,
    InterruptEdge,
}

fn bit(word: u32, pin: usize) -> bool {
    (word >> pin) & 1 != 0
}

pub struct GpioState {
    output: u32,
    input: u32,
    direction: u32,
    interrupt_type: u32,
    polarity: u32,
    both_edges: u32,
    pins: Vec<InterruptLine>,
    irq: InterruptAggregator,
}

impl GpioState {
    fn new() -> Self {
        Self {
            output: 0,
            input: 0,
            direction: 0,
            interrupt_type: 0,
            polarity: 0,
            both_edges: 0,
            pins: (0..NUM_PINS).map(|_| InterruptLine::new()).collect(),
            irq: InterruptAggregator::or(NUM_PINS),
        }
    }

    fn reset(&mut self) {
        self.output = 0;
        self.input = 0;
        self.direction = 0;
        self.interrupt_type = 0;
        self.polarity = 0;
        self.both_edges = 0;
        for pin in self.pins.iter_mut() {
            pin.set(false);
        }
        self.irq.reset();
    }

    fn read_data(&mut self) -> u32 {
        (self.output & self.direction) | (self.input & !self.direction)
    }

    fn write_data(&mut self, value: u32) {
        self.output = (self.output & !self.direction) | (value & self.direction);
        self.drive_outputs();
    }

    fn set_direction(&mut self, value: u32) {
        let changed = self.direction ^ value;
        for pin in (0..NUM_PINS).filter(|p| bit(changed, *p)) {
            log::trace!("GPIO: pin {pin} is now an {}", if bit(value, pin) { "output" } else { "input" });
        }
        self.direction = value;
        self.drive_outputs();
    }

    fn drive_outputs(&mut self) {
        for (i, pin) in self.pins.iter_mut().enumerate() {
            if bit(self.direction, i) && pin.set(bit(self.output, i)) {
                log::trace!("GPIO: pin {i} driven {}", pin.is_set());
            }
        }
    }

    fn triggers(&self, pin: usize, old: bool, new: bool) -> bool {
        if old == new {
            return false;
        }
        let polarity = bit(self.polarity, pin);
        if !bit(self.interrupt_type, pin) {
            return new == polarity;
        }
        if bit(self.both_edges, pin) {
            true
        } else if polarity {
            old && !new
        } else {
            !old && new
        }
    }

    fn set_input(&mut self, pin: usize, level: bool) {
        if pin >= NUM_PINS {
            log::warn!("GPIO: pin {pin} is out of range");
            return;
        }
        if bit(self.direction, pin) {
            log::debug!("GPIO: pin {pin} is an output, ignoring external level");
            return;
        }
        let old = bit(self.input, pin);
        if level {
            self.input |= 1 << pin;
        } else {
            self.input &= !(1 << pin);
        }
        let enabled = self.irq.source(pin).is_some_and(|s| s.enabled);
        if enabled && self.triggers(pin, old, level) {
            log::trace!("GPIO: interrupt latched on pin {pin}");
            self.irq.set_pending(pin, true);
            self.irq.update();
        }
    }

    fn clear_status(&mut self, mask: u32) {
        let pending = self.irq.pending_word();
        self.irq.set_pending_word(pending & !mask);
    }

    fn update_interrupts(&mut self) {
        self.irq.update();
    }
}

fn build_registers(bank: &mut RegisterBank<GpioState>) {
    bank.define(Registers::Data, |r| r
        .field(Field::new("DATA", 0, 32, Access::ReadWrite)
            .on_read(GpioState::read_data)
            .on_write(GpioState::write_data)));

    bank.define(Registers::Direction, |r| r
        .field(Field::new("DIR", 0, 32, Access::ReadWrite)
            .on_write(GpioState::set_direction)));

    bank.define(Registers::InterruptEnable, |r| r
        .field(Field::new("IE", 0, 32, Access::ReadWrite)
            .on_read(|s: &mut GpioState| s.irq.enabled_word())
            .on_write(|s: &mut GpioState, v| s.irq.set_enabled_word(v)))
        .after_write(GpioState::update_interrupts));

    bank.define(Registers::InterruptStatus, |r| r
        .field(Field::new("IS", 0, 32, Access::WriteOneToClear)
            .on_read(|s: &mut GpioState| s.irq.pending_word())
            .on_write(GpioState::clear_status))
        .after_write(GpioState::update_interrupts));

    bank.define(Registers::InterruptType, |r| r
        .field(Field::new("IT", 0, 32, Access::ReadWrite)
            .on_write(|s: &mut GpioState, v| s.interrupt_type = v)));

    bank.define(Registers::InterruptPolarity, |r| r
        .field(Field::new("IP", 0, 32, Access::ReadWrite)
            .on_write(|s: &mut GpioState, v| s.polarity = v)));

    bank.define(Registers::InterruptEdge, |r| r
        .field(Field::new("EDGE", 0, 32, Access::ReadWrite)
            .on_write(|s: &mut GpioState, v| s.both_edges = v)));
}

pub struct Gpio {
    name: String,
    bank: RegisterBank<GpioState>,
    state: GpioState,
}

impl Gpio {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut gpio = Self {
            name,
            bank,
            state: GpioState::new(),
        };
        gpio.reset();
        gpio
    }

    /// Drive an input pin from outside.
    pub fn set_input(&mut self, pin: usize, level: bool) {
        self.state.set_input(pin, level);
    }

    /// Route the output line of `pin`.
    pub fn connect_pin(&mut self, pin: usize, sink: Sink) {
        match self.state.pins.get_mut(pin) {
            Some(line) => line.connect(sink),
            None => log::warn!("{}: pin {pin} is out of range", self.name),
        }
    }

    /// Level currently driven on `pin` (false for inputs and unknown pins).
    pub fn output_level(&self, pin: usize) -> bool {
        self.state.pins.get(pin).is_some_and(|l| l.is_set())
    }

    pub fn irq_asserted(&self) -> bool {
        self.state.irq.is_asserted()
    }
}

impl Peripheral for Gpio {
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

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
