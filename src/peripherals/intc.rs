//! Interrupt controller: 32 level-sensitive sources with 8-bit priorities.
//!
//! Source inputs come from [`InterruptController::on_gpio`]; the pending
//! bit follows the input level. The output is asserted while any enabled
//! source is pending, and ACTIVE reports which one wins arbitration.

use std::any::Any;

use crate::irq::InterruptAggregator;
use crate::line::Sink;
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::Peripheral;

pub const NUM_SOURCES: usize = 32;

const PRIORITY_BASE: u32 = 0x100;

/// ACTIVE bit 31: the index in bits 0..=4 is valid.
const ACTIVE_VALID: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Enable,
    Pending,
    Active,
}

fn active_word(irq: &InterruptAggregator) -> u32 {
    irq.active().map_or(0, |i| i as u32 | ACTIVE_VALID)
}

fn build_registers(bank: &mut RegisterBank<InterruptAggregator>) {
    bank.define(Registers::Enable, |r| r
        .field(Field::new("ENABLE", 0, 32, Access::ReadWrite)
            .on_read(|s: &mut InterruptAggregator| s.enabled_word())
            .on_write(|s: &mut InterruptAggregator, v| s.set_enabled_word(v)))
        .after_write(|s: &mut InterruptAggregator| {
            s.update();
        }));

    bank.define(Registers::Pending, |r| r
        .field(Field::new("PENDING", 0, 32, Access::ReadOnly)
            .on_read(|s: &mut InterruptAggregator| s.pending_word())));

    bank.define(Registers::Active, |r| r
        .field(Field::new("ACTIVE", 0, 32, Access::ReadOnly)
            .on_read(|s: &mut InterruptAggregator| active_word(s))));

    for i in 0..NUM_SOURCES {
        bank.define_at(PRIORITY_BASE + 4 * i as u32, format!("PRIORITY_{i}"), |r| r
            .field(Field::new("PRIORITY", 0, 8, Access::ReadWrite)
                .on_read(move |s: &mut InterruptAggregator| {
                    s.source(i).map_or(0, |src| src.priority as u32)
                })
                .on_write(move |s: &mut InterruptAggregator, v| s.set_priority(i, v as u8)))
            .strict_reserved(8, 24)
            .after_write(|s: &mut InterruptAggregator| {
                s.update();
            }));
    }
}

pub struct InterruptController {
    name: String,
    bank: RegisterBank<InterruptAggregator>,
    sources: InterruptAggregator,
}

impl InterruptController {
    pub const SIZE: u32 = 0x1000;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut intc = Self {
            name,
            bank,
            sources: InterruptAggregator::priority(NUM_SOURCES),
        };
        intc.reset();
        intc
    }

    /// Level of source input `number` changed.
    pub fn on_gpio(&mut self, number: usize, level: bool) {
        if number >= NUM_SOURCES {
            log::warn!("{}: invalid interrupt source {number}", self.name);
            return;
        }
        self.sources.set_pending(number, level);
        if self.sources.update() {
            log::trace!("{}: asserted, source {:?} active", self.name, self.sources.active());
        }
    }

    /// The winning source, if the output is asserted.
    pub fn active(&self) -> Option<usize> {
        self.sources.active()
    }

    pub fn irq_asserted(&self) -> bool {
        self.sources.is_asserted()
    }
}

impl Peripheral for InterruptController {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        Self::SIZE
    }

    fn read(&mut self, offset: u32) -> u32 {
        self.bank.read(&mut self.sources, offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.bank.write(&mut self.sources, offset, value)
    }

    fn reset(&mut self) {
        self.bank.reset();
        self.sources.reset();
    }

    fn connect_irq(&mut self, sink: Sink) {
        self.sources.connect(sink);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
