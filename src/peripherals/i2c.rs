//! I2C master.
//!
//! A transaction is START, any number of DATA writes, then STOP. The bytes
//! queued in between are delivered to the attached target in one call at
//! STOP; its return value is the acknowledge. Bytes coming back from the
//! target side arrive through [`SerialInput`] and are read from DATA. The
//! target runs with the state lock released, so it may answer through
//! that same input from inside the call.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::fifo::{Fifo, FIFO_DEPTH};
use crate::irq::InterruptAggregator;
use crate::line::Sink;
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::{lock, Peripheral, SerialInput};

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Control,
    Data,
    Status,
    ClockDiv,
}

/// DATA reads this when nothing has been received.
const EMPTY_READ: u32 = 0xff;

pub type I2cTarget = Box<dyn FnMut(u8, &[u8]) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Start,
    Data,
}

pub struct I2cState {
    tx: Fifo,
    rx: Fifo,
    enabled: bool,
    master: bool,
    ack_enabled: bool,
    irq_enabled: bool,
    address: u8,
    clock_div: u32,
    bus: BusState,
    start_requested: bool,
    stop_requested: bool,
    ack_received: bool,
    done: bool,
    /// Address and payload of a STOP waiting for the target's answer.
    pending: Option<(u8, Vec<u8>)>,
    irq: InterruptAggregator,
}

impl I2cState {
    fn new() -> Self {
        Self {
            tx: Fifo::new(FIFO_DEPTH),
            rx: Fifo::new(FIFO_DEPTH),
            enabled: false,
            master: false,
            ack_enabled: false,
            irq_enabled: false,
            address: 0,
            clock_div: 0,
            bus: BusState::Idle,
            start_requested: false,
            stop_requested: false,
            ack_received: false,
            done: false,
            pending: None,
            irq: InterruptAggregator::or(1),
        }
    }

    fn reset(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.enabled = false;
        self.master = false;
        self.ack_enabled = false;
        self.irq_enabled = false;
        self.address = 0;
        self.clock_div = 0;
        self.bus = BusState::Idle;
        self.start_requested = false;
        self.stop_requested = false;
        self.ack_received = false;
        self.done = false;
        self.pending = None;
        self.update_interrupts();
    }

    /// START and STOP act once the whole CONTROL word is in, so they see
    /// the address written alongside them.
    fn control_written(&mut self) {
        if std::mem::take(&mut self.start_requested) {
            self.start();
        }
        if std::mem::take(&mut self.stop_requested) {
            self.stop();
        }
        self.update_interrupts();
    }

    fn start(&mut self) {
        if !(self.enabled && self.master) {
            log::warn!("I2C: START ignored, controller not enabled as master");
            return;
        }
        if self.bus != BusState::Idle {
            log::debug!("I2C: repeated START");
        }
        self.tx.clear();
        self.bus = BusState::Start;
        log::debug!("I2C: START to 0x{:02x}", self.address);
    }

    fn stop(&mut self) {
        if self.bus == BusState::Idle {
            log::debug!("I2C: STOP without START ignored");
            return;
        }
        let payload: Vec<u8> = self.tx.drain().collect();
        self.pending = Some((self.address, payload));
    }

    fn finish_stop(&mut self, address: u8, len: usize, ack: bool) {
        self.ack_received = ack;
        log::debug!("I2C: STOP after {len} byte(s) to 0x{address:02x}, {}",
            if ack { "ACK" } else { "NACK" });
        self.bus = BusState::Idle;
        self.done = true;
        self.update_interrupts();
    }

    fn read_data(&mut self) -> u32 {
        let v = self.rx.pop().map_or(EMPTY_READ, u32::from);
        self.update_interrupts();
        v
    }

    fn write_data(&mut self, value: u32) {
        if self.bus == BusState::Idle {
            log::debug!("I2C: DATA write outside a transaction, queued anyway");
        } else {
            self.bus = BusState::Data;
        }
        if !self.tx.push(value as u8) {
            log::warn!("I2C: TX FIFO full, dropping 0x{value:02x}");
        }
    }

    fn receive(&mut self, byte: u8) {
        if !self.ack_enabled {
            log::trace!("I2C: received 0x{byte:02x} with ACK disabled");
        }
        if !self.rx.push(byte) {
            log::warn!("I2C: RX FIFO full, dropping 0x{byte:02x}");
        }
        self.update_interrupts();
    }

    fn set_clock_div(&mut self, value: u32) {
        if value == 0 {
            log::warn!("I2C: clock divider 0 is invalid");
        }
        self.clock_div = value;
    }

    fn update_interrupts(&mut self) {
        self.irq.set(0, self.irq_enabled, self.done);
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<I2cState>) {
    bank.define(Registers::Control, |r| r
        .field(Field::flag("ENABLE", 0, Access::ReadWrite)
            .on_write(|s: &mut I2cState, v| s.enabled = v != 0))
        .field(Field::flag("MASTER", 1, Access::ReadWrite)
            .on_write(|s: &mut I2cState, v| s.master = v != 0))
        .field(Field::flag("START", 2, Access::WriteOnly)
            .on_write(|s: &mut I2cState, v| s.start_requested = v != 0))
        .field(Field::flag("STOP", 3, Access::WriteOnly)
            .on_write(|s: &mut I2cState, v| s.stop_requested = v != 0))
        .field(Field::flag("ACK", 4, Access::ReadWrite)
            .on_write(|s: &mut I2cState, v| s.ack_enabled = v != 0))
        .field(Field::flag("INT_ENABLE", 5, Access::ReadWrite)
            .on_write(|s: &mut I2cState, v| s.irq_enabled = v != 0))
        .field(Field::new("SLAVE_ADDR", 8, 7, Access::ReadWrite)
            .on_write(|s: &mut I2cState, v| s.address = v as u8))
        .reserved(6, 2)
        .reserved(15, 17)
        .after_write(I2cState::control_written));

    bank.define(Registers::Data, |r| r
        .field(Field::new("DATA", 0, 8, Access::ReadWrite)
            .on_read(I2cState::read_data)
            .on_write(I2cState::write_data))
        .reserved(8, 24));

    bank.define(Registers::Status, |r| r
        .field(Field::flag("BUSY", 0, Access::ReadOnly)
            .on_read(|s: &mut I2cState| flag(s.bus != BusState::Idle)))
        .field(Field::flag("TX_EMPTY", 1, Access::ReadOnly)
            .on_read(|s: &mut I2cState| flag(s.tx.is_empty())))
        .field(Field::flag("RX_FULL", 2, Access::ReadOnly)
            .on_read(|s: &mut I2cState| flag(s.rx.is_full())))
        .field(Field::flag("ACK_RECEIVED", 3, Access::ReadOnly)
            .on_read(|s: &mut I2cState| flag(s.ack_received)))
        .field(Field::flag("DONE", 4, Access::WriteOneToClear)
            .on_read(|s: &mut I2cState| flag(s.done))
            .on_write(|s: &mut I2cState, _| s.done = false))
        .reserved(5, 27)
        .after_write(I2cState::update_interrupts));

    bank.define(Registers::ClockDiv, |r| r
        .field(Field::new("CLOCK_DIV", 0, 16, Access::ReadWrite)
            .on_write(I2cState::set_clock_div))
        .reserved(16, 16));
}

pub struct I2c {
    name: String,
    bank: RegisterBank<I2cState>,
    state: Arc<Mutex<I2cState>>,
    target: Option<I2cTarget>,
}

impl I2c {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut i2c = Self {
            name,
            bank,
            state: Arc::new(Mutex::new(I2cState::new())),
            target: None,
        };
        i2c.reset();
        i2c
    }

    /// Attach the bus target. Called at STOP with the 7-bit address and the
    /// bytes written since START; returns whether the target acknowledged.
    pub fn attach_target(&mut self, target: impl FnMut(u8, &[u8]) -> bool + Send + 'static) {
        self.target = Some(Box::new(target));
    }

    fn deliver(&mut self, address: u8, payload: Vec<u8>) {
        let ack = match self.target.as_mut() {
            Some(target) => target(address, &payload),
            None => {
                log::debug!("I2C: no target at 0x{address:02x}, NACK");
                false
            }
        };
        lock(&self.state).finish_stop(address, payload.len(), ack);
    }

    pub fn clock_divider(&self) -> u32 {
        lock(&self.state).clock_div
    }

    pub fn bus_state(&self) -> BusState {
        lock(&self.state).bus
    }

    pub fn irq_asserted(&self) -> bool {
        lock(&self.state).irq.is_asserted()
    }
}

impl Peripheral for I2c {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        Self::SIZE
    }

    fn read(&mut self, offset: u32) -> u32 {
        let mut st = lock(&self.state);
        self.bank.read(&mut st, offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        let pending = {
            let mut st = lock(&self.state);
            self.bank.write(&mut st, offset, value);
            st.pending.take()
        };
        if let Some((address, payload)) = pending {
            self.deliver(address, payload);
        }
    }

    fn reset(&mut self) {
        self.bank.reset();
        lock(&self.state).reset();
    }

    fn connect_irq(&mut self, sink: Sink) {
        lock(&self.state).irq.connect(sink);
    }

    fn serial_input(&self) -> Option<SerialInput> {
        let state = self.state.clone();
        Some(SerialInput::new(move |b| lock(&state).receive(b)))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROL: u32 = 0x00;
    const DATA: u32 = 0x04;
    const STATUS: u32 = 0x08;
    const CLOCKDIV: u32 = 0x0c;

    const EN: u32 = 1 << 0;
    const MASTER: u32 = 1 << 1;
    const START: u32 = 1 << 2;
    const STOP: u32 = 1 << 3;
    const INT_EN: u32 = 1 << 5;

    const BUSY: u32 = 1 << 0;
    const TX_EMPTY: u32 = 1 << 1;
    const ACK_RECEIVED: u32 = 1 << 3;
    const DONE: u32 = 1 << 4;

    fn addr(a: u32) -> u32 {
        a << 8
    }

    #[test]
    fn test_write_transaction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let mut i2c = I2c::new("i2c0");
        i2c.attach_target(move |a, data| {
            s.lock().unwrap().push((a, data.to_vec()));
            a == 0x50
        });

        let base = EN | MASTER | addr(0x50);
        i2c.write(CONTROL, base | START);
        assert_eq!(i2c.bus_state(), BusState::Start);
        assert_ne!(i2c.read(STATUS) & BUSY, 0);

        i2c.write(DATA, 0x00);
        i2c.write(DATA, 0x10);
        assert_eq!(i2c.bus_state(), BusState::Data);
        assert_eq!(i2c.read(STATUS) & TX_EMPTY, 0);

        i2c.write(CONTROL, base | STOP);
        assert_eq!(i2c.bus_state(), BusState::Idle);
        assert_eq!(*seen.lock().unwrap(), vec![(0x50, vec![0x00, 0x10])]);

        let status = i2c.read(STATUS);
        assert_eq!(status & (BUSY | TX_EMPTY | ACK_RECEIVED | DONE),
            TX_EMPTY | ACK_RECEIVED | DONE);

        // START/STOP are write-only; the address sticks
        assert_eq!(i2c.read(CONTROL), base);
    }

    #[test]
    fn test_target_answers_through_own_input() {
        let mut i2c = I2c::new("i2c0");
        let input = i2c.serial_input().unwrap();
        i2c.attach_target(move |_, data| {
            for b in data {
                input.write_char(b + 1);
            }
            true
        });

        let base = EN | MASTER | addr(0x50);
        i2c.write(CONTROL, base | START);
        i2c.write(DATA, 0x20);
        i2c.write(DATA, 0x30);
        i2c.write(CONTROL, base | STOP);
        assert_ne!(i2c.read(STATUS) & ACK_RECEIVED, 0);
        assert_eq!(i2c.read(DATA), 0x21);
        assert_eq!(i2c.read(DATA), 0x31);
    }

    #[test]
    fn test_nack_without_target() {
        let mut i2c = I2c::new("i2c0");
        i2c.write(CONTROL, EN | MASTER | addr(0x20) | START);
        i2c.write(DATA, 0xaa);
        i2c.write(CONTROL, EN | MASTER | addr(0x20) | STOP);
        assert_eq!(i2c.bus_state(), BusState::Idle);
        let status = i2c.read(STATUS);
        assert_eq!(status & ACK_RECEIVED, 0);
        assert_ne!(status & DONE, 0);
    }

    #[test]
    fn test_start_requires_enabled_master() {
        let mut i2c = I2c::new("i2c0");
        i2c.write(CONTROL, EN | START);
        assert_eq!(i2c.bus_state(), BusState::Idle);
        i2c.write(CONTROL, MASTER | START);
        assert_eq!(i2c.bus_state(), BusState::Idle);
    }

    #[test]
    fn test_done_interrupt_write_one_to_clear() {
        let mut i2c = I2c::new("i2c0");
        i2c.attach_target(|_, _| true);
        let base = EN | MASTER | INT_EN | addr(0x10);
        i2c.write(CONTROL, base | START);
        assert!(!i2c.irq_asserted());
        i2c.write(CONTROL, base | STOP);
        assert!(i2c.irq_asserted());

        i2c.write(STATUS, 0);
        assert!(i2c.irq_asserted());
        i2c.write(STATUS, DONE);
        assert!(!i2c.irq_asserted());
        assert_eq!(i2c.read(STATUS) & DONE, 0);
    }

    #[test]
    fn test_receive_path() {
        let mut i2c = I2c::new("i2c0");
        assert_eq!(i2c.read(DATA), 0xff);
        let input = i2c.serial_input().unwrap();
        input.write_bytes(&[1, 2]);
        assert_eq!(i2c.read(DATA), 1);
        assert_eq!(i2c.read(DATA), 2);
        assert_eq!(i2c.read(DATA), 0xff);
    }

    #[test]
    fn test_clock_divider() {
        let mut i2c = I2c::new("i2c0");
        i2c.write(CLOCKDIV, 0x1_0064);
        assert_eq!(i2c.read(CLOCKDIV), 0x64);
        assert_eq!(i2c.clock_divider(), 0x64);
        i2c.write(CLOCKDIV, 0);
        assert_eq!(i2c.read(CLOCKDIV), 0);
    }
}
