//! SPI master.
//!
//! Every byte written to DATA is exchanged for one reply byte, which lands
//! in the RX FIFO. The reply comes from, in order: the sent byte itself in
//! loopback mode, the attached device, a byte staged through
//! [`SerialInput`], or 0xFF for an idle bus.
//!
//! When the RX FIFO is full, exchanges stop and the rest of TX stays
//! queued; reading DATA makes room and resumes them. The device is called
//! with the state lock released, so it may stage replies through the
//! controller's own [`SerialInput`].

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
}

const IRQ_RX_NOT_EMPTY: usize = 0;
const IRQ_TX_EMPTY: usize = 1;

/// Value shifted in when nothing drives MISO.
const IDLE_BUS: u8 = 0xff;

pub type SpiDevice = Box<dyn FnMut(u8) -> u8 + Send>;

pub struct SpiState {
    tx: Fifo,
    rx: Fifo,
    staged: Fifo,
    enabled: bool,
    loopback: bool,
    mode: u32,
    msb_first: bool,
    clock_div: u32,
    rxne_ie: bool,
    txe_ie: bool,
    irq: InterruptAggregator,
}

impl SpiState {
    fn new() -> Self {
        Self {
            tx: Fifo::new(FIFO_DEPTH),
            rx: Fifo::new(FIFO_DEPTH),
            staged: Fifo::new(FIFO_DEPTH),
            enabled: false,
            loopback: false,
            mode: 0,
            msb_first: false,
            clock_div: 0,
            rxne_ie: false,
            txe_ie: false,
            irq: InterruptAggregator::or(2),
        }
    }

    fn reset(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.staged.clear();
        self.enabled = false;
        self.loopback = false;
        self.mode = 0;
        self.msb_first = false;
        self.clock_div = 0;
        self.rxne_ie = false;
        self.txe_ie = false;
        self.update_interrupts();
    }

    /// Next byte to shift out, if there is room for its reply.
    fn next_transfer(&mut self) -> Option<u8> {
        if !self.enabled || self.rx.is_full() {
            return None;
        }
        self.tx.pop()
    }

    fn complete_transfer(&mut self, out: u8, device_reply: Option<u8>) {
        let reply = if self.loopback {
            out
        } else {
            device_reply.or_else(|| self.staged.pop()).unwrap_or(IDLE_BUS)
        };
        log::trace!("SPI: sent 0x{out:02x}, received 0x{reply:02x}");
        self.rx.push(reply);
    }

    fn finish_transfers(&mut self) {
        if !self.tx.is_empty() {
            log::debug!("SPI: {} byte(s) waiting", self.tx.count());
        }
        self.update_interrupts();
    }

    fn read_data(&mut self) -> u32 {
        let v = self.rx.pop().map_or(0, u32::from);
        self.update_interrupts();
        v
    }

    fn write_data(&mut self, value: u32) {
        if !self.enabled {
            log::debug!("SPI: disabled, ignoring write of 0x{value:02x}");
            return;
        }
        if !self.tx.push(value as u8) {
            log::warn!("SPI: TX FIFO full, dropping 0x{value:02x}");
        }
    }

    fn stage(&mut self, byte: u8) {
        if !self.staged.push(byte) {
            log::warn!("SPI: staged reply buffer full, dropping 0x{byte:02x}");
        }
    }

    fn update_interrupts(&mut self) {
        self.irq.set(IRQ_RX_NOT_EMPTY, self.rxne_ie, !self.rx.is_empty());
        self.irq.set(IRQ_TX_EMPTY, self.txe_ie, self.tx.is_empty());
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<SpiState>) {
    bank.define(Registers::Control, |r| r
        .field(Field::flag("ENABLE", 0, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.enabled = v != 0))
        .field(Field::flag("LOOPBACK", 1, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.loopback = v != 0))
        .field(Field::new("MODE", 2, 2, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.mode = v))
        .field(Field::flag("MSB_FIRST", 4, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.msb_first = v != 0))
        .field(Field::flag("RXNE_IE", 5, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.rxne_ie = v != 0))
        .field(Field::flag("TXE_IE", 6, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.txe_ie = v != 0))
        .field(Field::new("CLOCK_DIV", 8, 8, Access::ReadWrite)
            .on_write(|s: &mut SpiState, v| s.clock_div = v))
        .reserved(7, 1)
        .reserved(16, 16)
        .after_write(SpiState::update_interrupts));

    bank.define(Registers::Data, |r| r
        .field(Field::new("DATA", 0, 8, Access::ReadWrite)
            .on_read(SpiState::read_data)
            .on_write(SpiState::write_data))
        .reserved(8, 24));

    bank.define(Registers::Status, |r| r
        .field(Field::flag("TX_EMPTY", 0, Access::ReadOnly)
            .on_read(|s: &mut SpiState| flag(s.tx.is_empty())))
        .field(Field::flag("TX_FULL", 1, Access::ReadOnly)
            .on_read(|s: &mut SpiState| flag(s.tx.is_full())))
        .field(Field::flag("RX_EMPTY", 2, Access::ReadOnly)
            .on_read(|s: &mut SpiState| flag(s.rx.is_empty())))
        .field(Field::flag("RX_FULL", 3, Access::ReadOnly)
            .on_read(|s: &mut SpiState| flag(s.rx.is_full())))
        .field(Field::flag("BUSY", 4, Access::ReadOnly)
            .on_read(|s: &mut SpiState| flag(!s.tx.is_empty())))
        .reserved(5, 27));
}

pub struct Spi {
    name: String,
    bank: RegisterBank<SpiState>,
    state: Arc<Mutex<SpiState>>,
    device: Option<SpiDevice>,
}

impl Spi {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut spi = Self {
            name,
            bank,
            state: Arc::new(Mutex::new(SpiState::new())),
            device: None,
        };
        spi.reset();
        spi
    }

    /// Attach the device on the other end of the bus. It is called once
    /// per byte with the byte sent and returns the byte shifted back.
    pub fn attach_device(&mut self, device: impl FnMut(u8) -> u8 + Send + 'static) {
        self.device = Some(Box::new(device));
    }

    pub fn detach_device(&mut self) {
        self.device = None;
    }

    /// Run queued exchanges until TX is empty or RX is full.
    fn process_transfers(&mut self) {
        loop {
            let (out, loopback) = {
                let mut st = lock(&self.state);
                match st.next_transfer() {
                    Some(out) => (out, st.loopback),
                    None => {
                        st.finish_transfers();
                        return;
                    }
                }
            };
            let reply = match self.device.as_mut() {
                Some(dev) if !loopback => Some(dev(out)),
                _ => None,
            };
            lock(&self.state).complete_transfer(out, reply);
        }
    }

    /// Clock polarity/phase as configured (CONTROL.MODE).
    pub fn mode(&self) -> u32 {
        lock(&self.state).mode
    }

    pub fn msb_first(&self) -> bool {
        lock(&self.state).msb_first
    }

    pub fn clock_divider(&self) -> u32 {
        lock(&self.state).clock_div
    }

    pub fn irq_asserted(&self) -> bool {
        lock(&self.state).irq.is_asserted()
    }
}

impl Peripheral for Spi {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        Self::SIZE
    }

    fn read(&mut self, offset: u32) -> u32 {
        let v = {
            let mut st = lock(&self.state);
            self.bank.read(&mut st, offset)
        };
        self.process_transfers();
        v
    }

    fn write(&mut self, offset: u32, value: u32) {
        {
            let mut st = lock(&self.state);
            self.bank.write(&mut st, offset, value);
        }
        self.process_transfers();
    }

    fn reset(&mut self) {
        self.bank.reset();
        lock(&self.state).reset();
    }

    fn connect_irq(&mut self, sink: Sink) {
        lock(&self.state).irq.connect(sink);
    }

    /// Bytes written here are the replies used while no device is attached.
    fn serial_input(&self) -> Option<SerialInput> {
        let state = self.state.clone();
        Some(SerialInput::new(move |b| lock(&state).stage(b)))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
