//! Simple FIFO UART.
//!
//! Transmission is instantaneous: a byte written to DATA goes through the
//! TX FIFO and out of the transmit callback within the same write, as long
//! as the transmitter is enabled. The callback runs after the state lock
//! is released, so it may feed the UART's own [`SerialInput`]. Received bytes come in through
//! [`SerialInput`] and are popped by reading DATA.
//!
//! FIFO policies: a full RX FIFO drops the new byte (debug log only); a
//! full TX FIFO, which can only happen while TX is disabled, drops the new
//! byte with a warning.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;

use crate::fifo::{Fifo, FIFO_DEPTH};
use crate::irq::InterruptAggregator;
use crate::line::Sink;
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::{lock, Peripheral, SerialInput, TxSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Data,
    Status,
    Control,
    Baud,
}

const IRQ_TX: usize = 0;
const IRQ_RX: usize = 1;

pub struct UartState {
    tx: Fifo,
    rx: Fifo,
    tx_enabled: bool,
    rx_enabled: bool,
    tx_irq_enabled: bool,
    rx_irq_enabled: bool,
    rx_trigger: u32,
    divisor: u32,
    /// Drained from TX, handed to the callback once the lock is dropped.
    sent: Vec<u8>,
    irq: InterruptAggregator,
}

impl UartState {
    fn new() -> Self {
        Self {
            tx: Fifo::new(FIFO_DEPTH),
            rx: Fifo::new(FIFO_DEPTH),
            tx_enabled: false,
            rx_enabled: false,
            tx_irq_enabled: false,
            rx_irq_enabled: false,
            rx_trigger: 1,
            divisor: 0,
            sent: Vec::new(),
            irq: InterruptAggregator::or(2),
        }
    }

    fn reset(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.sent.clear();
        self.tx_enabled = false;
        self.rx_enabled = false;
        self.tx_irq_enabled = false;
        self.rx_irq_enabled = false;
        self.rx_trigger = 1;
        self.divisor = 0;
        self.update_interrupts();
    }

    fn read_data(&mut self) -> u32 {
        let v = match self.rx.pop() {
            Some(b) => b as u32,
            None => {
                log::debug!("UART: read from empty RX FIFO");
                0
            }
        };
        self.update_interrupts();
        v
    }

    fn write_data(&mut self, value: u32) {
        if !self.tx.push(value as u8) {
            log::warn!("UART: TX FIFO full, dropping 0x{value:02x}");
            return;
        }
        self.drain_tx();
    }

    fn drain_tx(&mut self) {
        if !self.tx_enabled {
            return;
        }
        while let Some(b) = self.tx.pop() {
            log::trace!("UART: transmit 0x{b:02x}");
            self.sent.push(b);
        }
    }

    fn receive(&mut self, byte: u8) {
        if !self.rx_enabled {
            log::debug!("UART: receiver disabled, dropping 0x{byte:02x}");
            return;
        }
        if !self.rx.push(byte) {
            log::debug!("UART: RX FIFO full, dropping 0x{byte:02x}");
            return;
        }
        self.update_interrupts();
    }

    fn set_tx_enabled(&mut self, value: u32) {
        self.tx_enabled = value != 0;
        self.drain_tx();
    }

    fn set_divisor(&mut self, value: u32) {
        if value == 0 {
            log::warn!("UART: baud divisor 0 is invalid");
        }
        self.divisor = value;
    }

    fn update_interrupts(&mut self) {
        let tx_low = self.tx.count() < self.tx.capacity() / 2;
        let rx_level = self.rx.count() >= self.rx_trigger.max(1) as usize;
        self.irq.set(IRQ_TX, self.tx_irq_enabled, tx_low);
        self.irq.set(IRQ_RX, self.rx_irq_enabled, rx_level);
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<UartState>) {
    bank.define(Registers::Data, |r| r
        .field(Field::new("DATA", 0, 8, Access::ReadWrite)
            .on_read(UartState::read_data)
            .on_write(UartState::write_data))
        .reserved(8, 24)
        .after_write(UartState::update_interrupts));

    bank.define(Registers::Status, |r| r
        .field(Field::flag("TX_EMPTY", 0, Access::ReadOnly)
            .on_read(|s: &mut UartState| flag(s.tx.is_empty())))
        .field(Field::flag("TX_FULL", 1, Access::ReadOnly)
            .on_read(|s: &mut UartState| flag(s.tx.is_full())))
        .field(Field::flag("RX_EMPTY", 2, Access::ReadOnly)
            .on_read(|s: &mut UartState| flag(s.rx.is_empty())))
        .field(Field::flag("RX_FULL", 3, Access::ReadOnly)
            .on_read(|s: &mut UartState| flag(s.rx.is_full())))
        .reserved(4, 28));

    bank.define(Registers::Control, |r| r
        .field(Field::flag("TX_ENABLE", 0, Access::ReadWrite)
            .on_write(UartState::set_tx_enabled))
        .field(Field::flag("RX_ENABLE", 1, Access::ReadWrite)
            .on_write(|s: &mut UartState, v| s.rx_enabled = v != 0))
        .field(Field::flag("TX_INT_ENABLE", 2, Access::ReadWrite)
            .on_write(|s: &mut UartState, v| s.tx_irq_enabled = v != 0))
        .field(Field::flag("RX_INT_ENABLE", 3, Access::ReadWrite)
            .on_write(|s: &mut UartState, v| s.rx_irq_enabled = v != 0))
        .field(Field::new("RX_TRIGGER", 8, 4, Access::ReadWrite)
            .on_write(|s: &mut UartState, v| s.rx_trigger = v))
        .reserved(4, 4)
        .reserved(12, 20)
        .after_write(UartState::update_interrupts));

    bank.define(Registers::Baud, |r| r
        .field(Field::new("DIVISOR", 0, 16, Access::ReadWrite)
            .on_write(UartState::set_divisor))
        .reserved(16, 16));
}

pub struct Uart {
    name: String,
    bank: RegisterBank<UartState>,
    state: Arc<Mutex<UartState>>,
    transmit: Option<TxSink>,
}

impl Uart {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut uart = Self {
            name,
            bank,
            state: Arc::new(Mutex::new(UartState::new())),
            transmit: None,
        };
        uart.reset();
        uart
    }

    /// Install the "character transmitted" callback.
    pub fn on_transmit(&mut self, f: impl FnMut(u8) + Send + 'static) {
        self.transmit = Some(Box::new(f));
    }

    fn deliver(&mut self, bytes: Vec<u8>) {
        if let Some(cb) = self.transmit.as_mut() {
            for b in bytes {
                cb(b);
            }
        }
    }

    pub fn write_char(&self, byte: u8) {
        lock(&self.state).receive(byte);
    }

    pub fn irq_asserted(&self) -> bool {
        lock(&self.state).irq.is_asserted()
    }

    /// Configured baud rate for a given UART clock.
    pub fn baud_rate(&self, clock: u32) -> Option<u32> {
        let d = lock(&self.state).divisor;
        if d == 0 { None } else { Some(clock / (16 * d)) }
    }
}

impl Peripheral for Uart {
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
        let sent = {
            let mut st = lock(&self.state);
            self.bank.write(&mut st, offset, value);
            std::mem::take(&mut st.sent)
        };
        self.deliver(sent);
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

    const DATA: u32 = 0x00;
    const STATUS: u32 = 0x04;
    const CONTROL: u32 = 0x08;
    const BAUD: u32 = 0x0c;

    const TX_EMPTY: u32 = 1 << 0;
    const TX_FULL: u32 = 1 << 1;
    const RX_EMPTY: u32 = 1 << 2;
    const RX_FULL: u32 = 1 << 3;

    fn uart_with_output() -> (Uart, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = out.clone();
        let mut uart = Uart::new("uart0");
        uart.on_transmit(move |b| o.lock().unwrap().push(b));
        (uart, out)
    }

    #[test]
    fn test_register_offsets() {
        assert_eq!(Registers::Data.offset(), DATA);
        assert_eq!(Registers::Baud.offset(), BAUD);
    }

    #[test]
    fn test_transmit_is_immediate() {
        let (mut uart, out) = uart_with_output();
        uart.write(CONTROL, 0b01);
        uart.write(DATA, 0x41);

        assert_eq!(*out.lock().unwrap(), vec![0x41]);
        assert_ne!(uart.read(STATUS) & TX_EMPTY, 0);
    }

    #[test]
    fn test_tx_held_until_enabled() {
        let (mut uart, out) = uart_with_output();
        uart.write(DATA, b'h' as u32);
        uart.write(DATA, b'i' as u32);
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(uart.read(STATUS) & TX_EMPTY, 0);

        uart.write(CONTROL, 0b01);
        assert_eq!(*out.lock().unwrap(), b"hi");
        assert_ne!(uart.read(STATUS) & TX_EMPTY, 0);
    }

    #[test]
    fn test_tx_full_drops() {
        let (mut uart, out) = uart_with_output();
        for i in 0..20 {
            uart.write(DATA, i);
        }
        assert_ne!(uart.read(STATUS) & TX_FULL, 0);
        uart.write(CONTROL, 0b01);
        assert_eq!(out.lock().unwrap().len(), FIFO_DEPTH);
    }

    #[test]
    fn test_receive_and_pop() {
        let mut uart = Uart::new("uart0");
        uart.write(CONTROL, 0b10);
        assert_ne!(uart.read(STATUS) & RX_EMPTY, 0);

        let input = uart.serial_input().unwrap();
        input.write_bytes(b"ok");
        assert_eq!(uart.read(STATUS) & RX_EMPTY, 0);
        assert_eq!(uart.read(DATA), b'o' as u32);
        assert_eq!(uart.read(DATA), b'k' as u32);
        assert_eq!(uart.read(DATA), 0);
    }

    #[test]
    fn test_rx_overflow_drops_newest() {
        let mut uart = Uart::new("uart0");
        uart.write(CONTROL, 0b10);
        for i in 0..(FIFO_DEPTH as u8 + 3) {
            uart.write_char(i);
        }
        assert_ne!(uart.read(STATUS) & RX_FULL, 0);
        for i in 0..FIFO_DEPTH as u32 {
            assert_eq!(uart.read(DATA), i);
        }
        assert_ne!(uart.read(STATUS) & RX_EMPTY, 0);
    }

    #[test]
    fn test_rx_disabled_drops() {
        let mut uart = Uart::new("uart0");
        uart.write_char(0x55);
        assert_ne!(uart.read(STATUS) & RX_EMPTY, 0);
    }

    #[test]
    fn test_rx_interrupt_trigger_level() {
        let mut uart = Uart::new("uart0");
        // RX enable, RX interrupt enable, trigger at 3 bytes
        uart.write(CONTROL, 0b1010 | (3 << 8));
        uart.write_char(1);
        uart.write_char(2);
        assert!(!uart.irq_asserted());
        uart.write_char(3);
        assert!(uart.irq_asserted());

        uart.read(DATA);
        assert!(!uart.irq_asserted());
        assert_eq!(uart.read(CONTROL), 0b1010 | (3 << 8));
    }

    #[test]
    fn test_tx_interrupt_when_fifo_low() {
        let mut uart = Uart::new("uart0");
        uart.write(CONTROL, 0b0100);
        assert!(uart.irq_asserted());
        for i in 0..8 {
            uart.write(DATA, i);
        }
        assert!(!uart.irq_asserted());
    }

    #[test]
    fn test_baud_divisor() {
        let mut uart = Uart::new("uart0");
        assert_eq!(uart.baud_rate(1_843_200), None);
        uart.write(BAUD, 0x0001_0001);
        assert_eq!(uart.read(BAUD), 1);
        assert_eq!(uart.baud_rate(1_843_200), Some(115_200));
        uart.write(BAUD, 0);
        assert_eq!(uart.baud_rate(1_843_200), None);
    }

    #[test]
    fn test_transmit_feeds_own_receiver() {
        let mut uart = Uart::new("uart0");
        let input = uart.serial_input().unwrap();
        uart.on_transmit(move |b| input.write_char(b));
        uart.write(CONTROL, 0b11);
        uart.write(DATA, 0x41);
        uart.write(DATA, 0x42);

        assert_ne!(uart.read(STATUS) & TX_EMPTY, 0);
        assert_eq!(uart.read(DATA), 0x41);
        assert_eq!(uart.read(DATA), 0x42);
        assert_ne!(uart.read(STATUS) & RX_EMPTY, 0);
    }

    #[test]
    fn test_reset_clears_fifos() {
        let mut uart = Uart::new("uart0");
        uart.write(CONTROL, 0b10);
        uart.write_char(7);
        uart.reset();
        assert_eq!(uart.read(CONTROL), 0);
        assert_ne!(uart.read(STATUS) & RX_EMPTY, 0);
    }
}
