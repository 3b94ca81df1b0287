//! 16550-style UART.
//!
//! Offsets 0x00 and 0x04 are shared between the data/interrupt-enable
//! registers and the divisor latch; LCR.DLAB (or the owner, through
//! [`Uart16550::set_divisor_latch`]) picks which one is visible. 0x08 reads
//! as IIR and writes as FCR.
//!
//! Unlike [`super::Uart`], a full RX FIFO is an overrun: the byte is
//! rejected and LSR.OE is latched until LSR is read or a byte is taken
//! from RBR. Parity and framing errors clear the same way; a break stays
//! in LSR.BI until LSR is read and never counts as a line-status error.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::fifo::{Fifo, FIFO_DEPTH};
use crate::irq::InterruptAggregator;
use crate::line::Sink;
use crate::register::{Access, Field, RegisterBank, RegisterMap};

use super::{lock, Peripheral, SerialInput, TxSink};

/// Reference clock for divisor to baud conversion (1.8432 MHz).
pub const UART_CLOCK: u32 = 1_843_200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Rbr,
    Ier,
    Iir,
    Lcr,
    Mcr,
    Lsr,
    Msr,
    Scr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum LatchRegisters {
    #[offset(0x00)]
    Dll,
    Dlh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum WriteRegisters {
    #[offset(0x08)]
    Fcr,
}

/// Interrupt sources in IIR priority order.
const IRQ_LINE_STATUS: usize = 0;
const IRQ_RX_DATA: usize = 1;
const IRQ_THR_EMPTY: usize = 2;
const IRQ_MODEM_STATUS: usize = 3;

/// IIR interrupt identification codes, indexed like the sources above.
const IIR_CODES: [u32; 4] = [0x6, 0x4, 0x2, 0x0];
const IIR_NONE: u32 = 0x1;

const TRIGGER_LEVELS: [usize; 4] = [1, 4, 8, 14];

/// Receive errors the line can report besides overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    Parity,
    Framing,
    Break,
}

pub struct Uart16550State {
    tx: Fifo,
    rx: Fifo,
    divisor: u32,
    dlab: bool,
    fifo_enabled: bool,
    rx_trigger: usize,
    tx_trigger: usize,
    rx_data_ie: bool,
    thr_empty_ie: bool,
    line_status_ie: bool,
    modem_status_ie: bool,
    overrun: bool,
    parity_error: bool,
    framing_error: bool,
    break_detected: bool,
    /// Error summary sampled by the last LSR read, before the clear.
    error_reported: bool,
    /// Drained from THR, handed to the callback once the lock is dropped.
    sent: Vec<u8>,
    irq: InterruptAggregator,
}

impl Uart16550State {
    fn new() -> Self {
        let mut irq = InterruptAggregator::priority(4);
        for (i, p) in [3, 2, 1, 0].into_iter().enumerate() {
            irq.set_priority(i, p);
        }
        Self {
            tx: Fifo::new(FIFO_DEPTH),
            rx: Fifo::new(FIFO_DEPTH),
            divisor: 1,
            dlab: false,
            fifo_enabled: false,
            rx_trigger: 1,
            tx_trigger: 1,
            rx_data_ie: false,
            thr_empty_ie: false,
            line_status_ie: false,
            modem_status_ie: false,
            overrun: false,
            parity_error: false,
            framing_error: false,
            break_detected: false,
            error_reported: false,
            sent: Vec::new(),
            irq,
        }
    }

    fn reset(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.sent.clear();
        self.divisor = 1;
        self.dlab = false;
        self.fifo_enabled = false;
        self.rx_trigger = 1;
        self.tx_trigger = 1;
        self.rx_data_ie = false;
        self.thr_empty_ie = false;
        self.line_status_ie = false;
        self.modem_status_ie = false;
        self.clear_errors();
        self.error_reported = false;
        self.update_interrupts();
    }

    fn has_error(&self) -> bool {
        self.overrun || self.parity_error || self.framing_error
    }

    fn clear_errors(&mut self) {
        self.overrun = false;
        self.parity_error = false;
        self.framing_error = false;
        self.break_detected = false;
    }

    fn read_rbr(&mut self) -> u32 {
        let v = match self.rx.pop() {
            Some(b) => {
                self.overrun = false;
                self.parity_error = false;
                self.framing_error = false;
                b as u32
            }
            None => {
                log::warn!("UART16550: reading from empty RX FIFO");
                0
            }
        };
        self.update_interrupts();
        v
    }

    fn write_thr(&mut self, value: u32) {
        if !self.tx.push(value as u8) {
            log::warn!("UART16550: TX FIFO full, dropping character");
            return;
        }
        while let Some(b) = self.tx.pop() {
            log::trace!("UART16550: transmitted 0x{b:02x}");
            self.sent.push(b);
        }
    }

    fn receive(&mut self, byte: u8) {
        if !self.rx.push(byte) {
            self.overrun = true;
            log::warn!("UART16550: RX FIFO overrun");
        } else {
            log::trace!("UART16550: received 0x{byte:02x}");
        }
        self.update_interrupts();
    }

    fn line_error(&mut self, error: LineError) {
        match error {
            LineError::Parity => self.parity_error = true,
            LineError::Framing => self.framing_error = true,
            LineError::Break => self.break_detected = true,
        }
        self.update_interrupts();
    }

    /// Read side effect of LSR: error bits clear once reported.
    fn clear_line_status(&mut self, bits: u32) {
        if bits & (1 << 1) != 0 {
            self.overrun = false;
        }
        if bits & (1 << 2) != 0 {
            self.parity_error = false;
        }
        if bits & (1 << 3) != 0 {
            self.framing_error = false;
        }
        if bits & (1 << 4) != 0 {
            self.break_detected = false;
        }
        self.update_interrupts();
    }

    /// LSR bits 1..=4, sampled ahead of the read-to-clear.
    fn error_bits(&mut self) -> u32 {
        self.error_reported = self.has_error();
        flag(self.overrun) << 1
            | flag(self.parity_error) << 2
            | flag(self.framing_error) << 3
            | flag(self.break_detected) << 4
    }

    fn set_fifo_enabled(&mut self, value: u32) {
        self.fifo_enabled = value != 0;
        if !self.fifo_enabled {
            self.tx.clear();
            self.rx.clear();
        }
    }

    fn set_divisor_low(&mut self, value: u32) {
        self.divisor = (self.divisor & 0xff00) | value;
        self.update_baud_rate();
    }

    fn set_divisor_high(&mut self, value: u32) {
        self.divisor = (self.divisor & 0x00ff) | (value << 8);
        self.update_baud_rate();
    }

    fn update_baud_rate(&self) {
        if self.divisor == 0 {
            log::warn!("UART16550: invalid baud rate divisor 0");
            return;
        }
        log::debug!("UART16550: baud rate {} (divisor {})",
            UART_CLOCK / (16 * self.divisor), self.divisor);
    }

    fn interrupt_id(&mut self) -> u32 {
        match self.irq.active() {
            Some(i) => IIR_CODES[i],
            None => IIR_NONE,
        }
    }

    fn update_interrupts(&mut self) {
        let rx_level = self.rx.count() >= self.rx_trigger;
        let tx_level = self.tx.count() <= self.tx_trigger;
        self.irq.set(IRQ_LINE_STATUS, self.line_status_ie, self.has_error());
        self.irq.set(IRQ_RX_DATA, self.rx_data_ie, rx_level);
        self.irq.set(IRQ_THR_EMPTY, self.thr_empty_ie, tx_level);
        // Modem status changes are not modelled
        self.irq.set(IRQ_MODEM_STATUS, self.modem_status_ie, false);
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<Uart16550State>) {
    bank.define(Registers::Rbr, |r| r
        .field(Field::new("DATA", 0, 8, Access::ReadWrite)
            .on_read(Uart16550State::read_rbr)
            .on_write(Uart16550State::write_thr))
        .reserved(8, 24)
        .after_write(Uart16550State::update_interrupts));

    bank.define(Registers::Ier, |r| r
        .field(Field::flag("RDAIE", 0, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| flag(s.rx_data_ie))
            .on_write(|s: &mut Uart16550State, v| s.rx_data_ie = v != 0))
        .field(Field::flag("THREIE", 1, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| flag(s.thr_empty_ie))
            .on_write(|s: &mut Uart16550State, v| s.thr_empty_ie = v != 0))
        .field(Field::flag("RLSIE", 2, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| flag(s.line_status_ie))
            .on_write(|s: &mut Uart16550State, v| s.line_status_ie = v != 0))
        .field(Field::flag("MSIE", 3, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| flag(s.modem_status_ie))
            .on_write(|s: &mut Uart16550State, v| s.modem_status_ie = v != 0))
        .reserved(4, 28)
        .after_write(Uart16550State::update_interrupts));

    bank.define(Registers::Iir, |r| r
        .field(Field::new("IID", 0, 4, Access::ReadOnly)
            .on_read(Uart16550State::interrupt_id))
        .field(Field::new("FIFO_EN", 6, 2, Access::ReadOnly)
            .on_read(|s: &mut Uart16550State| if s.fifo_enabled { 3 } else { 0 }))
        .reserved(4, 2)
        .reserved(8, 24));

    bank.define(Registers::Lcr, |r| r
        .field(Field::new("WLS", 0, 2, Access::ReadWrite).with_reset(3))
        .field(Field::flag("STB", 2, Access::ReadWrite))
        .field(Field::flag("PEN", 3, Access::ReadWrite))
        .field(Field::flag("EPS", 4, Access::ReadWrite))
        .field(Field::flag("SP", 5, Access::ReadWrite))
        .field(Field::flag("BRK", 6, Access::ReadWrite)
            .on_write(|_: &mut Uart16550State, v| if v != 0 {
                log::debug!("UART16550: break condition set");
            }))
        .field(Field::flag("DLAB", 7, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| flag(s.dlab))
            .on_write(|s: &mut Uart16550State, v| s.dlab = v != 0))
        .reserved(8, 24));

    bank.define(Registers::Mcr, |r| r
        .field(Field::new("MCR", 0, 5, Access::ReadWrite))
        .reserved(5, 27));

    bank.define(Registers::Lsr, |r| r
        .field(Field::flag("DR", 0, Access::ReadOnly)
            .on_read(|s: &mut Uart16550State| flag(!s.rx.is_empty())))
        .field(Field::new("ERRORS", 1, 4, Access::ReadToClear)
            .on_read(|s: &mut Uart16550State| s.error_bits() >> 1)
            .on_write(|s: &mut Uart16550State, v| s.clear_line_status(v << 1)))
        .field(Field::flag("THRE", 5, Access::ReadOnly)
            .on_read(|s: &mut Uart16550State| flag(s.tx.count() < s.tx.capacity())))
        .field(Field::flag("TEMT", 6, Access::ReadOnly)
            .on_read(|s: &mut Uart16550State| flag(s.tx.is_empty())))
        .field(Field::flag("RX_FIFO_ERR", 7, Access::ReadOnly)
            .on_read(|s: &mut Uart16550State| flag(s.error_reported)))
        .reserved(8, 24));

    // No modem lines are modelled; MSR reads as 0
    bank.define(Registers::Msr, |r| r.reserved(0, 32));

    bank.define(Registers::Scr, |r| r
        .field(Field::new("SCRATCH", 0, 8, Access::ReadWrite))
        .reserved(8, 24));
}

fn build_latch_registers(bank: &mut RegisterBank<Uart16550State>) {
    bank.define(LatchRegisters::Dll, |r| r
        .field(Field::new("DLL", 0, 8, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| s.divisor & 0xff)
            .on_write(Uart16550State::set_divisor_low))
        .reserved(8, 24));

    bank.define(LatchRegisters::Dlh, |r| r
        .field(Field::new("DLH", 0, 8, Access::ReadWrite)
            .on_read(|s: &mut Uart16550State| (s.divisor >> 8) & 0xff)
            .on_write(Uart16550State::set_divisor_high))
        .reserved(8, 24));
}

fn build_write_registers(bank: &mut RegisterBank<Uart16550State>) {
    bank.define(WriteRegisters::Fcr, |r| r
        .field(Field::flag("FIFO_EN", 0, Access::WriteOnly)
            .on_write(Uart16550State::set_fifo_enabled))
        .field(Field::flag("RX_FIFO_RST", 1, Access::WriteOnly)
            .on_write(|s: &mut Uart16550State, v| if v != 0 { s.rx.clear() }))
        .field(Field::flag("TX_FIFO_RST", 2, Access::WriteOnly)
            .on_write(|s: &mut Uart16550State, v| if v != 0 { s.tx.clear() }))
        .field(Field::new("RX_TRIGGER", 6, 2, Access::WriteOnly)
            .on_write(|s: &mut Uart16550State, v| s.rx_trigger = TRIGGER_LEVELS[v as usize]))
        .reserved(3, 3)
        .reserved(8, 24)
        .after_write(Uart16550State::update_interrupts));
}

pub struct Uart16550 {
    name: String,
    bank: RegisterBank<Uart16550State>,
    latch: RegisterBank<Uart16550State>,
    write_only: RegisterBank<Uart16550State>,
    state: Arc<Mutex<Uart16550State>>,
    transmit: Option<TxSink>,
}

impl Uart16550 {
    pub const SIZE: u32 = 0x100;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut latch = RegisterBank::new(format!("{name}.latch"));
        build_latch_registers(&mut latch);
        let mut write_only = RegisterBank::new(format!("{name}.fcr"));
        build_write_registers(&mut write_only);

        let mut uart = Self {
            name,
            bank,
            latch,
            write_only,
            state: Arc::new(Mutex::new(Uart16550State::new())),
            transmit: None,
        };
        uart.reset();
        uart
    }

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

    /// Report a receive error from the line side.
    pub fn inject_line_error(&self, error: LineError) {
        lock(&self.state).line_error(error);
    }

    /// Select the divisor latch mapping from outside, same as LCR.DLAB.
    pub fn set_divisor_latch(&mut self, enabled: bool) {
        lock(&self.state).dlab = enabled;
    }

    pub fn baud_rate(&self) -> Option<u32> {
        let d = lock(&self.state).divisor;
        if d == 0 { None } else { Some(UART_CLOCK / (16 * d)) }
    }

    pub fn irq_asserted(&self) -> bool {
        lock(&self.state).irq.is_asserted()
    }
}

fn latched(offset: u32) -> bool {
    LatchRegisters::from_offset(offset).is_some()
}

impl Peripheral for Uart16550 {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        Self::SIZE
    }

    fn read(&mut self, offset: u32) -> u32 {
        let mut st = lock(&self.state);
        if st.dlab && latched(offset) {
            self.latch.read(&mut st, offset)
        } else {
            self.bank.read(&mut st, offset)
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        let sent = {
            let mut st = lock(&self.state);
            if st.dlab && latched(offset) {
                self.latch.write(&mut st, offset, value)
            } else if WriteRegisters::from_offset(offset).is_some() {
                self.write_only.write(&mut st, offset, value)
            } else {
                self.bank.write(&mut st, offset, value)
            }
            std::mem::take(&mut st.sent)
        };
        self.deliver(sent);
    }

    fn reset(&mut self) {
        self.bank.reset();
        self.latch.reset();
        self.write_only.reset();
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
