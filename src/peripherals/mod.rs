//! Register-level peripheral models.
//!
//! - [`Gpio`]: 32 pins with direction and per-pin interrupts
//! - [`Uart`]: simple FIFO UART
//! - [`Uart16550`]: 16550-style UART with divisor latch
//! - [`Spi`]: SPI master with loopback
//! - [`I2c`]: I2C master
//! - [`Timer`]: up-counter with compare channels and PWM
//! - [`DmaController`]: eight immediate-copy channels
//! - [`InterruptController`]: 32 prioritized sources

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::line::Sink;

pub mod dma;
pub mod gpio;
pub mod i2c;
pub mod intc;
pub mod spi;
pub mod timer;
pub mod uart;
pub mod uart16550;

pub use dma::DmaController;
pub use gpio::Gpio;
pub use i2c::I2c;
pub use intc::InterruptController;
pub use spi::Spi;
pub use timer::Timer;
pub use uart::Uart;
pub use uart16550::Uart16550;

/// What every peripheral model offers to the bus.
pub trait Peripheral: Send {
    fn name(&self) -> &str;

    /// Size of the register window in bytes.
    fn size(&self) -> u32;

    fn read(&mut self, offset: u32) -> u32;

    fn write(&mut self, offset: u32, value: u32);

    fn reset(&mut self);

    /// Route the main IRQ output. Peripherals without one report it and
    /// drop the sink.
    fn connect_irq(&mut self, _sink: Sink) {
        log::warn!("{}: no interrupt output to connect", self.name());
    }

    /// One tick of the simulated clock.
    fn tick(&mut self) {}

    /// Entry point for bytes arriving from outside, if the peripheral has
    /// a receive path.
    fn serial_input(&self) -> Option<SerialInput> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Cloneable "character received" entry point into a serial peripheral.
/// Safe to use from another thread; it takes the peripheral's lock.
#[derive(Clone)]
pub struct SerialInput(Arc<dyn Fn(u8) + Send + Sync>);

impl SerialInput {
    pub(crate) fn new(f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn write_char(&self, byte: u8) {
        (self.0)(byte)
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        for b in bytes {
            self.write_char(*b);
        }
    }
}

impl fmt::Debug for SerialInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerialInput")
    }
}

/// Lock peripheral state; a panic elsewhere does not make it unusable.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transmit callback type for serial peripherals.
pub type TxSink = Box<dyn FnMut(u8) + Send>;
