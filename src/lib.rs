//! Register-level models of common microcontroller peripherals.
//!
//! Each peripheral declares its register window as a [`register::RegisterBank`]
//! over its own state, reports interrupts through [`line::InterruptLine`]s and
//! is driven by bus reads and writes, clock ticks and serial input. The
//! [`device`] module assembles peripherals into a board and runs scripted
//! accesses against it.

pub mod counter;
pub mod device;
pub mod fifo;
pub mod irq;
pub mod line;
pub mod memory;
pub mod peripherals;
pub mod register;
pub mod transfer;
