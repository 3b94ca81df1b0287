//! Board description, read from TOML.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    pub memory: Option<MemoryConfig>,
    #[serde(default, rename = "peripheral")]
    pub peripherals: Vec<PeripheralConfig>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    pub base: u32,
    pub size: u32,
    /// Intel HEX image loaded into the region at startup.
    pub image: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeripheralConfig {
    pub name: String,
    pub kind: Kind,
    pub base: u32,
    /// Interrupt controller input the peripheral's IRQ is wired to.
    pub irq: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Gpio,
    Uart,
    Uart16550,
    Spi,
    I2c,
    Timer,
    Dma,
    Intc,
}

fn one() -> u32 {
    1
}

fn all_bits() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    /// Bus write to a register or to memory.
    Write { addr: u32, value: u32 },
    /// Bus read; fails the run if `expect` is given and the masked value
    /// differs.
    Read {
        addr: u32,
        expect: Option<u32>,
        #[serde(default = "all_bits")]
        mask: u32,
    },
    /// Clock every peripheral `count` times.
    Tick {
        #[serde(default = "one")]
        count: u32,
    },
    /// Bytes arriving at a serial peripheral.
    Rx {
        peripheral: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        bytes: Vec<u8>,
    },
    /// External level on a GPIO input pin.
    Gpio {
        peripheral: String,
        pin: usize,
        level: bool,
    },
    /// Hardware request on a DMA channel.
    Dma { peripheral: String, channel: usize },
}

impl BoardConfig {
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("Invalid board description: {e}"))
    }
}
