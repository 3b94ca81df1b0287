//! Board harness: peripherals mapped at base addresses, an optional RAM
//! region, and interrupt outputs routed into an interrupt controller.
//!
//! A [`Device`] is normally assembled from a [`BoardConfig`] and driven by
//! its list of [`Step`]s. Every access goes through [`Device::read`] or
//! [`Device::write`], which pick the peripheral whose register window
//! contains the address and fall back to memory.

use std::collections::{BTreeMap, HashMap};
use std::io::{LineWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

mod config;
mod intelhex;

pub use config::*;

use crate::memory::FlatMemory;
use crate::peripherals::*;

/// Turns transmitted bytes into log lines.
struct LogWriter {
    name: String,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let t = s.trim_end();
        if !t.is_empty() {
            log::info!("{}: {}", self.name, t);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Everything a serial peripheral has sent so far.
struct Console {
    log: LineWriter<LogWriter>,
    transcript: Vec<u8>,
}

impl Console {
    fn new(name: &str) -> Self {
        Self {
            log: LineWriter::new(LogWriter { name: name.to_string() }),
            transcript: Vec::new(),
        }
    }

    fn put(&mut self, byte: u8) {
        self.transcript.push(byte);
        // LogWriter never fails
        let _ = self.log.write(&[byte]);
    }
}

pub struct Device {
    peripherals: Vec<Box<dyn Peripheral>>,
    mmio_mappings: BTreeMap<u32, usize>,
    memory: Option<FlatMemory>,
    intc: Option<usize>,
    cpu_irq: Arc<AtomicBool>,
    irq_sender: mpsc::Sender<(usize, bool)>,
    irq_events: mpsc::Receiver<(usize, bool)>,
    consoles: HashMap<String, Arc<Mutex<Console>>>,
}

impl Device {
    pub fn new(memory: Option<FlatMemory>) -> Self {
        let (irq_sender, irq_events) = mpsc::channel();
        Self {
            peripherals: Vec::new(),
            mmio_mappings: BTreeMap::new(),
            memory,
            intc: None,
            cpu_irq: Arc::new(AtomicBool::new(false)),
            irq_sender,
            irq_events,
            consoles: HashMap::new(),
        }
    }

    /// Assemble a board: memory (with its image), peripherals and
    /// interrupt wiring. Steps are not run.
    pub fn from_config(cfg: &BoardConfig) -> Result<Self, String> {
        let memory = match &cfg.memory {
            Some(m) => {
                let mem = FlatMemory::new(m.base, m.size, None);
                if let Some(path) = &m.image {
                    let data = std::fs::read(path)
                        .map_err(|e| format!("Could not read {} ({e})", path.display()))?;
                    let n = intelhex::load(&mem, &data)?;
                    log::info!("Loaded {n} bytes from {}", path.display());
                }
                Some(mem)
            }
            None => None,
        };

        let mut dev = Self::new(memory);
        for p in &cfg.peripherals {
            let peripheral = dev.build(p);
            dev.add(p.base, peripheral)?;
        }
        for p in &cfg.peripherals {
            if let Some(source) = p.irq {
                dev.connect_irq(&p.name, source)?;
            }
        }
        Ok(dev)
    }

    fn build(&mut self, cfg: &PeripheralConfig) -> Box<dyn Peripheral> {
        let name = cfg.name.as_str();
        match cfg.kind {
            Kind::Gpio => Box::new(Gpio::new(name)),
            Kind::Uart => {
                let mut uart = Uart::new(name);
                let console = self.console(name);
                uart.on_transmit(move |b| lock(&console).put(b));
                Box::new(uart)
            }
            Kind::Uart16550 => {
                let mut uart = Uart16550::new(name);
                let console = self.console(name);
                uart.on_transmit(move |b| lock(&console).put(b));
                Box::new(uart)
            }
            Kind::Spi => Box::new(Spi::new(name)),
            Kind::I2c => Box::new(I2c::new(name)),
            Kind::Timer => Box::new(Timer::new(name)),
            Kind::Dma => {
                let mut dma = DmaController::new(name);
                match &self.memory {
                    Some(mem) => dma.attach_bus(Box::new(mem.clone())),
                    None => log::warn!("{name}: no memory on this board, transfers will fail"),
                }
                Box::new(dma)
            }
            Kind::Intc => Box::new(InterruptController::new(name)),
        }
    }

    fn console(&mut self, name: &str) -> Arc<Mutex<Console>> {
        self.consoles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Console::new(name))))
            .clone()
    }

    /// Map `peripheral` at `base`. Windows may not overlap each other or
    /// the memory region.
    pub fn add(&mut self, base: u32, mut peripheral: Box<dyn Peripheral>) -> Result<usize, String> {
        let name = peripheral.name().to_string();
        let end = base as u64 + peripheral.size() as u64;

        if self.find(&name).is_some() {
            return Err(format!("Duplicate peripheral name {name}"));
        }
        if end > 1 << 32 {
            return Err(format!("{name} at 0x{base:08x} runs past the end of the address space"));
        }
        if let Some((&b, &idx)) = self.mmio_mappings.range(..=(end - 1) as u32).next_back() {
            let other = &self.peripherals[idx];
            if end > b as u64 && (b as u64 + other.size() as u64) > base as u64 {
                return Err(format!(
                    "{name} at 0x{base:08x} overlaps {} at 0x{b:08x}",
                    other.name()
                ));
            }
        }
        if let Some(mem) = &self.memory {
            let mem_end = mem.base() as u64 + mem.size() as u64;
            if end > mem.base() as u64 && mem_end > base as u64 {
                return Err(format!("{name} at 0x{base:08x} overlaps {}", mem.name()));
            }
        }

        if peripheral.as_any_mut().is::<InterruptController>() {
            if self.intc.is_some() {
                return Err(format!("{name}: only one interrupt controller per board"));
            }
            let cpu_irq = self.cpu_irq.clone();
            let n = name.clone();
            peripheral.connect_irq(Box::new(move |level| {
                log::debug!("{n}: CPU interrupt request {}", if level { "raised" } else { "cleared" });
                cpu_irq.store(level, Ordering::Relaxed);
            }));
            self.intc = Some(self.peripherals.len());
        }

        log::debug!("Mapping {name} at 0x{base:08x} ({} bytes)", peripheral.size());
        let idx = self.peripherals.len();
        self.peripherals.push(peripheral);
        self.mmio_mappings.insert(base, idx);
        Ok(idx)
    }

    /// Wire the IRQ output of `name` to interrupt controller input `source`.
    pub fn connect_irq(&mut self, name: &str, source: usize) -> Result<(), String> {
        if self.intc.is_none() {
            return Err(format!("{name}: irq {source} given but the board has no interrupt controller"));
        }
        let idx = self.find(name).ok_or_else(|| format!("No peripheral named {name}"))?;
        let tx = self.irq_sender.clone();
        self.peripherals[idx].connect_irq(Box::new(move |level| {
            // The receiver lives as long as the device
            let _ = tx.send((source, level));
        }));
        self.route_interrupts();
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.peripherals.iter().position(|p| p.name() == name)
    }

    /// Peripheral index and window offset for `address`.
    fn get_peripheral_idx(&self, address: u32) -> Option<(usize, u32)> {
        let (&base, &idx) = self.mmio_mappings.range(..=address).next_back()?;
        let offset = address - base;
        (offset < self.peripherals[idx].size()).then_some((idx, offset))
    }

    fn memory_at(&self, address: u32) -> Result<&FlatMemory, String> {
        match &self.memory {
            Some(m) if address >= m.base() && address - m.base() < m.size() => Ok(m),
            _ => Err(format!("Nothing mapped at 0x{address:08x}")),
        }
    }

    /// Deliver queued IRQ level changes to the interrupt controller.
    fn route_interrupts(&mut self) {
        let Some(idx) = self.intc else {
            return;
        };
        for (source, level) in self.irq_events.try_iter() {
            log::trace!("irq {source} -> {level}");
            if let Some(intc) = self.peripherals[idx]
                .as_any_mut()
                .downcast_mut::<InterruptController>()
            {
                intc.on_gpio(source, level);
            }
        }
    }

    pub fn read(&mut self, address: u32) -> Result<u32, String> {
        let value = match self.get_peripheral_idx(address) {
            Some((idx, offset)) => self.peripherals[idx].read(offset),
            None => self.memory_at(address)?.read_u32(address)?,
        };
        log::debug!("read  0x{address:08x} -> 0x{value:08x}");
        self.route_interrupts();
        Ok(value)
    }

    pub fn write(&mut self, address: u32, value: u32) -> Result<(), String> {
        log::debug!("write 0x{address:08x} <- 0x{value:08x}");
        match self.get_peripheral_idx(address) {
            Some((idx, offset)) => self.peripherals[idx].write(offset, value),
            None => self.memory_at(address)?.write_u32(address, value)?,
        }
        self.route_interrupts();
        Ok(())
    }

    /// Clock every peripheral `count` times.
    pub fn tick(&mut self, count: u32) {
        for _ in 0..count {
            for p in self.peripherals.iter_mut() {
                p.tick();
            }
            self.route_interrupts();
        }
    }

    /// Feed bytes into the receive path of a serial peripheral.
    pub fn receive(&mut self, name: &str, bytes: &[u8]) -> Result<(), String> {
        let idx = self.find(name).ok_or_else(|| format!("No peripheral named {name}"))?;
        let input = self.peripherals[idx]
            .serial_input()
            .ok_or_else(|| format!("{name} has no receive path"))?;
        input.write_bytes(bytes);
        self.route_interrupts();
        Ok(())
    }

    pub fn set_gpio(&mut self, name: &str, pin: usize, level: bool) -> Result<(), String> {
        self.peripheral_mut::<Gpio>(name)?.set_input(pin, level);
        self.route_interrupts();
        Ok(())
    }

    pub fn request_dma(&mut self, name: &str, channel: usize) -> Result<(), String> {
        self.peripheral_mut::<DmaController>(name)?.request_transfer(channel);
        self.route_interrupts();
        Ok(())
    }

    /// The peripheral called `name`, as its concrete model.
    pub fn peripheral_mut<T: Peripheral + 'static>(&mut self, name: &str) -> Result<&mut T, String> {
        let idx = self.find(name).ok_or_else(|| format!("No peripheral named {name}"))?;
        self.peripherals[idx]
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| format!("{name} is not a {}", std::any::type_name::<T>()))
    }

    pub fn memory(&self) -> Option<&FlatMemory> {
        self.memory.as_ref()
    }

    /// Bytes transmitted so far by the serial peripheral `name`.
    pub fn transmitted(&self, name: &str) -> Option<Vec<u8>> {
        self.consoles.get(name).map(|c| lock(c).transcript.clone())
    }

    /// Level of the interrupt controller output.
    pub fn cpu_irq(&self) -> bool {
        self.cpu_irq.load(Ordering::Relaxed)
    }

    pub fn reset(&mut self) {
        for p in self.peripherals.iter_mut() {
            p.reset();
        }
        self.route_interrupts();
    }

    pub fn step(&mut self, step: &Step) -> Result<(), String> {
        match step {
            Step::Write { addr, value } => self.write(*addr, *value),
            Step::Read { addr, expect, mask } => {
                let value = self.read(*addr)?;
                match expect {
                    Some(e) if value & mask != e & mask => Err(format!(
                        "read 0x{addr:08x} returned 0x{value:08x}, expected 0x{e:08x} (mask 0x{mask:08x})"
                    )),
                    _ => Ok(()),
                }
            }
            Step::Tick { count } => {
                self.tick(*count);
                Ok(())
            }
            Step::Rx { peripheral, text, bytes } => {
                self.receive(peripheral, text.as_bytes())?;
                self.receive(peripheral, bytes)
            }
            Step::Gpio { peripheral, pin, level } => self.set_gpio(peripheral, *pin, *level),
            Step::Dma { peripheral, channel } => self.request_dma(peripheral, *channel),
        }
    }

    /// Run `steps` in order, stopping at the first failure.
    pub fn run(&mut self, steps: &[Step]) -> Result<(), String> {
        for (i, step) in steps.iter().enumerate() {
            log::trace!("step {}: {step:?}", i + 1);
            self.step(step).map_err(|e| format!("Step {}: {e}", i + 1))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"
        [memory]
        base = 0x2000_0000
        size = 0x1000

        [[peripheral]]
        name = "uart0"
        kind = "uart"
        base = 0x4000_0000
        irq = 3

        [[peripheral]]
        name = "tim0"
        kind = "timer"
        base = 0x4000_1000
        irq = 5

        [[peripheral]]
        name = "gpio0"
        kind = "gpio"
        base = 0x4000_2000

        [[peripheral]]
        name = "dma0"
        kind = "dma"
        base = 0x4001_0000

        [[peripheral]]
        name = "intc"
        kind = "intc"
        base = 0x4002_0000
    "#;

    const UART_DATA: u32 = 0x4000_0000;
    const UART_CONTROL: u32 = 0x4000_0008;
    const INTC_ENABLE: u32 = 0x4002_0000;
    const INTC_PENDING: u32 = 0x4002_0004;
    const INTC_ACTIVE: u32 = 0x4002_0008;

    fn board() -> Device {
        Device::from_config(&BoardConfig::parse(BOARD).unwrap()).unwrap()
    }

    #[test]
    fn test_uart_transmit_is_recorded() {
        let mut dev = board();
        dev.write(UART_CONTROL, 1).unwrap();
        dev.write(UART_DATA, 0x41).unwrap();
        dev.write(UART_DATA, b'\n' as u32).unwrap();
        assert_eq!(dev.transmitted("uart0").unwrap(), b"A\n");
        assert_eq!(dev.transmitted("gpio0"), None);
    }

    #[test]
    fn test_uart_receive_routes_to_intc() {
        let mut dev = board();
        dev.write(INTC_ENABLE, 1 << 3).unwrap();
        // RX_ENABLE | RX_INT_ENABLE
        dev.write(UART_CONTROL, 0b1010).unwrap();
        assert!(!dev.cpu_irq());

        dev.receive("uart0", b"x").unwrap();
        assert_eq!(dev.read(INTC_PENDING).unwrap(), 1 << 3);
        assert_eq!(dev.read(INTC_ACTIVE).unwrap(), 3 | 1 << 31);
        assert!(dev.cpu_irq());

        assert_eq!(dev.read(UART_DATA).unwrap(), b'x' as u32);
        assert_eq!(dev.read(INTC_PENDING).unwrap(), 0);
        assert!(!dev.cpu_irq());
    }

    #[test]
    fn test_timer_overflow_through_steps() {
        let mut dev = board();
        let cfg = BoardConfig::parse(r#"
            [[step]]
            op = "write"
            addr = 0x4002_0000
            value = 0x20

            [[step]]
            op = "write"
            addr = 0x4000_1008
            value = 3

            [[step]]
            op = "write"
            addr = 0x4000_1000
            value = 3

            [[step]]
            op = "tick"
            count = 3

            [[step]]
            op = "read"
            addr = 0x4002_0004
            expect = 0x20
        "#).unwrap();
        dev.run(&cfg.steps).unwrap();
        assert!(dev.cpu_irq());
    }

    #[test]
    fn test_failed_expect_names_step() {
        let mut dev = board();
        let steps = [
            Step::Write { addr: 0x2000_0010, value: 0x1234_5678 },
            Step::Read { addr: 0x2000_0010, expect: Some(0x5678), mask: 0xffff },
            Step::Read { addr: 0x2000_0010, expect: Some(0), mask: u32::MAX },
        ];
        let err = dev.run(&steps).unwrap_err();
        assert!(err.starts_with("Step 3:"), "{err}");
    }

    #[test]
    fn test_dma_copies_board_memory() {
        let mut dev = board();
        let mem = dev.memory().unwrap().clone();
        mem.write(0x2000_0000, &[1, 2, 3, 4]).unwrap();

        dev.write(0x4001_0100, 0x2000_0000).unwrap();
        dev.write(0x4001_0104, 0x2000_0100).unwrap();
        dev.write(0x4001_0108, 4).unwrap();
        dev.write(0x4001_010c, 1).unwrap();
        dev.request_dma("dma0", 0).unwrap();
        assert_eq!(mem.read_buf(0x2000_0100, 4).unwrap(), [1, 2, 3, 4]);
        assert_eq!(dev.read(0x2000_0100).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_gpio_and_lookup_errors() {
        let mut dev = board();
        dev.set_gpio("gpio0", 4, true).unwrap();
        assert_eq!(dev.read(0x4000_2000).unwrap(), 1 << 4);

        assert!(dev.set_gpio("uart0", 0, true).is_err());
        assert!(dev.set_gpio("nope", 0, true).is_err());
        assert!(dev.receive("gpio0", b"x").is_err());
        assert!(dev.read(0x3000_0000).is_err());
        assert!(dev.write(0x4000_0100, 0).is_err());
        assert!(dev.peripheral_mut::<Timer>("tim0").is_ok());
    }

    #[test]
    fn test_overlap_rejected() {
        let mut dev = Device::new(Some(FlatMemory::new(0x2000_0000, 0x1000, None)));
        dev.add(0x4000_0000, Box::new(Gpio::new("a"))).unwrap();
        assert!(dev.add(0x4000_0080, Box::new(Gpio::new("b"))).is_err());
        assert!(dev.add(0x3fff_ff80, Box::new(Gpio::new("c"))).is_err());
        assert!(dev.add(0x2000_0800, Box::new(Gpio::new("d"))).is_err());
        assert!(dev.add(0x4000_0000 + Gpio::SIZE, Box::new(Gpio::new("e"))).is_ok());
        assert!(dev.add(0x5000_0000, Box::new(Gpio::new("a"))).is_err());
    }

    #[test]
    fn test_window_past_address_space_rejected() {
        let mut dev = Device::new(None);
        dev.add(0xffff_ff00, Box::new(Gpio::new("top"))).unwrap();
        let err = dev.add(0xffff_f800, Box::new(InterruptController::new("intc"))).unwrap_err();
        assert!(err.contains("address space"));
        assert!(dev.add(0xffff_ff80, Box::new(Gpio::new("wrap"))).is_err());
        assert!(dev.find("intc").is_none());
    }

    #[test]
    fn test_irq_without_intc() {
        let cfg = BoardConfig::parse(r#"
            [[peripheral]]
            name = "gpio0"
            kind = "gpio"
            base = 0x4000_0000
            irq = 1
        "#).unwrap();
        assert!(Device::from_config(&cfg).is_err());
    }
}
