//! Eight-channel DMA controller.
//!
//! Transfers are immediate: setting CTRL.START (or calling
//! [`DmaController::request_transfer`]) copies the whole block through the
//! attached [`SystemBus`] before the write returns. CONTROL.ENABLE is kept
//! for software to read back; it does not gate channels.

use std::any::Any;

use crate::irq::InterruptAggregator;
use crate::line::Sink;
use crate::register::{Access, Field, RegisterBank, RegisterMap};
use crate::transfer::{DmaChannel, SystemBus};

use super::Peripheral;

pub const NUM_CHANNELS: usize = 8;

const CHANNEL_BASE: u32 = 0x100;
const CHANNEL_STRIDE: u32 = 0x20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
enum Registers {
    #[offset(0x00)]
    Control,
    Status,
}

pub type Bus = Box<dyn SystemBus + Send>;

pub struct DmaState {
    enabled: bool,
    channels: Vec<DmaChannel>,
    bus: Option<Bus>,
    irq: InterruptAggregator,
}

impl DmaState {
    fn new() -> Self {
        Self {
            enabled: false,
            channels: (0..NUM_CHANNELS).map(DmaChannel::new).collect(),
            bus: None,
            irq: InterruptAggregator::or(NUM_CHANNELS),
        }
    }

    fn reset(&mut self) {
        self.enabled = false;
        for ch in self.channels.iter_mut() {
            ch.reset();
        }
        self.update_interrupts();
    }

    fn start(&mut self, index: usize) {
        let Some(ch) = self.channels.get_mut(index) else {
            log::warn!("DMA: invalid channel {index}");
            return;
        };
        match self.bus.as_deref_mut() {
            Some(bus) => {
                ch.trigger(bus);
            }
            None => log::warn!("DMA: channel {index} started with no bus attached"),
        }
        self.update_interrupts();
    }

    fn status(&mut self) -> u32 {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.interrupt_pending)
            .fold(0, |w, (i, _)| w | (1 << i))
    }

    fn update_interrupts(&mut self) {
        for (i, ch) in self.channels.iter().enumerate() {
            self.irq.set(i, ch.interrupt_enabled, ch.interrupt_pending);
        }
        self.irq.update();
    }
}

fn flag(b: bool) -> u32 {
    b as u32
}

fn build_registers(bank: &mut RegisterBank<DmaState>) {
    bank.define(Registers::Control, |r| r
        .field(Field::flag("ENABLE", 0, Access::ReadWrite)
            .on_write(|s: &mut DmaState, v| s.enabled = v != 0))
        .reserved(1, 31));

    bank.define(Registers::Status, |r| r
        .field(Field::new("PENDING", 0, NUM_CHANNELS as u32, Access::ReadOnly)
            .on_read(DmaState::status)));

    for i in 0..NUM_CHANNELS {
        let base = CHANNEL_BASE + CHANNEL_STRIDE * i as u32;

        bank.define_at(base, format!("CH{i}_SRC"), |r| r
            .field(Field::new("SRC", 0, 32, Access::ReadWrite)
                .on_read(move |s: &mut DmaState| s.channels[i].source)
                .on_write(move |s: &mut DmaState, v| s.channels[i].source = v)));

        bank.define_at(base + 0x4, format!("CH{i}_DST"), |r| r
            .field(Field::new("DST", 0, 32, Access::ReadWrite)
                .on_read(move |s: &mut DmaState| s.channels[i].destination)
                .on_write(move |s: &mut DmaState, v| s.channels[i].destination = v)));

        bank.define_at(base + 0x8, format!("CH{i}_COUNT"), |r| r
            .field(Field::new("COUNT", 0, 32, Access::ReadWrite)
                .on_read(move |s: &mut DmaState| s.channels[i].count)
                .on_write(move |s: &mut DmaState, v| s.channels[i].count = v)));

        bank.define_at(base + 0xc, format!("CH{i}_CTRL"), |r| r
            .field(Field::flag("ENABLE", 0, Access::ReadWrite)
                .on_read(move |s: &mut DmaState| flag(s.channels[i].enabled))
                .on_write(move |s: &mut DmaState, v| s.channels[i].set_enabled(v != 0)))
            .field(Field::flag("INT_ENABLE", 1, Access::ReadWrite)
                .on_read(move |s: &mut DmaState| flag(s.channels[i].interrupt_enabled))
                .on_write(move |s: &mut DmaState, v| s.channels[i].interrupt_enabled = v != 0))
            .field(Field::flag("INT_FLAG", 2, Access::WriteOneToClear)
                .on_read(move |s: &mut DmaState| flag(s.channels[i].interrupt_pending))
                .on_write(move |s: &mut DmaState, _| s.channels[i].clear_interrupt()))
            .field(Field::flag("START", 3, Access::WriteOnly)
                .on_write(move |s: &mut DmaState, v| if v != 0 { s.start(i) }))
            .reserved(4, 28)
            .after_write(DmaState::update_interrupts));
    }
}

pub struct DmaController {
    name: String,
    bank: RegisterBank<DmaState>,
    state: DmaState,
}

impl DmaController {
    pub const SIZE: u32 = 0x1000;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut bank = RegisterBank::new(name.clone());
        build_registers(&mut bank);
        let mut dma = Self {
            name,
            bank,
            state: DmaState::new(),
        };
        dma.reset();
        dma
    }

    /// Memory the channels copy within.
    pub fn attach_bus(&mut self, bus: Bus) {
        self.state.bus = Some(bus);
    }

    /// Hardware request line for `channel`.
    pub fn request_transfer(&mut self, channel: usize) {
        self.state.start(channel);
    }

    pub fn channel(&self, index: usize) -> Option<&DmaChannel> {
        self.state.channels.get(index)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn irq_asserted(&self) -> bool {
        self.state.irq.is_asserted()
    }
}

impl Peripheral for DmaController {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    const CONTROL: u32 = 0x000;
    const STATUS: u32 = 0x004;

    const EN: u32 = 1 << 0;
    const IE: u32 = 1 << 1;
    const FLAG: u32 = 1 << 2;
    const START: u32 = 1 << 3;

    fn src(ch: u32) -> u32 {
        0x100 + 0x20 * ch
    }

    fn dst(ch: u32) -> u32 {
        src(ch) + 0x4
    }

    fn count(ch: u32) -> u32 {
        src(ch) + 0x8
    }

    fn ctrl(ch: u32) -> u32 {
        src(ch) + 0xc
    }

    fn setup() -> (DmaController, FlatMemory) {
        let mem = FlatMemory::new(0x1000, 0x2000, None);
        let mut dma = DmaController::new("dma0");
        dma.attach_bus(Box::new(mem.clone()));
        mem.write(0x1000, &[0xde, 0xad, 0xbe, 0xef, 0x55]).unwrap();
        (dma, mem)
    }

    #[test]
    fn test_software_start_copies_block() {
        let (mut dma, mem) = setup();
        dma.write(src(0), 0x1000);
        dma.write(dst(0), 0x2000);
        dma.write(count(0), 4);
        dma.write(ctrl(0), EN | IE | START);

        assert_eq!(mem.read_buf(0x2000, 5).unwrap(), [0xde, 0xad, 0xbe, 0xef, 0]);
        assert_eq!(dma.read(ctrl(0)), EN | IE | FLAG);
        assert_eq!(dma.read(STATUS), 1);
        assert!(dma.irq_asserted());

        dma.write(ctrl(0), EN | IE | FLAG);
        assert_eq!(dma.read(STATUS), 0);
        assert!(!dma.irq_asserted());
    }

    #[test]
    fn test_request_transfer() {
        let (mut dma, mem) = setup();
        dma.write(src(5), 0x1001);
        dma.write(dst(5), 0x2800);
        dma.write(count(5), 2);
        dma.write(ctrl(5), EN);
        dma.request_transfer(5);

        assert_eq!(mem.read_buf(0x2800, 2).unwrap(), [0xad, 0xbe]);
        // No interrupt enable: nothing latched
        assert_eq!(dma.read(STATUS), 0);
        assert!(!dma.channel(5).unwrap().interrupt_pending);

        dma.request_transfer(NUM_CHANNELS);
    }

    #[test]
    fn test_disabled_or_empty_channel_does_nothing() {
        let (mut dma, mem) = setup();
        dma.write(src(1), 0x1000);
        dma.write(dst(1), 0x2000);
        dma.write(count(1), 4);
        dma.write(ctrl(1), IE | START);
        assert_eq!(mem.read_u32(0x2000).unwrap(), 0);

        dma.write(count(1), 0);
        dma.write(ctrl(1), EN | IE | START);
        assert_eq!(mem.read_u32(0x2000).unwrap(), 0);
        assert_eq!(dma.read(STATUS), 0);
    }

    #[test]
    fn test_bus_error_latches_nothing() {
        let (mut dma, _mem) = setup();
        dma.write(src(2), 0x1000);
        dma.write(dst(2), 0x9000);
        dma.write(count(2), 4);
        dma.write(ctrl(2), EN | IE | START);
        assert_eq!(dma.read(STATUS), 0);
    }

    #[test]
    fn test_global_enable_does_not_gate() {
        let (mut dma, mem) = setup();
        assert!(!dma.is_enabled());
        dma.write(src(0), 0x1000);
        dma.write(dst(0), 0x1800);
        dma.write(count(0), 1);
        dma.write(ctrl(0), EN | START);
        assert_eq!(mem.read_buf(0x1800, 1).unwrap(), [0xde]);

        dma.write(CONTROL, 1);
        assert!(dma.is_enabled());
        assert_eq!(dma.read(CONTROL), 1);
    }

    #[test]
    fn test_channel_registers_read_back() {
        let mut dma = DmaController::new("dma0");
        dma.write(src(7), 0x1234_5678);
        dma.write(ctrl(7), EN | START);
        assert_eq!(dma.read(src(7)), 0x1234_5678);
        assert_eq!(dma.read(ctrl(7)), EN);
        dma.reset();
        assert_eq!(dma.read(src(7)), 0);
        assert_eq!(dma.read(ctrl(7)), 0);
    }
}
