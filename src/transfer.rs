//! DMA channels and the memory-copy seam they consume.

/// The system bus as seen by DMA: a raw memory copy.
pub trait SystemBus {
    fn copy_memory(&mut self, source: u32, destination: u32, count: u32) -> Result<(), String>;
}

impl<F> SystemBus for F
where
    F: FnMut(u32, u32, u32) -> Result<(), String>,
{
    fn copy_memory(&mut self, source: u32, destination: u32, count: u32) -> Result<(), String> {
        self(source, destination, count)
    }
}

/// One DMA channel. Transfers complete within [`DmaChannel::trigger`];
/// there is no observable in-flight state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmaChannel {
    index: usize,
    pub source: u32,
    pub destination: u32,
    pub count: u32,
    pub enabled: bool,
    pub interrupt_enabled: bool,
    pub interrupt_pending: bool,
}

impl DmaChannel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn configure(&mut self, source: u32, destination: u32, count: u32) {
        self.source = source;
        self.destination = destination;
        self.count = count;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Copy `count` bytes if the channel is enabled and has work. Returns
    /// true when a transfer happened; the interrupt flag is latched if the
    /// channel has its interrupt enabled.
    pub fn trigger(&mut self, bus: &mut dyn SystemBus) -> bool {
        if !self.enabled || self.count == 0 {
            log::debug!("DMA channel {}: trigger ignored (enabled={}, count={})",
                self.index, self.enabled, self.count);
            return false;
        }

        if let Err(e) = bus.copy_memory(self.source, self.destination, self.count) {
            log::warn!("DMA channel {}: transfer failed: {e}", self.index);
            return false;
        }

        log::debug!("DMA channel {}: copied {} bytes 0x{:08x} -> 0x{:08x}",
            self.index, self.count, self.source, self.destination);

        if self.interrupt_enabled {
            self.interrupt_pending = true;
        }
        true
    }

    pub fn clear_interrupt(&mut self) {
        self.interrupt_pending = false;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.index);
    }
}
