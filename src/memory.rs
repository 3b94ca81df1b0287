//! Flat RAM region, the simplest [`SystemBus`] there is.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};

use crate::transfer::SystemBus;

/// A block of little-endian memory at a fixed base address. Clones share
/// the same storage, so a DMA controller and the code inspecting memory
/// can both hold one.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    name: &'static str,
    base: u32,
    data: Arc<Mutex<Box<[u8]>>>,
}

impl FlatMemory {
    pub fn new(base: u32, size: u32, name: Option<&'static str>) -> Self {
        let name = name.unwrap_or("SRAM");
        let data = vec![0; size as usize].into_boxed_slice();
        Self {
            name,
            base,
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.lock().len() as u32
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, address: u32, length: u32) -> Result<std::ops::Range<usize>, String> {
        let size = self.size() as u64;
        let start = (address as u64).checked_sub(self.base as u64);
        match start {
            Some(start) if start + length as u64 <= size => {
                Ok(start as usize..(start + length as u64) as usize)
            }
            _ => Err(format!(
                "{}: {length} bytes at 0x{address:08x} outside 0x{:08x}..0x{:08x}",
                self.name,
                self.base,
                self.base as u64 + size
            )),
        }
    }

    pub fn read_into(&self, address: u32, destination: &mut [u8]) -> Result<(), String> {
        let r = self.range(address, destination.len() as u32)?;
        destination.copy_from_slice(&self.lock()[r]);
        Ok(())
    }

    pub fn write(&self, address: u32, data: &[u8]) -> Result<(), String> {
        let r = self.range(address, data.len() as u32)?;
        self.lock()[r].copy_from_slice(data);
        Ok(())
    }

    pub fn read_buf(&self, address: u32, length: u32) -> Result<Vec<u8>, String> {
        let mut buf = vec![0; length as usize];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, String> {
        let mut buf = [0u8; 4];
        self.read_into(address, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Result<(), String> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(address, &buf)
    }
}

impl SystemBus for FlatMemory {
    fn copy_memory(&mut self, source: u32, destination: u32, count: u32) -> Result<(), String> {
        let src = self.range(source, count)?;
        let dst = self.range(destination, count)?;
        self.lock().copy_within(src, dst.start);
        Ok(())
    }
}
