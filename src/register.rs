//! Bit-field register banks.
//!
//! A peripheral describes its register window once, at construction, as a
//! table of [`Register`]s keyed by offset. Each register is a list of
//! [`Field`]s with an [`Access`] mode and optional provider/consumer
//! functions that operate on the peripheral's state type `S`. The bank
//! turns raw 32-bit reads and writes into those field calls.
//!
//! Registers are always 32-bit in this universe.

use std::collections::BTreeMap;

pub(crate) use periphsim_macros::RegisterMap;

/// Peripheral-local table of register offsets, usually derived with
/// `#[derive(RegisterMap)]` on a fieldless enum.
pub trait RegisterMap: Copy + 'static {
    const ALL: &'static [Self];

    fn offset(self) -> u32;

    fn name(self) -> &'static str;

    fn from_offset(offset: u32) -> Option<Self>;
}

/// How a field reacts to bus accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    /// Writes are silently ignored.
    ReadOnly,
    /// Reads return 0; writes reach the consumer but are not stored.
    WriteOnly,
    /// Written ones are clear requests; written zeroes do nothing.
    WriteOneToClear,
    /// The sampled value is cleared as a side effect of the read.
    ReadToClear,
}

pub type Provider<S> = Box<dyn Fn(&mut S) -> u32 + Send + Sync>;
pub type Consumer<S> = Box<dyn Fn(&mut S, u32) + Send + Sync>;
pub type Hook<S> = Box<dyn Fn(&mut S) + Send + Sync>;

fn width_mask(width: u32) -> u32 {
    if width >= 32 { u32::MAX } else { (1 << width) - 1 }
}

/// A named bit range inside a register.
pub struct Field<S> {
    name: &'static str,
    offset: u32,
    width: u32,
    access: Access,
    reset: u32,
    value: u32,
    provider: Option<Provider<S>>,
    consumer: Option<Consumer<S>>,
}

impl<S> Field<S> {
    pub fn new(name: &'static str, offset: u32, width: u32, access: Access) -> Self {
        assert!(width >= 1 && width <= 32, "Field {name}: width {width} out of range");
        assert!(offset + width <= 32, "Field {name}: bits {offset}+{width} exceed 32-bit register");
        Self {
            name,
            offset,
            width,
            access,
            reset: 0,
            value: 0,
            provider: None,
            consumer: None,
        }
    }

    /// Single-bit field.
    pub fn flag(name: &'static str, bit: u32, access: Access) -> Self {
        Self::new(name, bit, 1, access)
    }

    pub fn with_reset(mut self, reset: u32) -> Self {
        assert!(reset & !width_mask(self.width) == 0,
            "Field {}: reset value 0x{reset:x} does not fit in {} bits", self.name, self.width);
        self.reset = reset;
        self.value = reset;
        self
    }

    pub fn on_read(mut self, provider: impl Fn(&mut S) -> u32 + Send + Sync + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    pub fn on_write(mut self, consumer: impl Fn(&mut S, u32) + Send + Sync + 'static) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn mask(&self) -> u32 {
        width_mask(self.width) << self.offset
    }

    fn sample(&mut self, state: &mut S) -> u32 {
        let v = match &self.provider {
            Some(p) => p(state),
            None => self.value,
        };
        v & width_mask(self.width)
    }

    fn read(&mut self, state: &mut S) -> u32 {
        match self.access {
            Access::WriteOnly => 0,
            Access::ReadToClear => {
                let v = self.sample(state);
                if v != 0 {
                    match &self.consumer {
                        Some(c) => c(state, v),
                        None => self.value &= !v,
                    }
                }
                v
            }
            _ => self.sample(state),
        }
    }

    fn write(&mut self, state: &mut S, raw: u32) {
        let v = (raw >> self.offset) & width_mask(self.width);
        match self.access {
            Access::ReadOnly | Access::ReadToClear => (),
            Access::WriteOneToClear => {
                if v != 0 {
                    self.value &= !v;
                    if let Some(c) = &self.consumer {
                        c(state, v);
                    }
                }
            }
            Access::WriteOnly => {
                if let Some(c) = &self.consumer {
                    c(state, v);
                }
            }
            Access::ReadWrite => {
                self.value = v;
                if let Some(c) = &self.consumer {
                    c(state, v);
                }
            }
        }
    }
}

/// One 32-bit register: fields in ascending bit order, everything else
/// reserved.
pub struct Register<S> {
    name: String,
    fields: Vec<Field<S>>,
    reserved: u32,
    strict: u32,
    post_write: Option<Hook<S>>,
}

impl<S> Register<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            reserved: 0,
            strict: 0,
            post_write: None,
        }
    }

    fn used(&self) -> u32 {
        self.fields.iter().fold(self.reserved, |m, f| m | f.mask())
    }

    pub fn field(mut self, field: Field<S>) -> Self {
        assert!(self.used() & field.mask() == 0,
            "Register {}: field {} overlaps an existing range", self.name, field.name);
        let pos = self.fields.partition_point(|f| f.offset < field.offset);
        self.fields.insert(pos, field);
        self
    }

    /// Explicitly reserved bits. Writes are ignored.
    pub fn reserved(mut self, offset: u32, width: u32) -> Self {
        assert!(width >= 1 && offset + width <= 32,
            "Register {}: reserved bits {offset}+{width} out of range", self.name);
        let mask = width_mask(width) << offset;
        assert!(self.used() & mask == 0,
            "Register {}: reserved bits {offset}+{width} overlap a field", self.name);
        self.reserved |= mask;
        self
    }

    /// Reserved bits that must be written as zero; a nonzero write is
    /// reported and then ignored.
    pub fn strict_reserved(mut self, offset: u32, width: u32) -> Self {
        self = self.reserved(offset, width);
        self.strict |= width_mask(width) << offset;
        self
    }

    /// Runs once after every field of a write has been applied.
    pub fn after_write(mut self, hook: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        self.post_write = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        for f in self.fields.iter_mut() {
            f.value = f.reset;
        }
    }

    fn read(&mut self, state: &mut S) -> u32 {
        let mut value = 0;
        for f in self.fields.iter_mut() {
            value |= f.read(state) << f.offset;
        }
        value
    }

    fn write(&mut self, state: &mut S, value: u32) {
        if value & self.strict != 0 {
            log::warn!("{}: nonzero write 0x{:08x} to reserved bits", self.name, value & self.strict);
        }
        for f in self.fields.iter_mut() {
            f.write(state, value);
        }
        if let Some(hook) = &self.post_write {
            hook(state);
        }
    }

    #[cfg(test)]
    fn stored(&self) -> u32 {
        self.fields.iter()
            .filter(|f| f.access != Access::WriteOnly)
            .fold(0, |v, f| v | (f.value << f.offset))
    }
}

/// All registers of one peripheral window.
pub struct RegisterBank<S> {
    name: String,
    registers: BTreeMap<u32, Register<S>>,
}

impl<S> RegisterBank<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registers: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Define the register named by `reg`.
    pub fn define<R: RegisterMap>(&mut self, reg: R,
            build: impl FnOnce(Register<S>) -> Register<S>) -> &mut Self {
        self.define_at(reg.offset(), reg.name(), build)
    }

    /// Define a register at a computed offset (channel blocks, tables).
    pub fn define_at(&mut self, offset: u32, name: impl Into<String>,
            build: impl FnOnce(Register<S>) -> Register<S>) -> &mut Self {
        assert!((offset & 3) == 0, "Register address must be aligned on word boundary");
        let reg = build(Register::new(name));
        assert!(!self.registers.contains_key(&offset),
            "{}: register {} redefines offset 0x{offset:x}", self.name, reg.name);
        self.registers.insert(offset, reg);
        self
    }

    #[cfg(test)]
    pub fn contains(&self, offset: u32) -> bool {
        self.registers.contains_key(&offset)
    }

    pub fn read(&mut self, state: &mut S, offset: u32) -> u32 {
        match self.registers.get_mut(&offset) {
            Some(r) => {
                let v = r.read(state);
                log::trace!("{}: read {} (0x{offset:03x}) -> 0x{v:08x}", self.name, r.name);
                v
            }
            None => {
                log::warn!("{}: read from unmapped offset 0x{offset:03x}", self.name);
                0
            }
        }
    }

    pub fn write(&mut self, state: &mut S, offset: u32, value: u32) {
        match self.registers.get_mut(&offset) {
            Some(r) => {
                log::trace!("{}: write {} (0x{offset:03x}) <- 0x{value:08x}", self.name, r.name);
                r.write(state, value);
            }
            None => {
                log::warn!("{}: write 0x{value:08x} to unmapped offset 0x{offset:03x} ignored",
                    self.name);
            }
        }
    }

    /// Stored field values of a register, without running providers.
    #[cfg(test)]
    pub fn peek(&self, offset: u32) -> Option<u32> {
        self.registers.get(&offset).map(|r| r.stored())
    }

    pub fn reset(&mut self) {
        for r in self.registers.values_mut() {
            r.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct State {
        enable: bool,
        mode: u32,
        status: u32,
        hook_saw: Option<(bool, u32)>,
        reads: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, RegisterMap)]
    enum Registers {
        #[offset(0x00)]
        Control,
        Status,
        #[offset(0x10)]
        Scratch,
        InterruptEnable,
    }

    fn bank() -> RegisterBank<State> {
        let mut bank = RegisterBank::new("test");
        bank.define(Registers::Control, |r| r
            .field(Field::flag("EN", 0, Access::ReadWrite)
                .on_write(|s: &mut State, v| s.enable = v != 0))
            .field(Field::new("MODE", 4, 3, Access::ReadWrite)
                .on_read(|s: &mut State| s.mode)
                .on_write(|s: &mut State, v| s.mode = v))
            .strict_reserved(8, 24)
            .after_write(|s: &mut State| s.hook_saw = Some((s.enable, s.mode))));
        bank.define(Registers::Status, |r| r
            .field(Field::new("FLAGS", 0, 4, Access::WriteOneToClear)
                .on_read(|s: &mut State| s.status)
                .on_write(|s: &mut State, v| s.status &= !v))
            .field(Field::new("COUNT", 8, 8, Access::ReadOnly)
                .on_read(|s: &mut State| { s.reads += 1; s.reads })));
        bank.define(Registers::Scratch, |r| r
            .field(Field::new("LOW", 0, 16, Access::ReadWrite).with_reset(0x1234))
            .field(Field::new("KEY", 16, 8, Access::WriteOnly)));
        bank.define(Registers::InterruptEnable, |r| r
            .field(Field::new("PENDING", 0, 8, Access::ReadToClear)));
        bank
    }

    #[test]
    fn test_register_map_derive() {
        assert_eq!(Registers::Control.offset(), 0x00);
        assert_eq!(Registers::Status.offset(), 0x04);
        assert_eq!(Registers::Scratch.offset(), 0x10);
        assert_eq!(Registers::InterruptEnable.offset(), 0x14);
        assert_eq!(Registers::InterruptEnable.name(), "INTERRUPT_ENABLE");
        assert_eq!(Registers::from_offset(0x10), Some(Registers::Scratch));
        assert_eq!(Registers::from_offset(0x08), None);
        assert_eq!(Registers::ALL.len(), 4);
    }

    #[test]
    fn test_storage_round_trip() {
        let mut bank = bank();
        let mut s = State::default();

        assert_eq!(bank.read(&mut s, 0x10), 0x1234);
        bank.write(&mut s, 0x10, 0xabcd);
        let v = bank.read(&mut s, 0x10);
        bank.write(&mut s, 0x10, v);
        assert_eq!(bank.read(&mut s, 0x10), v);
        assert_eq!(v, 0xabcd);
    }

    #[test]
    fn test_reserved_bits_read_zero() {
        let mut bank = bank();
        let mut s = State::default();

        bank.write(&mut s, 0x00, 0xffff_ffff);
        assert_eq!(bank.read(&mut s, 0x00), 0x71);
        bank.write(&mut s, 0x10, 0xffff_ffff);
        // KEY is write-only, bits 24..31 are implicitly reserved
        assert_eq!(bank.read(&mut s, 0x10), 0xffff);
    }

    #[test]
    fn test_post_write_hook_sees_all_fields() {
        let mut bank = bank();
        let mut s = State::default();

        bank.write(&mut s, 0x00, 0x51);
        assert_eq!(s.hook_saw, Some((true, 5)));
    }

    #[test]
    fn test_write_one_to_clear() {
        let mut bank = bank();
        let mut s = State { status: 0b1011, ..Default::default() };

        bank.write(&mut s, 0x04, 0b0010);
        assert_eq!(s.status, 0b1001);
        // Zeroes leave the flags alone
        bank.write(&mut s, 0x04, 0);
        assert_eq!(s.status, 0b1001);
        assert_eq!(bank.read(&mut s, 0x04) & 0xf, 0b1001);
    }

    #[test]
    fn test_read_only_ignores_writes() {
        let mut bank = bank();
        let mut s = State::default();

        bank.write(&mut s, 0x04, 0xff00);
        assert_eq!(s.reads, 0);
        assert_eq!(bank.read(&mut s, 0x04) >> 8, 1);
    }

    #[test]
    fn test_read_to_clear() {
        let mut bank = bank();
        let mut s = State::default();

        // Writes do not land in a read-to-clear field
        bank.write(&mut s, 0x14, 0x5);
        assert_eq!(bank.read(&mut s, 0x14), 0);

        let mut latched = RegisterBank::<State>::new("latched");
        latched.define_at(0x0, "LSR", |r| r
            .field(Field::new("ERR", 0, 4, Access::ReadToClear)
                .on_read(|s: &mut State| s.status)
                .on_write(|s: &mut State, v| s.status &= !v)));
        s.status = 0b0110;
        assert_eq!(latched.read(&mut s, 0x0), 0b0110);
        assert_eq!(s.status, 0);
        assert_eq!(latched.read(&mut s, 0x0), 0);
    }

    #[test]
    fn test_unmapped_access() {
        let mut bank = bank();
        let mut s = State::default();

        assert_eq!(bank.read(&mut s, 0x40), 0);
        bank.write(&mut s, 0x40, 0xdead_beef);
        assert!(!bank.contains(0x40));
    }

    #[test]
    fn test_reset_restores_fields() {
        let mut bank = bank();
        let mut s = State::default();

        bank.write(&mut s, 0x10, 0x00ff_0042);
        assert_eq!(bank.peek(0x10), Some(0x42));
        bank.reset();
        assert_eq!(bank.peek(0x10), Some(0x1234));
        assert_eq!(bank.peek(0x44), None);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_fields_rejected() {
        let _ = Register::<State>::new("BAD")
            .field(Field::new("A", 0, 4, Access::ReadWrite))
            .field(Field::new("B", 3, 2, Access::ReadWrite));
    }

    #[test]
    #[should_panic(expected = "exceed")]
    fn test_field_beyond_bit_31_rejected() {
        let _ = Field::<State>::new("WIDE", 30, 4, Access::ReadWrite);
    }

    #[test]
    #[should_panic(expected = "redefines")]
    fn test_duplicate_offset_rejected() {
        let mut bank = RegisterBank::<State>::new("dup");
        bank.define_at(0x8, "A", |r| r);
        bank.define_at(0x8, "B", |r| r);
    }
}
