//! Pci configuration space access.

use crate::x86_64::pio::Pio;
use uni_lock::{UniLock, UniLockGuard};

const CONFIG_ADDRESS: u16 = 0xcf8;
const CONFIG_DATA: u16 = 0xcfc;

/// Configuration-space offset of the command register.
const COMMAND: u8 = 0x04;
/// Configuration-space offset of the first base address register.
const BAR0: u8 = 0x10;
/// Configuration-space offset of the interrupt line.
const INTERRUPT_LINE: u8 = 0x3c;

bitflags::bitflags! {
    /// Pci command register bits.
    struct PciCommand: u32 {
        /// Respond to io space accesses.
        const IO_SPACE = 1 << 0;
        /// Respond to memory space accesses.
        const MEMORY_SPACE = 1 << 1;
        /// Allow the device to master the bus (DMA).
        const BUS_MASTER = 1 << 2;
    }
}

// The address/data port pair is one shared resource.
fn config_lock() -> UniLockGuard<'static, ()> {
    static PCI_LOCK: UniLock<()> = UniLock::new(());
    PCI_LOCK.lock()
}

/// One bus/device/function triple in configuration space.
#[derive(Debug, Clone, Copy)]
pub struct PciFunction {
    bus: u8,
    device: u8,
    function: u8,
}

impl PciFunction {
    /// Name a function by its bus/device/function triple.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        PciFunction {
            bus,
            device,
            function,
        }
    }

    fn address(&self, offset: u8) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32 & !0x3)
    }

    /// Read the 32-bit configuration register at `offset`.
    pub fn read_config(&self, offset: u8) -> u32 {
        let _guard = config_lock();
        Pio::new(CONFIG_ADDRESS).write_u32(self.address(offset));
        Pio::new(CONFIG_DATA).read_u32()
    }

    /// Write the 32-bit configuration register at `offset`.
    pub fn write_config(&self, offset: u8, v: u32) {
        let _guard = config_lock();
        Pio::new(CONFIG_ADDRESS).write_u32(self.address(offset));
        Pio::new(CONFIG_DATA).write_u32(v)
    }

    /// Set the bus-mastering bit so the device can DMA.
    pub fn enable_bus_mastering(&self) {
        let command = self.read_config(COMMAND);
        self.write_config(COMMAND, command | PciCommand::BUS_MASTER.bits());
    }

    /// The io register window base from the first base address register.
    pub fn io_base(&self) -> u16 {
        (self.read_config(BAR0) & !0x3) as u16
    }

    /// The IRQ line assigned to this function.
    pub fn interrupt_line(&self) -> u8 {
        (self.read_config(INTERRUPT_LINE) & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::PciFunction;

    #[test]
    fn address_encoding() {
        let f = PciFunction::new(0, 3, 0);
        assert_eq!(f.address(0x10), 0x8000_1810);
        let f = PciFunction::new(1, 0, 2);
        assert_eq!(f.address(0x3c), 0x8001_023c);
        // Offsets are dword-aligned on the wire.
        assert_eq!(f.address(0x3e), 0x8001_023c);
    }
}
