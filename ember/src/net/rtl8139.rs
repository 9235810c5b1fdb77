//! RTL8139 network interface driver.
//!
//! The device copies received frames into one physically contiguous
//! receive ring. Each frame is prefixed by a 4-byte header: per-frame
//! status in the low 16 bits, the length of the frame body plus its
//! trailing CRC in the high 16 bits. The driver owns a monotonically
//! increasing read cursor over that ring; the position inside the buffer
//! is always `cursor % capacity`.
//!
//! Receive handling runs entirely in interrupt context and hands each
//! payload to the link layer synchronously, which keeps interrupts masked
//! for the whole decode. Moving decode out of the handler would need a
//! deferred-work context this kernel does not have.

use super::ring::RxRing;
use super::{FrameSink, Interface, MacAddr, NetError};
use crate::interrupt;
use crate::mm::{MapFlags, PageMapper, PhysAllocator, VirtAllocator};
use alloc::sync::Arc;
use alloc::vec;
use cinder::addressing::{Pa, PAGE_SIZE};
use cinder::dev::pci::PciFunction;
use cinder::dev::{IoWindow, RegisterWindow};
use uni_lock::UniLock;

// Register window offsets.
const MAC0: u16 = 0x00;
const RX_BUF: u16 = 0x30;
const CMD: u16 = 0x37;
const RX_BUF_PTR: u16 = 0x38;
const RX_BUF_ADDR: u16 = 0x3a;
const IMR: u16 = 0x3c;
const ISR: u16 = 0x3e;
const RCR: u16 = 0x44;
const RX_MISSED: u16 = 0x4c;
const CONFIG_1: u16 = 0x52;

/// Pages backing the receive ring.
pub const RX_RING_PAGES: usize = 3;
/// Ring capacity in bytes. Three pages is more than the window advertised
/// to the device, so a long frame written past the advertised end still
/// lands inside the buffer.
pub const RX_RING_BYTES: usize = RX_RING_PAGES * PAGE_SIZE;

// The hardware read-pointer register trails the cursor by 16 bytes.
const RX_PTR_BIAS: u64 = 0x10;

bitflags::bitflags! {
    /// Command register bits.
    struct Command: u8 {
        /// Receive ring holds no unread frame.
        const BUFE = 0x01;
        /// Transmitter enable.
        const TE = 0x04;
        /// Receiver enable.
        const RE = 0x08;
        /// Software reset in progress.
        const RST = 0x10;
    }
}

bitflags::bitflags! {
    /// Interrupt mask/status bits.
    struct Intr: u16 {
        /// Receive completed.
        const ROK = 0x0001;
        /// Transmit completed.
        const TOK = 0x0004;
    }
}

bitflags::bitflags! {
    /// Receive configuration register bits.
    struct RxConfig: u32 {
        /// Accept all packets.
        const AAP = 1 << 0;
        /// Accept physical-match packets.
        const APM = 1 << 1;
        /// Accept multicast packets.
        const AM = 1 << 2;
        /// Accept broadcast packets.
        const AB = 1 << 3;
        /// Let long packets run past the advertised ring end.
        const WRAP = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Per-frame receive status, the low 16 bits of the ring header.
    struct RxStatus: u16 {
        const OK = 0x0001;
        const BAD_ALIGN = 0x0002;
        const CRC_ERR = 0x0004;
        const TOO_LONG = 0x0008;
        const RUNT = 0x0010;
        const BAD_SYMBOL = 0x0020;
        const BROADCAST = 0x2000;
        const PHYSICAL = 0x4000;
        const MULTICAST = 0x8000;
    }
}

impl RxStatus {
    fn is_faulty(self) -> bool {
        self.intersects(
            Self::BAD_SYMBOL | Self::RUNT | Self::TOO_LONG | Self::CRC_ERR | Self::BAD_ALIGN,
        )
    }
}

/// One RTL8139 instance.
///
/// Touched from exactly two places: device bring-up and the receive
/// interrupt handler, which serialize through the lock wrapping this
/// descriptor. There is no teardown; the descriptor and its ring live as
/// long as the kernel.
pub struct Rtl8139<W: RegisterWindow> {
    regs: W,
    ring: RxRing,
    ring_pa: Pa,
    // Monotone logical read offset; never reduced, never reset after
    // bring-up.
    cursor: u64,
}

impl<W: RegisterWindow> Rtl8139<W> {
    /// Power the device on, reset it, and hand it the receive ring.
    ///
    /// Spins until the device clears the reset bit; a device that never
    /// does hangs the boot here.
    pub fn attach(regs: W, mut ring: RxRing, ring_pa: Pa) -> Self {
        regs.write_u8(CONFIG_1, 0x00);

        regs.write_u8(CMD, Command::RST.bits());
        while Command::from_bits_truncate(regs.read_u8(CMD)).contains(Command::RST) {
            core::hint::spin_loop();
        }

        regs.write_u32(RX_BUF, unsafe { ring_pa.into_usize() } as u32);
        regs.write_u32(RX_BUF_PTR, 0);
        regs.write_u32(RX_BUF_ADDR, 0);
        ring.fill_zero();
        trace!("rtl8139: receive ring {:?}, {} bytes", ring_pa, ring.capacity());

        Rtl8139 {
            regs,
            ring,
            ring_pa,
            cursor: 0,
        }
    }

    /// Unmask receive/transmit completion, open the receive filters, and
    /// start both engines. Returns the hardware address.
    pub fn enable(&mut self) -> MacAddr {
        self.regs.write_u16(IMR, (Intr::ROK | Intr::TOK).bits());
        // Physical match, multicast, broadcast and everything else too.
        self.regs.write_u32(
            RCR,
            (RxConfig::AAP | RxConfig::APM | RxConfig::AM | RxConfig::AB | RxConfig::WRAP).bits(),
        );
        self.regs.write_u32(RX_MISSED, 0);
        self.regs.write_u8(CMD, (Command::RE | Command::TE).bits());

        let mut mac = 0u64;
        for i in 0..6u16 {
            mac |= (self.regs.read_u8(MAC0 + i) as u64) << ((5 - i) * 8);
        }
        MacAddr(mac)
    }

    /// Physical base of the receive ring.
    pub fn ring_pa(&self) -> Pa {
        self.ring_pa
    }

    /// The interrupt handler body.
    ///
    /// Acknowledges whatever the device signaled, then drains the ring if
    /// receive completion was among it, handing each good payload to
    /// `sink`. Runs with interrupts masked; must not block.
    pub fn service(&mut self, sink: &dyn FrameSink) {
        let status = Intr::from_bits_truncate(self.regs.read_u16(ISR));
        // Write-1-to-clear: acknowledge every signaled condition at once.
        self.regs.write_u16(ISR, status.bits());

        if !status.contains(Intr::ROK) {
            trace!("rtl8139: interrupt without receive completion");
            return;
        }

        let mut cursor = self.cursor;
        while !Command::from_bits_truncate(self.regs.read_u8(CMD)).contains(Command::BUFE) {
            let offset = (cursor % self.ring.capacity() as u64) as usize;
            let header = self.ring.read_u32(offset);
            let status = RxStatus::from_bits_truncate(header as u16);
            let length = (header >> 16) as usize;

            if status.is_faulty() {
                // Dropped, receiver left running. A reset might be the
                // better answer for a persistent error stream.
                trace!("rtl8139: frame error, status {:#06x}", status.bits());
            } else if length < 4 {
                // A frame shorter than its own CRC never comes from a sane
                // device.
                trace!("rtl8139: bogus length {}, status {:#06x}", length, status.bits());
            } else {
                // Payload starts past the header; the trailing CRC is not
                // forwarded.
                let payload_len = length - 4;
                let mut payload = vec![0u8; payload_len];
                self.ring.read_at(offset + 4, &mut payload);
                sink.deliver(&payload);
                trace!("rtl8139: frame delivered, {} bytes", payload_len);
            }

            // Skip header and frame body, keeping the cursor 4-byte
            // aligned, and let the device reuse the space.
            cursor = (cursor + length as u64 + 4 + 3) & !3;
            self.regs
                .write_u16(RX_BUF_PTR, cursor.wrapping_sub(RX_PTR_BIAS) as u16);
        }
        self.cursor = cursor;
    }
}

/// Bring up the device behind `dev` and wire its interrupt line.
///
/// Receive-ring memory is acquired from the collaborators, the handler is
/// bound to the IRQ line from configuration space, and the hardware
/// address is stored on `netif`. The ring block stays with the device for
/// the kernel's lifetime; nothing returns it.
pub fn probe(
    dev: &PciFunction,
    palloc: &impl PhysAllocator,
    valloc: &impl VirtAllocator,
    mapper: &impl PageMapper,
    netif: &mut Interface,
    sink: &'static dyn FrameSink,
) -> Result<Arc<UniLock<Rtl8139<IoWindow>>>, NetError> {
    // The device masters the bus to copy frames into the ring.
    dev.enable_bus_mastering();
    let window = IoWindow::new(dev.io_base());

    let block = palloc.allocate(RX_RING_BYTES).ok_or(NetError::NoMemory)?;
    let ring_va = match valloc.reserve(RX_RING_PAGES) {
        Some(va) => va,
        None => {
            palloc.release(block);
            return Err(NetError::NoMemory);
        }
    };
    if mapper
        .map(ring_va, block.pa(), RX_RING_PAGES, MapFlags::PRESENT | MapFlags::WRITE)
        .is_err()
    {
        warning!("rtl8139: unable to map {:?} at {:?}", block.pa(), ring_va);
        palloc.release(block);
        return Err(NetError::MapFailed);
    }

    let ring = unsafe { RxRing::new(ring_va.into_usize() as *mut u8, RX_RING_BYTES) };
    let nic = Arc::new(UniLock::new(Rtl8139::attach(window, ring, block.pa())));

    interrupt::register(dev.interrupt_line() as usize, {
        let nic = nic.clone();
        move || nic.lock().service(sink)
    });

    let mac = nic.lock().enable();
    trace!("rtl8139: mac address {}", mac);
    netif.mac = mac;
    Ok(nic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::sync::Mutex;

    // Register-accurate device stand-in. Unexpected accesses panic so the
    // protocol cannot drift silently.
    #[derive(Default)]
    struct FakeNic {
        cmd: Cell<u8>,
        reset_reads: Cell<u32>,
        imr: Cell<u16>,
        isr: Cell<u16>,
        isr_acks: RefCell<Vec<u16>>,
        rcr: Cell<u32>,
        config1: Cell<u8>,
        rx_buf: Cell<u32>,
        rx_buf_addr: Cell<u32>,
        missed: Cell<u32>,
        ptr_writes: RefCell<Vec<u16>>,
        // Frames the "hardware" has written and not yet seen consumed.
        pending: Cell<usize>,
        mac: [u8; 6],
    }

    impl FakeNic {
        fn with_mac(mac: [u8; 6]) -> Self {
            FakeNic {
                mac,
                ..Default::default()
            }
        }

        fn raise_rx(&self, frames: usize) {
            self.isr.set(self.isr.get() | Intr::ROK.bits());
            self.pending.set(self.pending.get() + frames);
        }
    }

    impl RegisterWindow for &FakeNic {
        fn read_u8(&self, offset: u16) -> u8 {
            match offset {
                0..=5 => self.mac[offset as usize],
                CMD => {
                    if self.reset_reads.get() > 0 {
                        self.reset_reads.set(self.reset_reads.get() - 1);
                        return Command::RST.bits();
                    }
                    let empty = if self.pending.get() == 0 {
                        Command::BUFE.bits()
                    } else {
                        0
                    };
                    self.cmd.get() | empty
                }
                CONFIG_1 => self.config1.get(),
                _ => panic!("unexpected byte read at {:#x}", offset),
            }
        }

        fn read_u16(&self, offset: u16) -> u16 {
            match offset {
                ISR => self.isr.get(),
                IMR => self.imr.get(),
                _ => panic!("unexpected word read at {:#x}", offset),
            }
        }

        fn read_u32(&self, offset: u16) -> u32 {
            match offset {
                RCR => self.rcr.get(),
                RX_BUF => self.rx_buf.get(),
                RX_MISSED => self.missed.get(),
                _ => panic!("unexpected dword read at {:#x}", offset),
            }
        }

        fn write_u8(&self, offset: u16, v: u8) {
            match offset {
                CMD => {
                    if v & Command::RST.bits() != 0 {
                        // Stay "in reset" for a couple of polls.
                        self.reset_reads.set(2);
                        self.cmd.set(0);
                    } else {
                        self.cmd.set(v);
                    }
                }
                CONFIG_1 => self.config1.set(v),
                _ => panic!("unexpected byte write at {:#x}", offset),
            }
        }

        fn write_u16(&self, offset: u16, v: u16) {
            match offset {
                IMR => self.imr.set(v),
                ISR => self.isr_acks.borrow_mut().push(v),
                RX_BUF_PTR => {
                    self.ptr_writes.borrow_mut().push(v);
                    if self.pending.get() > 0 {
                        self.pending.set(self.pending.get() - 1);
                    }
                }
                _ => panic!("unexpected word write at {:#x}", offset),
            }
        }

        fn write_u32(&self, offset: u16, v: u32) {
            match offset {
                RX_BUF => self.rx_buf.set(v),
                RX_BUF_PTR => (),
                RX_BUF_ADDR => self.rx_buf_addr.set(v),
                RCR => self.rcr.set(v),
                RX_MISSED => self.missed.set(v),
                _ => panic!("unexpected dword write at {:#x}", offset),
            }
        }
    }

    #[derive(Default)]
    struct Sink(Mutex<Vec<Vec<u8>>>);

    impl FrameSink for Sink {
        fn deliver(&self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    fn test_ring() -> RxRing {
        let mem = Vec::leak(vec![0xa5u8; RX_RING_BYTES]);
        unsafe { RxRing::new(mem.as_mut_ptr(), RX_RING_BYTES) }
    }

    fn attach(dev: &FakeNic) -> Rtl8139<&FakeNic> {
        Rtl8139::attach(dev, test_ring(), Pa::new(0x7f000).unwrap())
    }

    // Header + body (payload then CRC placeholder); `length` counts body
    // bytes only.
    fn frame(status: u16, length: u16, payload: &[u8]) -> Vec<u8> {
        let header = ((length as u32) << 16) | status as u32;
        let mut bytes = header.to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes.resize(4 + length as usize, 0xcc);
        bytes
    }

    #[test]
    fn attach_resets_and_programs_the_ring() {
        let dev = FakeNic::with_mac([0; 6]);
        let nic = attach(&dev);

        assert_eq!(dev.config1.get(), 0);
        assert_eq!(dev.reset_reads.get(), 0);
        assert_eq!(dev.rx_buf.get(), 0x7f000);
        assert_eq!(dev.rx_buf_addr.get(), 0);
        assert_eq!(nic.cursor, 0);
        assert_eq!(nic.ring.capacity(), 0x3000);
        let mut content = vec![0xffu8; RX_RING_BYTES];
        nic.ring.read_at(0, &mut content);
        assert!(content.iter().all(|b| *b == 0));
    }

    #[test]
    fn enable_programs_filters_and_reads_mac() {
        let dev = FakeNic::with_mac([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let mut nic = attach(&dev);
        let mac = nic.enable();

        assert_eq!(dev.imr.get(), 0x0005);
        assert_eq!(dev.rcr.get(), 0x8f);
        assert_eq!(dev.missed.get(), 0);
        assert_eq!(dev.cmd.get(), 0x0c);
        assert_eq!(mac, MacAddr(0x52_54_00_12_34_56));
    }

    #[test]
    fn valid_frame_is_delivered_and_cursor_advances() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        let payload: Vec<u8> = (0u8..60).collect();
        nic.ring.write_at(0, &frame(RxStatus::OK.bits(), 64, &payload));
        dev.raise_rx(1);

        let sink = Sink::default();
        nic.service(&sink);

        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 60);
        assert_eq!(delivered[0], payload);
        assert_eq!(nic.cursor, 68);
        assert_eq!(*dev.ptr_writes.borrow().last().unwrap(), 52);
        assert_eq!(dev.isr_acks.borrow().as_slice(), &[Intr::ROK.bits()]);
    }

    #[test]
    fn faulty_frame_is_dropped_but_skipped() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        nic.ring
            .write_at(0, &frame(RxStatus::CRC_ERR.bits(), 100, &[0xde; 96]));
        dev.raise_rx(1);

        let sink = Sink::default();
        nic.service(&sink);

        assert!(sink.0.lock().unwrap().is_empty());
        // Same advance formula as a good frame: (100 + 4 + 3) & !3.
        assert_eq!(nic.cursor, 104);
        assert_eq!(*dev.ptr_writes.borrow().last().unwrap(), 88);
    }

    #[test]
    fn zero_length_frame_is_dropped() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        nic.ring.write_at(0, &frame(RxStatus::OK.bits(), 0, &[]));
        dev.raise_rx(1);

        let sink = Sink::default();
        nic.service(&sink);

        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(nic.cursor, 4);
    }

    #[test]
    fn cursor_stays_aligned_across_odd_lengths() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        for length in [17u16, 33, 5, 64, 121] {
            let offset = (nic.cursor % RX_RING_BYTES as u64) as usize;
            nic.ring
                .write_at(offset, &frame(RxStatus::OK.bits(), length, &[0xab; 4]));
            dev.raise_rx(1);
            nic.service(&Sink::default());
            assert_eq!(nic.cursor % 4, 0);
        }
    }

    #[test]
    fn frame_at_the_ring_edge_wraps() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        // Park the cursor eight bytes short of the edge; payload spills
        // over into the front of the buffer.
        nic.cursor = 0x2ff8;
        let payload: Vec<u8> = (100u8..120).collect();
        nic.ring
            .write_at(0x2ff8, &frame(RxStatus::OK.bits(), 24, &payload));
        dev.raise_rx(1);

        let sink = Sink::default();
        nic.service(&sink);

        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered[0], payload);
        assert_eq!(nic.cursor, 0x3014);
        assert_eq!(*dev.ptr_writes.borrow().last().unwrap(), 0x3004);
    }

    #[test]
    fn drains_multiple_frames_in_one_interrupt() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        nic.ring.write_at(0, &frame(RxStatus::OK.bits(), 14, &[1; 10]));
        // First frame occupies (14 + 4 + 3) & !3 = 20 bytes.
        nic.ring.write_at(20, &frame(RxStatus::OK.bits(), 24, &[2; 20]));
        dev.raise_rx(2);

        let sink = Sink::default();
        nic.service(&sink);

        let delivered = sink.0.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0], vec![1; 10]);
        assert_eq!(delivered[1], vec![2; 20]);
        assert_eq!(nic.cursor, 48);
    }

    #[test]
    fn transmit_only_interrupt_is_acknowledged_and_ignored() {
        let dev = FakeNic::with_mac([0; 6]);
        let mut nic = attach(&dev);
        nic.enable();

        dev.isr.set(Intr::TOK.bits());
        nic.service(&Sink::default());

        assert_eq!(dev.isr_acks.borrow().as_slice(), &[Intr::TOK.bits()]);
        assert_eq!(nic.cursor, 0);
        assert!(dev.ptr_writes.borrow().is_empty());
    }
}
