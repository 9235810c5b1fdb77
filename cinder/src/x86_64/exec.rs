//! Privilege transfer and in-place execution.
//!
//! The loader hands control to a prepared image in one of two ways: by
//! constructing a synthetic interrupt-return frame that drops the CPU to
//! user privilege (a jump with no way back), or by calling the entry point
//! as an ordinary kernel procedure. Both live behind [`Transfer`] so the
//! loader itself never touches the hardware directly.

use crate::addressing::Va;
use core::arch::asm;
use core::ptr::addr_of_mut;

/// User code segment selector, matching the boot-time GDT layout.
pub const USER_CODE_SELECTOR: u16 = 0x18;
/// User data segment selector, matching the boot-time GDT layout.
pub const USER_DATA_SELECTOR: u16 = 0x20;
/// Requested privilege level for user selectors.
const RPL_USER: u16 = 3;

/// 64bit task state segment.
///
/// See Intel 64 and IA-32 Architectures Software Developer's Manual,
/// Volume 3A Figure 7-11.
#[repr(C, packed)]
pub struct TaskStateSegment {
    _res0: u32,
    /// Stack pointer loaded on a ring-0 entry.
    pub rsp0: usize,
    /// Stack pointer loaded on a ring-1 entry.
    pub rsp1: usize,
    /// Stack pointer loaded on a ring-2 entry.
    pub rsp2: usize,
    _res1: u64,
    /// Interrupt stack table slots.
    pub ist: [u64; 7],
    _res2: u64,
    _res3: u16,
    /// Offset of the io permission bitmap.
    pub io_map_base: u16,
}

impl TaskStateSegment {
    /// Create an empty TaskStateSegment.
    pub const fn empty() -> Self {
        Self {
            _res0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _res1: 0,
            ist: [0; 7],
            _res2: 0,
            _res3: 0,
            io_map_base: 0,
        }
    }
}

// Installed into the GDT by the boot code; only rsp0 is touched afterwards.
static mut TSS: TaskStateSegment = TaskStateSegment::empty();

/// Pointer to the kernel's task state segment, for the GDT installer.
pub fn tss() -> *mut TaskStateSegment {
    addr_of_mut!(TSS)
}

/// Control transfer into a loaded image.
pub trait Transfer {
    /// Record the current kernel stack as the ring-0 entry stack, so that
    /// interrupts taken in user mode land somewhere valid.
    fn set_kernel_stack(&self);

    /// Drop to user privilege at `entry` with `user_stack`. Never returns.
    fn enter_user(&self, entry: Va, user_stack: Va) -> !;

    /// Call `entry` as an ordinary kernel procedure and return its status.
    ///
    /// # Safety
    /// `entry` must point to callable code mapped in the current address
    /// space that follows the C ABI and eventually returns.
    unsafe fn call(&self, entry: Va) -> i64;
}

/// The real hardware transfer: `iretq` with user selectors.
pub struct Iretq;

impl Transfer for Iretq {
    fn set_kernel_stack(&self) {
        let rsp: usize;
        unsafe {
            asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack));
            (*addr_of_mut!(TSS)).rsp0 = rsp;
        }
    }

    fn enter_user(&self, entry: Va, user_stack: Va) -> ! {
        let data = (USER_DATA_SELECTOR | RPL_USER) as u64;
        let code = (USER_CODE_SELECTOR | RPL_USER) as u64;
        unsafe {
            // Load user data selectors, then build the interrupt-return
            // frame: ss, rsp, rflags, cs, rip.
            asm!(
                "mov ds, {data:x}",
                "mov es, {data:x}",
                "mov fs, {data:x}",
                "mov gs, {data:x}",
                "push {data}",
                "push {rsp}",
                "pushfq",
                "push {code}",
                "push {rip}",
                "iretq",
                data = in(reg) data,
                code = in(reg) code,
                rsp = in(reg) user_stack.into_usize() as u64,
                rip = in(reg) entry.into_usize() as u64,
                options(noreturn),
            )
        }
    }

    unsafe fn call(&self, entry: Va) -> i64 {
        let main: extern "C" fn() -> i64 = core::mem::transmute(entry.into_usize());
        main()
    }
}

#[cfg(test)]
mod tests {
    use super::{Iretq, Transfer};
    use core::ptr::addr_of;

    #[test]
    fn kernel_stack_recorded() {
        Iretq.set_kernel_stack();
        let rsp0 = unsafe { addr_of!((*super::tss()).rsp0).read_unaligned() };
        assert_ne!(rsp0, 0);
    }
}
