//! Last-resort halt.

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("\n========== KERNEL PANIC!!! ==========\n{}", info);
    loop {
        core::hint::spin_loop();
    }
}
