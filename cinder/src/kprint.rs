//! Kernel print utilities.

#[cfg(target_os = "none")]
static SERIAL: uni_lock::UniLock<crate::dev::serial::Serial> =
    uni_lock::UniLock::new(crate::dev::serial::Serial::new());

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    // Console output only exists on the bare-metal target; hosted builds
    // drop it.
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        let _ = write!(&mut *SERIAL.lock(), "{}", fmt);
    }
    #[cfg(not(target_os = "none"))]
    let _ = fmt;
}

/// Prints out the message.
///
/// Use the format! syntax. This first holds the lock for the console
/// device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Per-event diagnostics, compiled in only for debug builds.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_print(
                format_args!(
                    "[TRACE] {}\n",
                    format_args!($($arg)*)
                )
            )
        }
    };
}
