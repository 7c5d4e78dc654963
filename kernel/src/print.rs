// Print macros for kernel output

/// Prints to the standard output device.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::dev::stdout::_print(format_args!($($arg)*)));
}

/// Prints to the standard output device, with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}
