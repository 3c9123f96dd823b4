use std::fmt;

use log::Level;

/// Write a diagnostic that must not get lost: through the logger at `error`
/// level if one is listening, straight to stderr otherwise.
pub fn diagnostic(message: fmt::Arguments<'_>) {
    if log::log_enabled!(Level::Error) {
        log::error!("{message}");
    } else {
        eprintln!("heapledger: {message}");
    }
}

/// Basically just `format!()` into [`diagnostic()`].
#[macro_export]
macro_rules! diagnostic {
    ($($arg:tt)*) => {
        $crate::util::print::diagnostic(format_args!($($arg)*))
    };
}
