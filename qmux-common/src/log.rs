// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::{
    io::Write as _,
    sync::{Once, OnceLock},
    time::Instant,
};

use env_logger::Builder;

static INIT_ONCE: Once = Once::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the logger once per process. Respects `RUST_LOG`.
pub fn init() {
    INIT_ONCE.call_once(|| {
        let mut builder = Builder::from_env("RUST_LOG");
        builder.format(|buf, record| {
            let elapsed = START_TIME.get_or_init(Instant::now).elapsed();
            writeln!(
                buf,
                "{}s{:3}ms {} {}",
                elapsed.as_secs(),
                elapsed.as_millis() % 1000,
                record.level(),
                record.args()
            )
        });
        if let Err(e) = builder.try_init() {
            crate::do_log!(::log::Level::Warn, "Logging initialization error {:?}", e);
        } else {
            crate::do_log!(::log::Level::Debug, "Logging initialized");
        }
    });
}

#[macro_export]
macro_rules! do_log {
    ($lvl:expr, $($arg:tt)*) => (::log::log!($lvl, $($arg)*));
}

#[macro_export]
macro_rules! qerror {
    ([$ctx:expr], $($arg:tt)*) => ($crate::do_log!(::log::Level::Error, "[{}] {}", $ctx, ::std::format_args!($($arg)*)));
    ($($arg:tt)*) => ($crate::do_log!(::log::Level::Error, $($arg)*));
}

#[macro_export]
macro_rules! qwarn {
    ([$ctx:expr], $($arg:tt)*) => ($crate::do_log!(::log::Level::Warn, "[{}] {}", $ctx, ::std::format_args!($($arg)*)));
    ($($arg:tt)*) => ($crate::do_log!(::log::Level::Warn, $($arg)*));
}

#[macro_export]
macro_rules! qinfo {
    ([$ctx:expr], $($arg:tt)*) => ($crate::do_log!(::log::Level::Info, "[{}] {}", $ctx, ::std::format_args!($($arg)*)));
    ($($arg:tt)*) => ($crate::do_log!(::log::Level::Info, $($arg)*));
}

#[macro_export]
macro_rules! qdebug {
    ([$ctx:expr], $($arg:tt)*) => ($crate::do_log!(::log::Level::Debug, "[{}] {}", $ctx, ::std::format_args!($($arg)*)));
    ($($arg:tt)*) => ($crate::do_log!(::log::Level::Debug, $($arg)*));
}

#[macro_export]
macro_rules! qtrace {
    ([$ctx:expr], $($arg:tt)*) => ($crate::do_log!(::log::Level::Trace, "[{}] {}", $ctx, ::std::format_args!($($arg)*)));
    ($($arg:tt)*) => ($crate::do_log!(::log::Level::Trace, $($arg)*));
}
