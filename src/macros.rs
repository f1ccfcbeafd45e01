#![allow(unused_macros)]

macro_rules! _trace(
  ($inner:expr, $($arg:tt)*) => {
    log::trace!("{}: {}", $inner.addr, format!($($arg)*))
  }
);

macro_rules! _debug(
  ($inner:expr, $($arg:tt)*) => {
    log::debug!("{}: {}", $inner.addr, format!($($arg)*))
  }
);

macro_rules! _warn(
  ($inner:expr, $($arg:tt)*) => {
    log::warn!("{}: {}", $inner.addr, format!($($arg)*))
  }
);

macro_rules! _error(
  ($inner:expr, $($arg:tt)*) => {
    log::error!("{}: {}", $inner.addr, format!($($arg)*))
  }
);

macro_rules! _info(
  ($inner:expr, $($arg:tt)*) => {
    log::info!("{}: {}", $inner.addr, format!($($arg)*))
  }
);
