//! Logging shim dispatching to `log`, or to `defmt` when the `defmt` feature
//! is enabled.

#![allow(unused_macros)]
#![allow(unused_imports)]

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::log::trace!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::trace!($s $(, $x)*);
        }
    };
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::log::debug!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::debug!($s $(, $x)*);
        }
    };
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::log::info!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::info!($s $(, $x)*);
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::log::warn!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::warn!($s $(, $x)*);
        }
    };
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::log::error!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::error!($s $(, $x)*);
        }
    };
}

/// `.unwrap()` for infallible conversions that still return `Result`.
macro_rules! unwrap {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(_) => {
                panic!("unwrap failed: {}", stringify!($expr));
            }
        }
    };
}

/// `.unwrap()` for `Option`s that are guaranteed `Some` by construction.
macro_rules! unwrap_opt {
    ($expr:expr) => {
        match $expr {
            Some(value) => value,
            None => {
                panic!("unwrap failed: {}", stringify!($expr));
            }
        }
    };
    ($expr:expr, $msg:literal) => {
        match $expr {
            Some(value) => value,
            None => {
                panic!($msg);
            }
        }
    };
}

pub(crate) use {debug, error, info, trace, unwrap, unwrap_opt};
pub(crate) use crate::warn;
