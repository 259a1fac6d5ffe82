#![macro_use]
#![allow(unused_macros)]

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("the `defmt-log` and `log` features are mutually exclusive");

// Arguments are only required to be core::fmt::Debug; the defmt branch
// adapts them through Debug2Format.
macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "log")]
        ::log::debug!($s $(, $x)*);
        #[cfg(feature = "defmt-log")]
        ::defmt::debug!($s $(, ::defmt::Debug2Format(&$x))*);
        #[cfg(not(any(feature = "log", feature = "defmt-log")))]
        {
            let _ = ($( & $x ),*);
        }
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "log")]
        ::log::warn!($s $(, $x)*);
        #[cfg(feature = "defmt-log")]
        ::defmt::warn!($s $(, ::defmt::Debug2Format(&$x))*);
        #[cfg(not(any(feature = "log", feature = "defmt-log")))]
        {
            let _ = ($( & $x ),*);
        }
    }};
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "log")]
        ::log::error!($s $(, $x)*);
        #[cfg(feature = "defmt-log")]
        ::defmt::error!($s $(, ::defmt::Debug2Format(&$x))*);
        #[cfg(not(any(feature = "log", feature = "defmt-log")))]
        {
            let _ = ($( & $x ),*);
        }
    }};
}
