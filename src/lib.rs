//! A library and application for programming UPDI-based AVR devices over
//! Serial
//!
//! ## As an application
//!
//! [updiflash] drives a plain serial adapter wired in the serialUPDI
//! fashion: a series resistor between TX and the target's UPDI pin, with
//! TX tied to RX for the half-duplex echo.
//!
//! ```bash
//! $ updiflash ping -d atmega4809 -p /dev/ttyUSB0
//! $ updiflash write -d atmega4809 -f firmware.hex --erase --verify
//! ```
//!
//! ## As a library
//!
//! ```toml
//! updiflash = { version = "0.3", default-features = false }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. The cli module does not provide SemVer guarantees
//! and pulls in dependencies a library consumer will not want.
//!
//! [updiflash]: https://crates.io/crates/updiflash

#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod interface;
pub mod progress;
pub mod targets;

pub use self::error::Error;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
