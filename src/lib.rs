//! Host-side driver for the kitsrus K128/K149/K150 family of serial PIC
//! programmers.
//!
//! Given a chip model from the chip database, an Intel-HEX firmware image
//! and a serial port, this crate negotiates with the programmer's on-board
//! controller to erase, write and verify the target chip's ROM, EEPROM,
//! user ID, fuses and calibration data.
//!
//! The pieces compose bottom-up: [`chipinfo`] knows the per-chip
//! parameters and the fuse codec, [`hexfile`] parses firmware images,
//! [`image`] lays the two out as wire-ready buffers, and
//! [`connection`]/[`programming`] drive the byte protocol over a
//! [`transport::Link`].

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod chipinfo;
pub mod connection;
mod error;
pub mod hexfile;
pub mod image;
pub mod programming;
pub mod transport;
mod utils;

pub use crate::error::Error;
pub use crate::utils::{indexwise_and, swab_bytes};

/// The result type used throughout this library.
pub type Result<T> = std::result::Result<T, Error>;
