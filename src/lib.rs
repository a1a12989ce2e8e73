//! This is a [bit banging] I2C master built on the [`embedded-hal`] traits.
//!
//! The bus is driven entirely through two open-drain GPIO lines, paced by a
//! free-running tick counter. Every operation is blocking and runs a whole
//! transaction, from start to stop, before it returns.
//!
//! The free functions in [`i2c`] borrow the pins and the timebase for the
//! duration of one call, so a single counter can pace several independent
//! buses. [`i2c::I2cBB`] owns its resources instead and implements
//! [`embedded_hal::i2c::I2c`] for use with device drivers.
//!
//! [bit banging]: https://en.wikipedia.org/wiki/Bit_banging
//! [`embedded-hal`]: https://github.com/rust-embedded/embedded-hal

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[macro_use]
mod fmt;

pub mod i2c;
pub mod timebase;

pub use i2c::{Config, Direction, Error, I2cBB};
pub use timebase::{DelayTimebase, Timebase};
