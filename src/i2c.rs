/*!
# Blocking I2C master based on GPIO bitbang

This implementation consumes the following hardware resources:
- A tick counter ([`Timebase`]) to measure half bit periods
- Two GPIO pins for SDA and SCL lines.

Every bus transition is followed by one half-period wait, so a full SCL
cycle lasts two waits. The waits busy-poll the counter; by default they
never give up (see [`Config::with_stall_limit`]).

Clock stretching and multi-master arbitration are not supported.

## Hardware requirements

1. Configure GPIO pins as Open-Drain outputs with external pull-ups. The
   SDA pin must read back the bus level.
2. Start the tick counter at the rate given by [`Config::with_tick_rate`]
   (1 MHz by default).

## Example

```no_run
  use soft_i2c::i2c::{self, Config};
  # fn demo<SCL, SDA, T, E>(scl: &mut SCL, sda: &mut SDA, timer: &mut T) -> Result<(), i2c::Error<E>>
  # where
  #     SCL: embedded_hal::digital::OutputPin<Error = E>,
  #     SDA: embedded_hal::digital::OutputPin<Error = E> + embedded_hal::digital::InputPin<Error = E>,
  #     T: soft_i2c::Timebase,
  # {
  let config = Config::default();

  // point the EEPROM at address 0x0010, then read 4 bytes back
  i2c::write(0x50, &[0x00, 0x10], scl, sda, timer, &config)?;

  let mut data = [0u8; 4];
  i2c::read(0x50, &mut data, scl, sda, timer, &config)?;
  # Ok(())
  # }
```
*/

use core::fmt;

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation, SevenBitAddress};
use fugit::{HertzU32, RateExtU32};

use crate::timebase::Timebase;

/// Highest address representable in 7 bits
pub const MAX_ADDRESS: SevenBitAddress = 0x7F;

/// I2C error
#[derive(Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// GPIO error
    Bus(E),
    /// No ack received
    NoAck(NoAcknowledgeSource),
    /// Address does not fit in 7 bits
    InvalidAddress(u8),
    /// Timebase stopped advancing
    ClockStalled,
    /// Unusable bus timing
    InvalidConfig,
}

impl<E: fmt::Debug> embedded_hal::i2c::Error for Error<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Bus(_) => ErrorKind::Bus,
            Error::NoAck(source) => ErrorKind::NoAcknowledge(*source),
            Error::InvalidAddress(_) | Error::ClockStalled | Error::InvalidConfig => {
                ErrorKind::Other
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "GPIO error: {:?}", e),
            Error::NoAck(source) => write!(f, "no acknowledge: {:?}", source),
            Error::InvalidAddress(address) => {
                write!(f, "address {:#04x} does not fit in 7 bits", address)
            }
            Error::ClockStalled => f.write_str("timebase stalled"),
            Error::InvalidConfig => f.write_str("invalid bus timing"),
        }
    }
}

/// Transfer direction, carried in the R/W bit of the address byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Master sends data
    Write = 0,
    /// Master receives data
    Read = 1,
}

/// Pack a 7-bit address and the R/W bit into the first byte of a frame.
///
/// Returns `None` when `address` does not fit in 7 bits.
pub fn address_byte(address: SevenBitAddress, direction: Direction) -> Option<u8> {
    if address > MAX_ADDRESS {
        return None;
    }
    Some((address << 1) | direction as u8)
}

/// Bus timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// SCL frequency
    pub frequency: HertzU32,
    /// Counting rate of the [`Timebase`]
    pub tick_rate: HertzU32,
    /// Maximum counter polls per half-period wait, `None` to wait forever
    pub stall_limit: Option<u32>,
}

impl Default for Config {
    /// 100 kHz bus on a 1 MHz counter, unbounded waits
    fn default() -> Self {
        Config {
            frequency: 100.kHz(),
            tick_rate: 1.MHz(),
            stall_limit: None,
        }
    }
}

impl Config {
    /// Set the SCL frequency
    pub fn with_frequency(mut self, frequency: HertzU32) -> Self {
        self.frequency = frequency;
        self
    }

    /// Set the counting rate of the timebase
    pub fn with_tick_rate(mut self, tick_rate: HertzU32) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    /// Give up a half-period wait after `polls` reads of the counter.
    ///
    /// The limit has to exceed [`half_period_ticks`](Self::half_period_ticks)
    /// or no wait could ever complete.
    pub fn with_stall_limit(mut self, polls: u32) -> Self {
        self.stall_limit = Some(polls);
        self
    }

    /// Counter ticks making up half an SCL period.
    ///
    /// Rounded up, so the bus never runs faster than `frequency`. `None` if
    /// the frequency or the tick rate is zero, or the stall limit is too
    /// tight to ever finish a wait.
    pub fn half_period_ticks(&self) -> Option<u32> {
        let scl_hz = self.frequency.to_Hz();
        if scl_hz == 0 {
            return None;
        }

        let ticks = self.tick_rate.to_Hz().div_ceil(scl_hz.saturating_mul(2));
        if ticks == 0 {
            return None;
        }

        match self.stall_limit {
            Some(limit) if limit <= ticks => None,
            _ => Some(ticks),
        }
    }
}

/// The two bus lines and the timebase, borrowed for one transaction.
struct Bus<'a, SCL, SDA, T> {
    scl: &'a mut SCL,
    sda: &'a mut SDA,
    timebase: &'a mut T,
    half_period_ticks: u32,
    stall_limit: Option<u32>,
}

impl<'a, SCL, SDA, T, E> Bus<'a, SCL, SDA, T>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    fn new(
        scl: &'a mut SCL,
        sda: &'a mut SDA,
        timebase: &'a mut T,
        config: &Config,
    ) -> Result<Self, Error<E>> {
        let Some(half_period_ticks) = config.half_period_ticks() else {
            return Err(Error::InvalidConfig);
        };

        Ok(Bus {
            scl,
            sda,
            timebase,
            half_period_ticks,
            stall_limit: config.stall_limit,
        })
    }

    /// Run `body` and emit a stop afterwards, whatever `body` returned.
    ///
    /// The first error wins; a failing stop is only reported when the
    /// transaction itself went through.
    fn framed<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<R, Error<E>>,
    ) -> Result<R, Error<E>> {
        let result = body(self);
        let stop = self.raw_i2c_stop();

        match &result {
            Ok(_) => debug!("i2c transaction done"),
            Err(Error::NoAck(source)) => debug!("i2c transaction aborted: {:?}", source),
            Err(_) => warn!("i2c transaction aborted on bus fault"),
        }

        let value = result?;
        stop?;
        Ok(value)
    }

    fn raw_i2c_start(&mut self) -> Result<(), Error<E>> {
        self.set_sda_high()?;
        self.set_scl_high()?;
        self.wait_for_clk()?;

        self.set_sda_low()?;
        self.wait_for_clk()?;

        self.set_scl_low()?;
        self.wait_for_clk()
    }

    fn raw_i2c_stop(&mut self) -> Result<(), Error<E>> {
        self.set_scl_low()?;
        self.set_sda_low()?;
        self.wait_for_clk()?;

        self.set_scl_high()?;
        self.wait_for_clk()?;

        self.set_sda_high()?;
        self.wait_for_clk()
    }

    /// (Repeated) start followed by the address byte and its acknowledge.
    fn address_phase(&mut self, byte: u8) -> Result<(), Error<E>> {
        self.raw_i2c_start()?;
        trace!("i2c address byte {:#04x}", byte);
        self.i2c_write_byte(byte)?;
        self.check_ack(NoAcknowledgeSource::Address)
    }

    fn i2c_write_byte(&mut self, byte: u8) -> Result<(), Error<E>> {
        for bit_offset in 0..8 {
            if (byte >> (7 - bit_offset)) & 0b1 == 1 {
                self.set_sda_high()?;
            } else {
                self.set_sda_low()?;
            }

            self.set_scl_high()?;
            self.wait_for_clk()?;

            self.set_scl_low()?;
            self.wait_for_clk()?;
        }

        Ok(())
    }

    fn i2c_read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut byte: u8 = 0;

        // let the slave drive SDA
        self.set_sda_high()?;

        for bit_offset in 0..8 {
            self.set_scl_high()?;
            self.wait_for_clk()?;

            if self.sda.is_high().map_err(Error::Bus)? {
                byte |= 1 << (7 - bit_offset);
            }

            self.set_scl_low()?;
            self.wait_for_clk()?;
        }

        Ok(byte)
    }

    fn i2c_is_ack(&mut self) -> Result<bool, Error<E>> {
        self.set_sda_high()?;
        self.set_scl_high()?;
        self.wait_for_clk()?;

        let ack = self.sda.is_low().map_err(Error::Bus)?;

        self.set_scl_low()?;
        self.wait_for_clk()?;

        Ok(ack)
    }

    #[inline]
    fn check_ack(&mut self, source: NoAcknowledgeSource) -> Result<(), Error<E>> {
        if self.i2c_is_ack()? {
            Ok(())
        } else {
            Err(Error::NoAck(source))
        }
    }

    fn send_ack(&mut self) -> Result<(), Error<E>> {
        self.set_sda_low()?;
        self.set_scl_high()?;
        self.wait_for_clk()?;

        self.set_scl_low()?;
        self.set_sda_high()?;
        self.wait_for_clk()
    }

    fn send_nack(&mut self) -> Result<(), Error<E>> {
        self.set_sda_high()?;
        self.set_scl_high()?;
        self.wait_for_clk()?;

        self.set_scl_low()?;
        self.wait_for_clk()
    }

    /// Send bytes, stopping at the first one the slave does not acknowledge.
    fn write_to_slave(&mut self, output: &[u8]) -> Result<(), Error<E>> {
        for byte in output {
            trace!("i2c write {:#04x}", byte);
            self.i2c_write_byte(*byte)?;
            self.check_ack(NoAcknowledgeSource::Data)?;
        }
        Ok(())
    }

    /// Fill `input`, acknowledging every byte except the last one when
    /// `nack_last` is set.
    fn read_from_slave(&mut self, input: &mut [u8], nack_last: bool) -> Result<(), Error<E>> {
        let last = input.len().saturating_sub(1);
        for (i, slot) in input.iter_mut().enumerate() {
            *slot = self.i2c_read_byte()?;
            trace!("i2c read {:#04x}", *slot);

            if nack_last && i == last {
                self.send_nack()?;
            } else {
                self.send_ack()?;
            }
        }
        Ok(())
    }

    #[inline]
    fn set_scl_high(&mut self) -> Result<(), Error<E>> {
        self.scl.set_high().map_err(Error::Bus)
    }

    #[inline]
    fn set_scl_low(&mut self) -> Result<(), Error<E>> {
        self.scl.set_low().map_err(Error::Bus)
    }

    #[inline]
    fn set_sda_high(&mut self) -> Result<(), Error<E>> {
        self.sda.set_high().map_err(Error::Bus)
    }

    #[inline]
    fn set_sda_low(&mut self) -> Result<(), Error<E>> {
        self.sda.set_low().map_err(Error::Bus)
    }

    fn wait_for_clk(&mut self) -> Result<(), Error<E>> {
        self.timebase.reset();

        let mut polls: u32 = 0;
        while self.timebase.elapsed_ticks() < self.half_period_ticks {
            if let Some(limit) = self.stall_limit {
                polls += 1;
                if polls >= limit {
                    warn!("i2c timebase stalled after {} polls", polls);
                    return Err(Error::ClockStalled);
                }
            }
            core::hint::spin_loop();
        }

        Ok(())
    }
}

/// Write `data` to the device at `address`.
///
/// Fails with [`Error::NoAck`] as soon as the address or a data byte is not
/// acknowledged; the bytes before it have already been taken by the device.
/// An empty `data` only checks that the device answers its address.
pub fn write<SCL, SDA, T, E>(
    address: SevenBitAddress,
    data: &[u8],
    scl: &mut SCL,
    sda: &mut SDA,
    timebase: &mut T,
    config: &Config,
) -> Result<(), Error<E>>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    let Some(header) = address_byte(address, Direction::Write) else {
        return Err(Error::InvalidAddress(address));
    };
    let mut bus = Bus::new(scl, sda, timebase, config)?;

    bus.framed(|bus| {
        // ST, SAD + W
        bus.address_phase(header)?;
        bus.write_to_slave(data)
    })
}

/// Read `buffer.len()` bytes from the device at `address`.
///
/// Only the address phase can fail with [`Error::NoAck`]. Every byte but the
/// last is acknowledged, the last one is answered with a NACK. An empty
/// buffer still runs the address phase and the stop, so it reports whether
/// the device answered; a device that already started driving its first
/// byte may then hold SDA low through the stop.
pub fn read<SCL, SDA, T, E>(
    address: SevenBitAddress,
    buffer: &mut [u8],
    scl: &mut SCL,
    sda: &mut SDA,
    timebase: &mut T,
    config: &Config,
) -> Result<(), Error<E>>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    let Some(header) = address_byte(address, Direction::Read) else {
        return Err(Error::InvalidAddress(address));
    };
    let mut bus = Bus::new(scl, sda, timebase, config)?;

    bus.framed(|bus| {
        // ST, SAD + R
        bus.address_phase(header)?;
        bus.read_from_slave(buffer, true)
    })
}

/// Write `bytes`, then read into `buffer` after a repeated start, under a
/// single stop.
///
/// The read phase always addresses the device, even for an empty `buffer`,
/// exactly like a `[Write, Read]` transaction.
pub fn write_read<SCL, SDA, T, E>(
    address: SevenBitAddress,
    bytes: &[u8],
    buffer: &mut [u8],
    scl: &mut SCL,
    sda: &mut SDA,
    timebase: &mut T,
    config: &Config,
) -> Result<(), Error<E>>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    let (Some(write_header), Some(read_header)) = (
        address_byte(address, Direction::Write),
        address_byte(address, Direction::Read),
    ) else {
        return Err(Error::InvalidAddress(address));
    };
    let mut bus = Bus::new(scl, sda, timebase, config)?;

    bus.framed(|bus| {
        bus.address_phase(write_header)?;
        bus.write_to_slave(bytes)?;

        // SR, SAD + R
        bus.address_phase(read_header)?;
        bus.read_from_slave(buffer, true)
    })
}

/// Check whether a device answers at `address`.
///
/// Returns `Ok(false)` when the address is not acknowledged; other failures
/// are passed through.
pub fn probe<SCL, SDA, T, E>(
    address: SevenBitAddress,
    scl: &mut SCL,
    sda: &mut SDA,
    timebase: &mut T,
    config: &Config,
) -> Result<bool, Error<E>>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    match write(address, &[], scl, sda, timebase, config) {
        Ok(()) => Ok(true),
        Err(Error::NoAck(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bit banging I2C device
///
/// Owns its lines and timebase, and implements [`embedded_hal::i2c::I2c`]
/// on top of the same protocol engine as the free functions.
pub struct I2cBB<SCL, SDA, T>
where
    SCL: OutputPin,
    SDA: OutputPin + InputPin,
    T: Timebase,
{
    scl: SCL,
    sda: SDA,
    timebase: T,
    config: Config,
}

impl<SCL, SDA, T, E> I2cBB<SCL, SDA, T>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
{
    /// Create instance
    pub fn new(scl: SCL, sda: SDA, timebase: T, config: Config) -> Self {
        I2cBB {
            scl,
            sda,
            timebase,
            config,
        }
    }

    /// Bus timing in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check whether a device answers at `address`.
    pub fn probe(&mut self, address: SevenBitAddress) -> Result<bool, Error<E>> {
        probe(
            address,
            &mut self.scl,
            &mut self.sda,
            &mut self.timebase,
            &self.config,
        )
    }

    /// Release the lines and the timebase
    pub fn free(self) -> (SCL, SDA, T) {
        (self.scl, self.sda, self.timebase)
    }
}

impl<SCL, SDA, T, E> ErrorType for I2cBB<SCL, SDA, T>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
    E: fmt::Debug,
{
    type Error = Error<E>;
}

impl<SCL, SDA, T, E> I2c for I2cBB<SCL, SDA, T>
where
    SCL: OutputPin<Error = E>,
    SDA: OutputPin<Error = E> + InputPin<Error = E>,
    T: Timebase,
    E: fmt::Debug,
{
    fn read(&mut self, address: SevenBitAddress, buffer: &mut [u8]) -> Result<(), Self::Error> {
        read(
            address,
            buffer,
            &mut self.scl,
            &mut self.sda,
            &mut self.timebase,
            &self.config,
        )
    }

    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<(), Self::Error> {
        write(
            address,
            bytes,
            &mut self.scl,
            &mut self.sda,
            &mut self.timebase,
            &self.config,
        )
    }

    fn write_read(
        &mut self,
        address: SevenBitAddress,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), Self::Error> {
        write_read(
            address,
            bytes,
            buffer,
            &mut self.scl,
            &mut self.sda,
            &mut self.timebase,
            &self.config,
        )
    }

    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let (Some(write_header), Some(read_header)) = (
            address_byte(address, Direction::Write),
            address_byte(address, Direction::Read),
        ) else {
            return Err(Error::InvalidAddress(address));
        };
        if operations.is_empty() {
            return Ok(());
        }
        let mut bus = Bus::new(
            &mut self.scl,
            &mut self.sda,
            &mut self.timebase,
            &self.config,
        )?;

        bus.framed(|bus| {
            let mut previous: Option<Direction> = None;
            for i in 0..operations.len() {
                // a read running on into more read data must not NACK its last byte
                let continues = operations[i + 1..]
                    .iter()
                    .take_while(|op| matches!(op, Operation::Read(_)))
                    .any(|op| matches!(op, Operation::Read(buffer) if !buffer.is_empty()));

                match &mut operations[i] {
                    Operation::Write(bytes) => {
                        if previous != Some(Direction::Write) {
                            // ST or SR, SAD + W
                            bus.address_phase(write_header)?;
                        }
                        bus.write_to_slave(bytes)?;
                        previous = Some(Direction::Write);
                    }
                    Operation::Read(buffer) => {
                        if previous != Some(Direction::Read) {
                            // ST or SR, SAD + R
                            bus.address_phase(read_header)?;
                        }
                        bus.read_from_slave(buffer, !continues)?;
                        previous = Some(Direction::Read);
                    }
                }
            }
            Ok(())
        })
    }
}
