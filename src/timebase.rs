//! Tick counters used to pace the bus
//!
//! The I2C engine never sleeps. It resets a [`Timebase`] and spins until the
//! counter has advanced by half a bit period, so any free-running hardware
//! timer that can be zeroed and read back is enough to drive it.
//!
//! Boards without such a counter can wrap an [`embedded_hal::delay::DelayNs`]
//! provider in a [`DelayTimebase`].

use embedded_hal::delay::DelayNs;
use fugit::HertzU32;

/// Monotonic tick counter with a resettable origin.
///
/// Implementations must count up at the rate given to
/// [`Config::with_tick_rate`](crate::i2c::Config::with_tick_rate).
pub trait Timebase {
    /// Set the counter back to zero.
    fn reset(&mut self);

    /// Ticks elapsed since the last [`reset`](Timebase::reset).
    fn elapsed_ticks(&mut self) -> u32;
}

impl<T: Timebase + ?Sized> Timebase for &mut T {
    #[inline]
    fn reset(&mut self) {
        T::reset(self)
    }

    #[inline]
    fn elapsed_ticks(&mut self) -> u32 {
        T::elapsed_ticks(self)
    }
}

/// Tick counter emulated on top of a delay provider.
///
/// Every poll of [`elapsed_ticks`](Timebase::elapsed_ticks) blocks for one
/// tick period and then reports the number of ticks slept since the last
/// reset.
pub struct DelayTimebase<D>
where
    D: DelayNs,
{
    delay: D,
    tick_ns: u32,
    ticks: u32,
}

impl<D> DelayTimebase<D>
where
    D: DelayNs,
{
    /// Create instance counting at `tick_rate`
    pub fn new(delay: D, tick_rate: HertzU32) -> Self {
        let tick_ns = match tick_rate.to_Hz() {
            0 => 0,
            hz => 1_000_000_000 / hz,
        };

        DelayTimebase {
            delay,
            tick_ns,
            ticks: 0,
        }
    }

    /// Length of one tick in nanoseconds
    pub fn tick_ns(&self) -> u32 {
        self.tick_ns
    }

    /// Release the delay provider
    pub fn free(self) -> D {
        self.delay
    }
}

impl<D> Timebase for DelayTimebase<D>
where
    D: DelayNs,
{
    #[inline]
    fn reset(&mut self) {
        self.ticks = 0;
    }

    #[inline]
    fn elapsed_ticks(&mut self) -> u32 {
        self.delay.delay_ns(self.tick_ns);
        self.ticks = self.ticks.saturating_add(1);
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use fugit::RateExtU32;

    #[test]
    fn tick_length_follows_rate() {
        let timebase = DelayTimebase::new(NoopDelay::new(), 1.MHz());
        assert_eq!(timebase.tick_ns(), 1_000);

        let timebase = DelayTimebase::new(NoopDelay::new(), 400.kHz());
        assert_eq!(timebase.tick_ns(), 2_500);

        let timebase = DelayTimebase::new(NoopDelay::new(), 0.Hz());
        assert_eq!(timebase.tick_ns(), 0);
    }

    #[test]
    fn counts_one_tick_per_poll() {
        let mut timebase = DelayTimebase::new(NoopDelay::new(), 1.MHz());

        assert_eq!(timebase.elapsed_ticks(), 1);
        assert_eq!(timebase.elapsed_ticks(), 2);
        assert_eq!(timebase.elapsed_ticks(), 3);

        timebase.reset();
        assert_eq!(timebase.elapsed_ticks(), 1);
    }

    fn poll_twice<T: Timebase>(mut timebase: T) {
        timebase.elapsed_ticks();
        timebase.elapsed_ticks();
    }

    #[test]
    fn borrowed_timebase_shares_state() {
        let mut timebase = DelayTimebase::new(NoopDelay::new(), 1.MHz());

        poll_twice(&mut timebase);

        assert_eq!(timebase.elapsed_ticks(), 3);
    }
}
