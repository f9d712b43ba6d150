//! Bit-banged SPI master.
//!
//! Clock idles low and data-in is sampled just before each rising edge,
//! which the nRF24LU1+ programming interface expects. Chip select is
//! active low.

use core::time::Duration;

use crate::{Gpio, Level, PinMap, PinMode, Result};

/// Delays used while driving the bus and the reset line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Delay after each clock edge, setting the bit rate.
    pub bit_delay: Duration,
    /// Hold time after every chip select change.
    ///
    /// The default is far longer than the device needs.
    pub cs_settle: Duration,
    /// Hold time around each reset line change.
    pub reset_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            bit_delay: Duration::from_millis(1),
            cs_settle: Duration::from_millis(100),
            reset_delay: Duration::from_millis(100),
        }
    }
}

impl Timing {
    /// No delays at all, for simulated devices.
    pub const fn none() -> Self {
        Timing {
            bit_delay: Duration::from_millis(0),
            cs_settle: Duration::from_millis(0),
            reset_delay: Duration::from_millis(0),
        }
    }
}

/// SPI transceiver built from GPIO toggling.
///
/// Owns the clock, data and chip select lines for as long as it lives.
pub struct Transceiver<'a, G: Gpio> {
    gpio: &'a mut G,
    pins: PinMap,
    timing: Timing,
}

impl<'a, G: Gpio> Transceiver<'a, G> {
    pub fn new(gpio: &'a mut G, pins: PinMap, timing: Timing) -> Self {
        Transceiver { gpio, pins, timing }
    }

    pub fn pins(&self) -> &PinMap {
        &self.pins
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Direct access to the GPIO provider, for lines outside the SPI bus.
    pub fn gpio(&mut self) -> &mut G {
        self.gpio
    }

    /// Drive or release the SPI bus.
    ///
    /// When enabled, SCK and MOSI are driven low, CS is driven high
    /// (de-asserted) and MISO is an input. When disabled, all four lines
    /// become inputs so that the target or other tooling may drive them.
    pub fn set_output_enable(&mut self, enabled: bool) -> Result<()> {
        log::debug!("SPI output enable: {}", enabled);
        let pins = self.pins;
        if enabled {
            self.gpio.configure(pins.mosi, PinMode::Output(Level::Low))?;
            self.gpio.configure(pins.sck, PinMode::Output(Level::Low))?;
            self.gpio.configure(pins.cs, PinMode::Output(Level::High))?;
            self.gpio.configure(pins.miso, PinMode::Input)?;
        } else {
            self.gpio.configure(pins.sck, PinMode::Input)?;
            self.gpio.configure(pins.mosi, PinMode::Input)?;
            self.gpio.configure(pins.cs, PinMode::Input)?;
            self.gpio.configure(pins.miso, PinMode::Input)?;
        }
        Ok(())
    }

    /// Assert (drive low) or de-assert chip select, then wait `cs_settle`.
    pub fn set_chip_select(&mut self, asserted: bool) -> Result<()> {
        let level = if asserted { Level::Low } else { Level::High };
        self.gpio.write(self.pins.cs, level)?;
        self.gpio.sleep(self.timing.cs_settle);
        Ok(())
    }

    /// Exchange one byte, MSB first, returning the byte clocked in.
    pub fn transfer(&mut self, mut out: u8) -> Result<u8> {
        let pins = self.pins;
        let mut data = 0u8;
        self.gpio.write(pins.sck, Level::Low)?;
        for _ in 0..8 {
            self.gpio.write(pins.mosi, Level::from_bit(out & 0x80 != 0))?;
            out <<= 1;
            self.gpio.sleep(self.timing.bit_delay);
            let bit = self.gpio.read(pins.miso)?;
            self.gpio.write(pins.sck, Level::High)?;
            data = (data << 1) | bit.is_high() as u8;
            self.gpio.sleep(self.timing.bit_delay);
            self.gpio.write(pins.sck, Level::Low)?;
        }
        Ok(data)
    }

    /// Assert CS, exchange all bytes in `data`, then de-assert CS.
    ///
    /// Returns the received data.
    pub fn exchange(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.set_chip_select(true)?;
        let mut rx = Vec::with_capacity(data.len());
        for &byte in data {
            rx.push(self.transfer(byte)?);
        }
        self.set_chip_select(false)?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnyhowResult, Pin};
    use std::collections::HashMap;

    /// MOSI wired straight to MISO, recording every write.
    #[derive(Default)]
    struct Loopback {
        levels: HashMap<Pin, Level>,
        modes: HashMap<Pin, PinMode>,
        sck_rising: usize,
        cs_writes: Vec<Level>,
    }

    impl Gpio for Loopback {
        fn configure(&mut self, pin: Pin, mode: PinMode) -> AnyhowResult<()> {
            if let PinMode::Output(level) = mode {
                self.levels.insert(pin, level);
            }
            self.modes.insert(pin, mode);
            Ok(())
        }

        fn write(&mut self, pin: Pin, level: Level) -> AnyhowResult<()> {
            let pins = PinMap::default();
            if pin == pins.sck && level == Level::High
                && self.levels.get(&pin) == Some(&Level::Low)
            {
                self.sck_rising += 1;
            }
            if pin == pins.cs {
                self.cs_writes.push(level);
            }
            self.levels.insert(pin, level);
            Ok(())
        }

        fn read(&mut self, pin: Pin) -> AnyhowResult<Level> {
            let pins = PinMap::default();
            assert_eq!(pin, pins.miso);
            Ok(*self.levels.get(&pins.mosi).unwrap_or(&Level::Low))
        }

        fn sleep(&mut self, _dur: Duration) {}
    }

    #[test]
    fn test_loopback_transfer() {
        let mut gpio = Loopback::default();
        let mut spi = Transceiver::new(&mut gpio, PinMap::default(), Timing::none());
        spi.set_output_enable(true).unwrap();
        for v in 0..=255u8 {
            assert_eq!(spi.transfer(v).unwrap(), v);
        }
        assert_eq!(gpio.sck_rising, 256 * 8);
    }

    #[test]
    fn test_exchange_frames_chip_select() {
        let mut gpio = Loopback::default();
        let mut spi = Transceiver::new(&mut gpio, PinMap::default(), Timing::none());
        spi.set_output_enable(true).unwrap();
        assert_eq!(spi.exchange(&[0x05, 0xA5]).unwrap(), vec![0x05, 0xA5]);
        assert_eq!(gpio.cs_writes, vec![Level::Low, Level::High]);
    }

    #[test]
    fn test_output_enable_directions() {
        let pins = PinMap::default();
        let mut gpio = Loopback::default();
        let mut spi = Transceiver::new(&mut gpio, pins, Timing::none());
        spi.set_output_enable(true).unwrap();
        assert_eq!(gpio.modes[&pins.cs], PinMode::Output(Level::High));
        assert_eq!(gpio.modes[&pins.sck], PinMode::Output(Level::Low));
        assert_eq!(gpio.modes[&pins.mosi], PinMode::Output(Level::Low));
        assert_eq!(gpio.modes[&pins.miso], PinMode::Input);

        let mut spi = Transceiver::new(&mut gpio, pins, Timing::none());
        spi.set_output_enable(false).unwrap();
        for pin in pins.spi_lines().iter() {
            assert_eq!(gpio.modes[pin], PinMode::Input);
        }
    }
}
