//! Linux GPIO character device backend.
//!
//! Requests all six signal lines of a [`PinMap`] from one GPIO chip
//! (for example `/dev/gpiochip0` on a Raspberry Pi) using `gpiocdev`.
//! The lines are released when the [`CdevGpio`] is dropped.

use anyhow::Context;
use core::time::Duration;
use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};

use crate::{AnyhowResult, Gpio, Level, Pin, PinMap, PinMode};

pub struct CdevGpio {
    request: Request,
    config: Config,
    lines: [Offset; 6],
}

impl CdevGpio {
    /// Request the lines in `pins` from `chip`, all as inputs.
    pub fn open(chip: &str, pins: &PinMap) -> AnyhowResult<Self> {
        let lines = [pins.reset, pins.prog, pins.sck, pins.mosi, pins.miso, pins.cs];
        let mut config = Config::default();
        for &line in lines.iter() {
            config.with_line(line).as_input();
        }
        let request = Request::from_config(config.clone())
            .on_chip(chip)
            .with_consumer("nrf24-spi-flash")
            .request()
            .with_context(|| format!("Failed to request GPIO lines on {}", chip))?;
        log::info!("Opened {} ({})", chip, pins);
        Ok(CdevGpio { request, config, lines })
    }

    fn check(&self, pin: Pin) -> AnyhowResult<()> {
        if self.lines.contains(&pin) {
            Ok(())
        } else {
            anyhow::bail!("GPIO {} was not requested", pin)
        }
    }
}

fn value(level: Level) -> Value {
    match level {
        Level::Low => Value::Inactive,
        Level::High => Value::Active,
    }
}

impl Gpio for CdevGpio {
    fn configure(&mut self, pin: Pin, mode: PinMode) -> AnyhowResult<()> {
        self.check(pin)?;
        match mode {
            PinMode::Input => self.config.with_line(pin).as_input(),
            PinMode::Output(level) => self.config.with_line(pin).as_output(value(level)),
        };
        self.request.reconfigure(&self.config)
            .with_context(|| format!("Failed to reconfigure GPIO {} as {:?}", pin, mode))?;
        Ok(())
    }

    fn write(&mut self, pin: Pin, level: Level) -> AnyhowResult<()> {
        self.request.set_value(pin, value(level))
            .with_context(|| format!("Failed to set GPIO {}", pin))?;
        Ok(())
    }

    fn read(&mut self, pin: Pin) -> AnyhowResult<Level> {
        let value = self.request.value(pin)
            .with_context(|| format!("Failed to get GPIO {}", pin))?;
        Ok(match value {
            Value::Active => Level::High,
            Value::Inactive => Level::Low,
        })
    }

    fn sleep(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }
}
