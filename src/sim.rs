//! Simulated nRF24LU1+ attached to simulated GPIO lines.
//!
//! [`SimDevice`] implements [`Gpio`] and decodes the pin activity the way
//! the target does: RESET and PROG select programming or firmware mode,
//! and the SPI lines carry the flash programming command set. Sleeps
//! only advance a virtual clock.

use core::time::Duration;
use std::collections::HashMap;

use crate::profile::Opcode;
use crate::sreg::FlashStatus;
use crate::{AnyhowResult, Gpio, Level, Pin, PinMap, PinMode};

/// Behaviour of a [`SimDevice`].
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub pins: PinMap,
    /// When false, RESET reads low as an input, as if nothing were attached.
    pub connected: bool,
    /// Status polls reporting busy after each erase.
    pub erase_busy_polls: usize,
    /// Status polls reporting busy after each program.
    pub program_busy_polls: usize,
    /// Never finish an erase or program once one is started.
    pub stuck_busy: bool,
    /// Ignore WREN, so the write enable latch is never set.
    pub ignore_write_enable: bool,
    /// Value returned by RDFPCR.
    pub protection_config: u8,
    /// Bits which programming cannot clear in the info page.
    pub info_page_stuck_high: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            pins: PinMap::default(),
            connected: true,
            erase_busy_polls: 3,
            program_busy_polls: 1,
            stuck_busy: false,
            ignore_write_enable: false,
            protection_config: 0xFF,
            info_page_stuck_high: 0,
        }
    }
}

/// What the simulated device is currently running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    /// Held in reset.
    Reset,
    /// Flash programming agent, accepting SPI commands.
    Programming,
    /// User firmware.
    Firmware,
}

/// One command received by the simulated device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandRecord {
    pub opcode: Opcode,
    /// Address for PROGRAM and READ, page number for ERASE_PAGE.
    pub address: Option<u16>,
    /// Data bytes following the opcode and address.
    pub data_len: usize,
}

pub struct SimDevice {
    config: SimConfig,
    main: Vec<u8>,
    info: Vec<u8>,

    fsr: u8,
    wen: bool,
    busy: usize,
    busy_forever: bool,
    mode: DeviceMode,

    modes: HashMap<Pin, PinMode>,
    levels: HashMap<Pin, Level>,

    selected: bool,
    shift_in: u8,
    bit_count: u8,
    out_byte: u8,
    frame: Vec<u8>,

    log: Vec<CommandRecord>,
    elapsed: Duration,
}

impl SimDevice {
    pub const MAIN_BLOCK_SIZE: usize = 0x8000;
    pub const PAGE_SIZE: usize = 512;

    /// Create a device running firmware, with an erased main block and an
    /// info page holding a chip ID.
    pub fn new(config: SimConfig) -> Self {
        let mut info = vec![0xFF; Self::PAGE_SIZE];
        info[0x0B..0x10].copy_from_slice(&[0xC1, 0x0E, 0x75, 0xD4, 0x8A]);
        SimDevice {
            config,
            main: vec![0xFF; Self::MAIN_BLOCK_SIZE],
            info,
            fsr: 0,
            wen: false,
            busy: 0,
            busy_forever: false,
            mode: DeviceMode::Firmware,
            modes: HashMap::new(),
            levels: HashMap::new(),
            selected: false,
            shift_in: 0,
            bit_count: 0,
            out_byte: 0,
            frame: Vec::new(),
            log: Vec::new(),
            elapsed: Duration::from_millis(0),
        }
    }

    /// Put the device straight into programming mode, without toggling RESET.
    pub fn power_on_programming(&mut self) {
        self.enter_mode(DeviceMode::Programming);
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn main_block(&self) -> &[u8] {
        &self.main
    }

    pub fn info_page(&self) -> &[u8] {
        &self.info
    }

    pub fn info_page_mut(&mut self) -> &mut [u8] {
        &mut self.info
    }

    /// Every command received since creation.
    pub fn command_log(&self) -> &[CommandRecord] {
        &self.log
    }

    /// Total time slept through the GPIO interface.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn pin_mode(&self, pin: Pin) -> Option<PinMode> {
        self.modes.get(&pin).copied()
    }

    fn status(&self) -> u8 {
        let mut status = self.fsr & FlashStatus::INFEN;
        if self.busy > 0 || self.busy_forever {
            status |= FlashStatus::RDYN;
        }
        if self.wen {
            status |= FlashStatus::WEN;
        }
        status
    }

    fn enter_mode(&mut self, mode: DeviceMode) {
        log::trace!("sim: entering {:?}", mode);
        self.mode = mode;
        self.fsr = 0;
        self.wen = false;
        self.busy = 0;
        self.busy_forever = false;
        self.selected = false;
        self.frame.clear();
    }

    fn level(&self, pin: Pin) -> Level {
        match self.levels.get(&pin) {
            Some(level) => *level,
            // RESET and CS are pulled up on the target.
            None if pin == self.config.pins.reset || pin == self.config.pins.cs => Level::High,
            None => Level::Low,
        }
    }

    fn region_mut(&mut self) -> &mut Vec<u8> {
        if self.fsr & FlashStatus::INFEN != 0 { &mut self.info } else { &mut self.main }
    }

    fn region(&self) -> &[u8] {
        if self.fsr & FlashStatus::INFEN != 0 { &self.info } else { &self.main }
    }

    fn start_busy(&mut self, polls: usize) {
        self.wen = false;
        if self.config.stuck_busy {
            self.busy_forever = true;
        } else {
            self.busy = polls;
        }
    }

    /// Apply a new level on `pin`, reacting to edges.
    fn drive(&mut self, pin: Pin, level: Level) {
        let old = self.level(pin);
        self.levels.insert(pin, level);
        if old == level {
            return;
        }
        let pins = self.config.pins;
        if pin == pins.reset {
            if level == Level::Low {
                self.enter_mode(DeviceMode::Reset);
            } else if self.level(pins.prog) == Level::High {
                self.enter_mode(DeviceMode::Programming);
            } else {
                self.enter_mode(DeviceMode::Firmware);
            }
        } else if pin == pins.cs && self.mode == DeviceMode::Programming {
            if level == Level::Low {
                self.selected = true;
                self.frame.clear();
                self.bit_count = 0;
                self.shift_in = 0;
                self.out_byte = 0;
            } else if self.selected {
                self.selected = false;
                self.finish_frame();
            }
        } else if pin == pins.sck && level == Level::High && self.selected {
            self.shift_in = (self.shift_in << 1) | self.level(pins.mosi).is_high() as u8;
            self.bit_count += 1;
            if self.bit_count == 8 {
                let byte = self.shift_in;
                self.bit_count = 0;
                self.shift_in = 0;
                self.on_byte(byte);
            }
        }
    }

    /// A full byte was clocked in; work out what to clock out next.
    fn on_byte(&mut self, byte: u8) {
        self.frame.push(byte);
        let opcode = Opcode::try_from(self.frame[0]).ok();
        self.out_byte = match opcode {
            Some(Opcode::ReadStatus) => {
                let status = self.status();
                if self.frame.len() == 1 && self.busy > 0 {
                    self.busy -= 1;
                }
                status
            },
            Some(Opcode::Read) if self.frame.len() >= 3 => {
                let address = u16::from_be_bytes([self.frame[1], self.frame[2]]) as usize
                    + (self.frame.len() - 3);
                *self.region().get(address).unwrap_or(&0xFF)
            },
            Some(Opcode::ReadProtectionConfig) => self.config.protection_config,
            _ => 0,
        };
    }

    /// Chip select was released; execute the received command.
    fn finish_frame(&mut self) {
        let frame = core::mem::take(&mut self.frame);
        if frame.is_empty() {
            return;
        }
        let opcode = match Opcode::try_from(frame[0]) {
            Ok(opcode) => opcode,
            Err(_) => {
                log::warn!("sim: ignoring unknown opcode 0x{:02X}", frame[0]);
                return;
            }
        };
        let address = match opcode {
            Opcode::Program | Opcode::Read if frame.len() >= 3 =>
                Some(u16::from_be_bytes([frame[1], frame[2]])),
            Opcode::ErasePage if frame.len() >= 2 => Some(frame[1] as u16),
            _ => None,
        };
        let data_len = match opcode {
            Opcode::Program | Opcode::Read => frame.len().saturating_sub(3),
            _ => frame.len() - 1,
        };
        self.log.push(CommandRecord { opcode, address, data_len });

        if (self.busy > 0 || self.busy_forever) && opcode != Opcode::ReadStatus {
            log::warn!("sim: ignoring {:?} while busy", opcode);
            return;
        }

        match opcode {
            Opcode::WriteEnable => self.wen = !self.config.ignore_write_enable,
            Opcode::WriteDisable => self.wen = false,
            Opcode::WriteStatus => {
                if let Some(&flag) = frame.get(1) {
                    self.fsr = (self.fsr & !FlashStatus::INFEN) | (flag & FlashStatus::INFEN);
                }
            },
            Opcode::EraseAll if self.wen => {
                self.region_mut().iter_mut().for_each(|b| *b = 0xFF);
                self.start_busy(self.config.erase_busy_polls);
            },
            Opcode::ErasePage if self.wen => {
                if let Some(address) = address {
                    let start = address as usize * Self::PAGE_SIZE;
                    let region = self.region_mut();
                    let end = usize::min(start + Self::PAGE_SIZE, region.len());
                    if start < end {
                        region[start..end].iter_mut().for_each(|b| *b = 0xFF);
                    }
                }
                self.start_busy(self.config.erase_busy_polls);
            },
            Opcode::Program if self.wen => {
                if let Some(address) = address {
                    let stuck = if self.fsr & FlashStatus::INFEN != 0 {
                        self.config.info_page_stuck_high
                    } else {
                        0
                    };
                    let region = self.region_mut();
                    for (i, byte) in frame[3..].iter().enumerate() {
                        // Programming only clears bits.
                        if let Some(cell) = region.get_mut(address as usize + i) {
                            *cell &= *byte | stuck;
                        }
                    }
                }
                self.start_busy(self.config.program_busy_polls);
            },
            Opcode::EraseAll | Opcode::ErasePage | Opcode::Program => {
                log::warn!("sim: ignoring {:?} without write enable", opcode);
            },
            _ => (),
        }
    }
}

impl Gpio for SimDevice {
    fn configure(&mut self, pin: Pin, mode: PinMode) -> AnyhowResult<()> {
        self.modes.insert(pin, mode);
        match mode {
            PinMode::Output(level) => self.drive(pin, level),
            PinMode::Input => {
                // Released lines float to their pulled state.
                self.levels.remove(&pin);
                if pin == self.config.pins.cs && self.selected {
                    self.selected = false;
                    self.finish_frame();
                }
            },
        }
        Ok(())
    }

    fn write(&mut self, pin: Pin, level: Level) -> AnyhowResult<()> {
        match self.modes.get(&pin) {
            Some(PinMode::Output(_)) => {
                self.drive(pin, level);
                Ok(())
            },
            _ => anyhow::bail!("GPIO {} written while not configured as an output", pin),
        }
    }

    fn read(&mut self, pin: Pin) -> AnyhowResult<Level> {
        let pins = self.config.pins;
        if pin == pins.miso {
            if self.selected {
                Ok(Level::from_bit(self.out_byte & (0x80 >> self.bit_count) != 0))
            } else {
                Ok(Level::Low)
            }
        } else if pin == pins.reset && self.modes.get(&pin) == Some(&PinMode::Input) {
            Ok(Level::from_bit(self.config.connected))
        } else {
            Ok(self.level(pin))
        }
    }

    fn sleep(&mut self, dur: Duration) {
        self.elapsed += dur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_reset(dev: &mut SimDevice, prog: Level) {
        let pins = dev.config.pins;
        dev.configure(pins.reset, PinMode::Output(Level::Low)).unwrap();
        dev.configure(pins.prog, PinMode::Output(prog)).unwrap();
        dev.write(pins.reset, Level::High).unwrap();
    }

    #[test]
    fn test_reset_selects_mode() {
        let mut dev = SimDevice::new(SimConfig::default());
        assert_eq!(dev.mode(), DeviceMode::Firmware);
        pulse_reset(&mut dev, Level::High);
        assert_eq!(dev.mode(), DeviceMode::Programming);
        pulse_reset(&mut dev, Level::Low);
        assert_eq!(dev.mode(), DeviceMode::Firmware);
    }

    #[test]
    fn test_write_requires_output() {
        let mut dev = SimDevice::new(SimConfig::default());
        let pins = dev.config.pins;
        assert!(dev.write(pins.sck, Level::High).is_err());
        dev.configure(pins.sck, PinMode::Output(Level::Low)).unwrap();
        assert!(dev.write(pins.sck, Level::High).is_ok());
    }

    #[test]
    fn test_spi_ignored_outside_programming_mode() {
        let mut dev = SimDevice::new(SimConfig::default());
        let pins = dev.config.pins;
        dev.configure(pins.cs, PinMode::Output(Level::High)).unwrap();
        dev.configure(pins.sck, PinMode::Output(Level::Low)).unwrap();
        dev.configure(pins.mosi, PinMode::Output(Level::Low)).unwrap();
        dev.write(pins.cs, Level::Low).unwrap();
        dev.write(pins.sck, Level::High).unwrap();
        dev.write(pins.cs, Level::High).unwrap();
        assert!(dev.command_log().is_empty());
    }

    #[test]
    fn test_disconnected_reset_reads_low() {
        let mut dev = SimDevice::new(SimConfig { connected: false, ..Default::default() });
        let reset = dev.config.pins.reset;
        dev.configure(reset, PinMode::Input).unwrap();
        assert_eq!(dev.read(reset).unwrap(), Level::Low);
    }

    #[test]
    fn test_sleep_advances_clock() {
        let mut dev = SimDevice::new(SimConfig::default());
        dev.sleep(Duration::from_millis(100));
        dev.sleep(Duration::from_millis(5));
        assert_eq!(dev.elapsed(), Duration::from_millis(105));
    }
}
