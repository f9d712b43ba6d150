//! Boot loader flashing session.
//!
//! A [`Session`] walks the target through a fixed sequence of states:
//! into programming mode, identity capture, erase, identity restore,
//! image programming, banner check, and back into firmware mode.

use crate::bitbang::{Timing, Transceiver};
use crate::image::{FirmwareImage, Strategy};
use crate::poll::{CancelToken, PollPolicy};
use crate::profile::{DeviceProfile, Region};
use crate::protocol::Flash;
use crate::{Error, Gpio, Level, PinMap, PinMode, Result};

/// The 5-byte chip identity kept in the info page.
///
/// Erasing the info page destroys it, so it is captured first and
/// written back afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipId(pub Vec<u8>);

impl std::fmt::Display for ChipId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Outcome of a read-back comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Match,
    /// First differing byte.
    Mismatch { address: u16, expected: u8, read: u8 },
    /// Nothing to compare: the profile has no chip ID or no banner.
    NotAttempted,
}

impl Verification {
    /// Compare `read` from `address` onwards against `expected`.
    pub fn compare(address: u16, expected: &[u8], read: &[u8]) -> Self {
        let mismatch = expected.iter().zip(read).enumerate().find(|(_, (a, b))| a != b);
        match mismatch {
            Some((idx, (a, b))) => Verification::Mismatch {
                address: address.wrapping_add(idx as u16), expected: *a, read: *b,
            },
            None if read.len() < expected.len() => Verification::Mismatch {
                address: address.wrapping_add(read.len() as u16),
                expected: expected[read.len()],
                read: 0xFF,
            },
            None => Verification::Match,
        }
    }

    pub fn is_match(&self) -> bool {
        *self == Verification::Match
    }
}

/// What to do when a verification does not match.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// Log the mismatch and carry on.
    Advisory,
    /// Abort the session with `Error::VerifyFailed`.
    Fatal,
}

/// Session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub strategy: Strategy,
    pub verify: VerifyPolicy,
    pub poll: PollPolicy,
    pub timing: Timing,
    pub pins: PinMap,
    pub profile: DeviceProfile,
    /// Check RESET is pulled up before starting.
    pub check_connection: bool,
    /// Draw a progress bar while programming.
    pub progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            strategy: Strategy::Fast,
            verify: VerifyPolicy::Advisory,
            poll: PollPolicy::default(),
            timing: Timing::default(),
            pins: PinMap::default(),
            profile: DeviceProfile::default(),
            check_connection: false,
            progress: false,
        }
    }
}

/// Steps of a session, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CheckConnection,
    EnterProgramming,
    AcquireBus,
    CaptureIdentity,
    Erase,
    RestoreIdentity,
    ProgramImage,
    FinalVerify,
    Exit,
    Done,
}

/// Results of a completed session.
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub chip_id: ChipId,
    /// Boot loader descriptor from the info page, as read before erasing.
    pub info_descriptor: Vec<u8>,
    /// Flash protection configuration register.
    pub protection_config: u8,
    pub identity: Verification,
    pub banner: Verification,
    /// Banner text as read back from the device.
    pub banner_text: String,
    pub bytes_programmed: usize,
}

pub struct Session<'a, G: Gpio> {
    flash: Flash<'a, G>,
    config: SessionConfig,
    state: SessionState,
}

impl<'a, G: Gpio> Session<'a, G> {
    pub fn new(gpio: &'a mut G, config: SessionConfig) -> Self {
        let spi = Transceiver::new(gpio, config.pins, config.timing);
        let mut flash = Flash::new(spi, config.profile);
        flash.set_poll_policy(config.poll);
        Session { flash, config, state: SessionState::Idle }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token which aborts the session at its next readiness wait.
    pub fn cancel_token(&self) -> CancelToken {
        self.flash.cancel_token()
    }

    pub fn flash(&mut self) -> &mut Flash<'a, G> {
        &mut self.flash
    }

    /// Run the whole session, programming `image`.
    ///
    /// Errors end the session immediately, leaving the lines as they are.
    pub fn run(&mut self, image: &FirmwareImage) -> Result<SessionReport> {
        if self.config.check_connection {
            self.check_connection()?;
        }
        self.enter_programming_mode()?;
        self.acquire_bus()?;
        let protection_config = self.flash.read_protection_config()?;
        log::debug!("Flash protection config: 0x{:02X}", protection_config);
        let (chip_id, info_descriptor) = self.capture_identity()?;
        self.erase()?;
        let identity = self.restore_identity(&chip_id)?;
        let bytes_programmed = self.program_image(image)?;
        let (banner, banner_text) = self.final_verify()?;
        self.exit()?;
        self.transition(SessionState::Done);
        Ok(SessionReport {
            chip_id, info_descriptor, protection_config, identity, banner, banner_text,
            bytes_programmed,
        })
    }

    /// Check the target is attached: its RESET line is pulled up.
    pub fn check_connection(&mut self) -> Result<()> {
        self.transition(SessionState::CheckConnection);
        let reset = self.config.pins.reset;
        let gpio = self.flash.transceiver().gpio();
        gpio.configure(reset, PinMode::Input)?;
        if gpio.read(reset)?.is_high() {
            Ok(())
        } else {
            log::error!("RESET is low, is the device connected?");
            Err(Error::NotConnected)
        }
    }

    /// Reset the target with PROG high, starting its flash programming agent.
    pub fn enter_programming_mode(&mut self) -> Result<()> {
        self.transition(SessionState::EnterProgramming);
        self.reset_with_prog(Level::High)
    }

    /// Start driving the SPI bus.
    pub fn acquire_bus(&mut self) -> Result<()> {
        self.transition(SessionState::AcquireBus);
        self.flash.transceiver().set_output_enable(true)
    }

    /// Read the chip identity and the boot loader descriptor from the info page.
    pub fn capture_identity(&mut self) -> Result<(ChipId, Vec<u8>)> {
        self.transition(SessionState::CaptureIdentity);
        let profile = self.config.profile;
        self.flash.select_region(Region::InfoPage)?;
        let chip_id = ChipId(self.flash.read(profile.chip_id_address, profile.chip_id_len)?);
        log::info!("Chip ID is: {}", chip_id);
        let descriptor = self.flash.read(profile.info_descriptor_address,
                                         profile.info_descriptor_len)?;
        log::info!("Info page is: {:02x?}", descriptor);
        Ok((chip_id, descriptor))
    }

    /// Erase the main block, then the info page.
    pub fn erase(&mut self) -> Result<()> {
        self.transition(SessionState::Erase);
        log::info!("Erasing main block");
        self.flash.select_region(Region::MainBlock)?;
        self.flash.enable_write()?;
        self.flash.erase_all()?;

        log::info!("Erasing info page");
        self.flash.select_region(Region::InfoPage)?;
        self.flash.enable_write()?;
        self.flash.erase_page(0)
    }

    /// Write `chip_id` back to the info page and read it back.
    ///
    /// Expects the info page to still be selected after `erase()`.
    pub fn restore_identity(&mut self, chip_id: &ChipId) -> Result<Verification> {
        self.transition(SessionState::RestoreIdentity);
        if chip_id.0.is_empty() {
            return self.check("Chip ID", Verification::NotAttempted);
        }
        let address = self.config.profile.chip_id_address;
        log::info!("Writing chip ID");
        self.flash.enable_write()?;
        self.flash.program(address, &chip_id.0)?;
        self.flash.wait_while_busy()?;
        let read = self.flash.read(address, chip_id.0.len())?;
        let result = Verification::compare(address, &chip_id.0, &read);
        self.check("Chip ID", result)
    }

    /// Program the image according to the configured strategy.
    ///
    /// Returns the number of bytes programmed.
    pub fn program_image(&mut self, image: &FirmwareImage) -> Result<usize> {
        self.transition(SessionState::ProgramImage);
        let strategy = self.config.strategy;
        match strategy {
            Strategy::Fast => log::info!("Programming device (boot loader only)"),
            Strategy::Full => log::info!("Programming device (full image)"),
        }
        self.flash.select_region(Region::MainBlock)?;
        let mut total = 0;
        for segment in image.segments(strategy, &self.config.profile) {
            log::debug!("Programming {} bytes at 0x{:04X}", segment.data.len(), segment.address);
            self.program_segment(segment.address, &segment.data)?;
            total += segment.data.len();
        }
        log::info!("Programming finished, {} bytes written", total);
        Ok(total)
    }

    #[cfg(feature = "progress")]
    fn program_segment(&mut self, address: u16, data: &[u8]) -> Result<()> {
        if self.config.progress {
            self.flash.program_data_progress(address, data)
        } else {
            self.flash.program_data(address, data)
        }
    }

    #[cfg(not(feature = "progress"))]
    fn program_segment(&mut self, address: u16, data: &[u8]) -> Result<()> {
        self.flash.program_data(address, data)
    }

    /// Read the boot loader banner from the main block and compare it
    /// with the profile's expected text.
    pub fn final_verify(&mut self) -> Result<(Verification, String)> {
        self.transition(SessionState::FinalVerify);
        let profile = self.config.profile;
        if profile.banner.is_empty() {
            return Ok((self.check("Boot loader banner", Verification::NotAttempted)?,
                       String::new()));
        }
        let stride = profile.banner_stride.max(1);
        self.flash.select_region(Region::MainBlock)?;
        let raw = self.flash.read(profile.banner_address, profile.banner.len() * stride)?;
        let banner: Vec<u8> = raw.chunks(stride).map(|c| c[c.len() - 1]).collect();
        let text: String = banner.iter().map(|&b| b as char).collect();
        log::info!("Banner should be: {}", profile.banner);
        log::info!("Banner is:        {}", text);
        let result = match Verification::compare(0, profile.banner.as_bytes(), &banner) {
            Verification::Mismatch { address, expected, read } => Verification::Mismatch {
                address: profile.banner_address + address * stride as u16 + stride as u16 - 1,
                expected, read,
            },
            other => other,
        };
        Ok((self.check("Boot loader banner", result)?, text))
    }

    /// Release the SPI bus and reset the target with PROG low, so it runs firmware.
    pub fn exit(&mut self) -> Result<()> {
        self.transition(SessionState::Exit);
        self.flash.transceiver().set_output_enable(false)?;
        self.reset_with_prog(Level::Low)
    }

    fn reset_with_prog(&mut self, prog: Level) -> Result<()> {
        let pins = self.config.pins;
        let delay = self.config.timing.reset_delay;
        let gpio = self.flash.transceiver().gpio();
        gpio.configure(pins.reset, PinMode::Output(Level::Low))?;
        gpio.configure(pins.prog, PinMode::Output(prog))?;
        gpio.sleep(delay);
        gpio.write(pins.reset, Level::High)?;
        gpio.sleep(delay);
        Ok(())
    }

    /// Apply the verify policy to `result`.
    fn check(&self, what: &'static str, result: Verification) -> Result<Verification> {
        match result {
            Verification::Match => log::info!("{} verify OK", what),
            Verification::Mismatch { address, expected, read } => {
                if self.config.verify == VerifyPolicy::Fatal {
                    log::error!("{} verify FAILED at 0x{:04X}", what, address);
                    return Err(Error::VerifyFailed { what, address, wrote: expected, read });
                }
                log::warn!("{} verify FAILED at 0x{:04X}: expected 0x{:02X}, read 0x{:02X}",
                           what, address, expected, read);
            },
            Verification::NotAttempted => log::debug!("{} verify skipped", what),
        }
        Ok(result)
    }

    fn transition(&mut self, state: SessionState) {
        log::debug!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Opcode;
    use crate::sim::{DeviceMode, SimConfig, SimDevice};
    use core::time::Duration;
    use std::io::Cursor;
    use std::sync::mpsc;

    fn boot_image() -> Vec<u8> {
        let profile = DeviceProfile::NRF24LU1P_F32;
        let mut raw: Vec<u8> = (0..0x8000u32).map(|x| (x * 7 % 253) as u8).collect();
        let start = profile.banner_address as usize;
        for (i, c) in profile.banner.bytes().enumerate() {
            raw[start + 2 * i] = 0x03;
            raw[start + 2 * i + 1] = c;
        }
        raw
    }

    fn config(strategy: Strategy) -> SessionConfig {
        SessionConfig { strategy, timing: Timing::none(), ..Default::default() }
    }

    fn load(raw: &[u8], strategy: Strategy) -> FirmwareImage {
        FirmwareImage::from_reader(Cursor::new(raw.to_vec()), strategy,
                                   &DeviceProfile::NRF24LU1P_F32).unwrap()
    }

    #[test]
    fn test_full_session() {
        let raw = boot_image();
        let mut dev = SimDevice::new(SimConfig::default());
        dev.info_page_mut()[0x20..0x25].copy_from_slice(&[1, 2, 3, 4, 5]);
        let report = {
            let mut session = Session::new(&mut dev, config(Strategy::Full));
            let report = session.run(&load(&raw, Strategy::Full)).unwrap();
            assert_eq!(session.state(), SessionState::Done);
            report
        };
        assert_eq!(report.chip_id, ChipId(vec![0xC1, 0x0E, 0x75, 0xD4, 0x8A]));
        assert_eq!(report.info_descriptor, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.identity, Verification::Match);
        assert_eq!(report.banner, Verification::Match);
        assert_eq!(report.banner_text, DeviceProfile::NRF24LU1P_F32.banner);
        assert_eq!(report.bytes_programmed, 0x8000);
        assert_eq!(dev.main_block(), &raw[..]);
        assert_eq!(&dev.info_page()[0x0B..0x10], &[0xC1, 0x0E, 0x75, 0xD4, 0x8A]);
        // The rest of the info page was erased.
        assert_eq!(&dev.info_page()[0x20..0x25], &[0xFF; 5]);
        assert_eq!(dev.mode(), DeviceMode::Firmware);
        let pins = PinMap::default();
        for pin in pins.spi_lines().iter() {
            assert_eq!(dev.pin_mode(*pin), Some(PinMode::Input));
        }
    }

    #[test]
    fn test_fast_session() {
        let raw = boot_image();
        let mut dev = SimDevice::new(SimConfig::default());
        let report = Session::new(&mut dev, config(Strategy::Fast))
            .run(&load(&raw, Strategy::Fast)).unwrap();
        assert_eq!(report.bytes_programmed, 3 + 0x800);
        assert_eq!(report.banner, Verification::Match);
        let main = dev.main_block();
        assert_eq!(&main[..3], &[0x02, 0x78, 0x00]);
        assert!(main[3..0x7800].iter().all(|&b| b == 0xFF));
        assert_eq!(&main[0x7800..], &raw[0x7800..]);

        // One write enable per chunk: the reset vector, then ceil(0x800 / 250) runs,
        // plus the erases and the chip ID.
        let programs: Vec<_> = dev.command_log().iter()
            .filter(|c| c.opcode == Opcode::Program).map(|c| c.address.unwrap()).collect();
        let mut expected = vec![0x000B, 0x0000];
        expected.extend((0..9).map(|i| 0x7800 + 250 * i));
        assert_eq!(programs, expected);
        let wrens = dev.command_log().iter().filter(|c| c.opcode == Opcode::WriteEnable).count();
        assert_eq!(wrens, 2 + 1 + 1 + 9);
    }

    #[test]
    fn test_banner_mismatch_policy() {
        let mut raw = boot_image();
        raw[0x7F51] = b'X';

        let mut dev = SimDevice::new(SimConfig::default());
        let report = Session::new(&mut dev, config(Strategy::Fast))
            .run(&load(&raw, Strategy::Fast)).unwrap();
        assert_eq!(report.banner,
                   Verification::Mismatch { address: 0x7F51, expected: b'N', read: b'X' });
        assert_eq!(dev.mode(), DeviceMode::Firmware);

        let mut dev = SimDevice::new(SimConfig::default());
        let cfg = SessionConfig { verify: VerifyPolicy::Fatal, ..config(Strategy::Fast) };
        let mut session = Session::new(&mut dev, cfg);
        match session.run(&load(&raw, Strategy::Fast)) {
            Err(Error::VerifyFailed { address: 0x7F51, wrote: b'N', read: b'X', .. }) => (),
            other => panic!("expected VerifyFailed, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::FinalVerify);
    }

    #[test]
    fn test_chip_id_mismatch_policy() {
        let raw = boot_image();
        let faulty = || SimConfig { info_page_stuck_high: 0x02, ..Default::default() };

        let mut dev = SimDevice::new(faulty());
        let report = Session::new(&mut dev, config(Strategy::Fast))
            .run(&load(&raw, Strategy::Fast)).unwrap();
        assert_eq!(report.identity,
                   Verification::Mismatch { address: 0x000B, expected: 0xC1, read: 0xC3 });
        assert_eq!(report.banner, Verification::Match);
        assert_eq!(dev.mode(), DeviceMode::Firmware);

        let mut dev = SimDevice::new(faulty());
        let cfg = SessionConfig { verify: VerifyPolicy::Fatal, ..config(Strategy::Fast) };
        let mut session = Session::new(&mut dev, cfg);
        match session.run(&load(&raw, Strategy::Fast)) {
            Err(Error::VerifyFailed { what: "Chip ID", address: 0x000B, wrote: 0xC1, read: 0xC3 }) => (),
            other => panic!("expected VerifyFailed, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::RestoreIdentity);
        // The image was never programmed.
        assert!(dev.main_block().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_checks_skipped_without_chip_id_or_banner() {
        let raw = boot_image();
        let profile = DeviceProfile { chip_id_len: 0, banner: "", ..DeviceProfile::NRF24LU1P_F32 };
        let mut dev = SimDevice::new(SimConfig::default());
        let cfg = SessionConfig { profile, verify: VerifyPolicy::Fatal, ..config(Strategy::Fast) };
        let report = Session::new(&mut dev, cfg).run(&load(&raw, Strategy::Fast)).unwrap();
        assert_eq!(report.chip_id, ChipId(vec![]));
        assert_eq!(report.identity, Verification::NotAttempted);
        assert_eq!(report.banner, Verification::NotAttempted);
        assert_eq!(report.banner_text, "");
        // Only the reset vector and the boot loader were programmed.
        assert!(dev.command_log().iter()
            .filter(|c| c.opcode == Opcode::Program).all(|c| c.address != Some(0x000B)));
    }

    #[test]
    fn test_write_enable_failure_aborts() {
        let raw = boot_image();
        let mut dev = SimDevice::new(SimConfig { ignore_write_enable: true, ..Default::default() });
        let mut session = Session::new(&mut dev, config(Strategy::Full));
        match session.run(&load(&raw, Strategy::Full)) {
            Err(Error::WriteEnableFailed { .. }) => (),
            other => panic!("expected WriteEnableFailed, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Erase);
        // Nothing after the failed WREN check, and the bus is left driven.
        let last = dev.command_log().last().unwrap().opcode;
        assert_eq!(last, Opcode::ReadStatus);
        assert!(!dev.command_log().iter().any(|c| c.opcode == Opcode::EraseAll));
        assert_eq!(dev.mode(), DeviceMode::Programming);
        assert_eq!(dev.pin_mode(PinMap::default().cs), Some(PinMode::Output(Level::High)));
    }

    #[test]
    fn test_not_connected() {
        let mut dev = SimDevice::new(SimConfig { connected: false, ..Default::default() });
        let cfg = SessionConfig { check_connection: true, ..config(Strategy::Full) };
        let raw = boot_image();
        match Session::new(&mut dev, cfg).run(&load(&raw, Strategy::Full)) {
            Err(Error::NotConnected) => (),
            other => panic!("expected NotConnected, got {:?}", other),
        }
        assert!(dev.command_log().is_empty());
    }

    #[test]
    fn test_stuck_erase_times_out() {
        let mut dev = SimDevice::new(SimConfig { stuck_busy: true, ..Default::default() });
        let cfg = SessionConfig {
            poll: PollPolicy::bounded(Duration::from_millis(100), Duration::from_millis(1)),
            ..config(Strategy::Full)
        };
        let mut session = Session::new(&mut dev, cfg);
        match session.run(&load(&boot_image(), Strategy::Full)) {
            Err(Error::Unresponsive { waited }) => assert!(waited >= Duration::from_millis(100)),
            other => panic!("expected Unresponsive, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Erase);
    }

    #[test]
    fn test_stuck_erase_blocks_without_timeout() {
        let (tx, rx) = mpsc::channel();
        let (cancel_tx, cancel_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut dev = SimDevice::new(SimConfig { stuck_busy: true, ..Default::default() });
            let mut session = Session::new(&mut dev, config(Strategy::Full));
            cancel_tx.send(session.cancel_token()).unwrap();
            let result = session.run(&load(&boot_image(), Strategy::Full));
            tx.send(result.map(|_| ())).unwrap();
        });
        let cancel = cancel_rx.recv().unwrap();
        // Still polling long after the erase started.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        cancel.cancel();
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            Err(Error::Cancelled) => (),
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_verification_compare() {
        assert_eq!(Verification::compare(0x10, &[1, 2, 3], &[1, 2, 3]), Verification::Match);
        assert_eq!(Verification::compare(0x10, &[1, 2, 3], &[1, 9, 3]),
                   Verification::Mismatch { address: 0x11, expected: 2, read: 9 });
        assert_eq!(Verification::compare(0x10, &[1, 2, 3], &[1, 2]),
                   Verification::Mismatch { address: 0x12, expected: 3, read: 0xFF });
        assert!(!Verification::NotAttempted.is_match());
        assert_eq!(ChipId(vec![0xAA, 0x0B]).to_string(), "aa 0b");
    }
}
