//! nRF24LU1+ flash programming commands.

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::bitbang::Transceiver;
use crate::poll::{CancelToken, PollPolicy};
use crate::profile::{DeviceProfile, Region};
use crate::sreg::FlashStatus;
use crate::{Error, Gpio, Result};

/// Flash programming interface of an nRF24LU1+ in programming mode.
///
/// Every method issues its command(s) inside their own chip select frames.
pub struct Flash<'a, G: Gpio> {
    spi: Transceiver<'a, G>,
    profile: DeviceProfile,
    region: Region,
    poll: PollPolicy,
    cancel: CancelToken,
}

impl<'a, G: Gpio> Flash<'a, G> {
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new Flash using the given transceiver and device profile.
    ///
    /// Readiness waits use the unbounded default [`PollPolicy`].
    pub fn new(spi: Transceiver<'a, G>, profile: DeviceProfile) -> Self {
        Flash {
            spi, profile, region: Region::MainBlock,
            poll: PollPolicy::default(), cancel: CancelToken::new(),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// Set the policy used by `wait_while_busy()`.
    pub fn set_poll_policy(&mut self, poll: PollPolicy) {
        self.poll = poll;
    }

    /// Token which cancels any current or future readiness wait.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn transceiver(&mut self) -> &mut Transceiver<'a, G> {
        &mut self.spi
    }

    /// Select the main block or the info page for subsequent erase,
    /// program and read commands.
    pub fn select_region(&mut self, region: Region) -> Result<()> {
        log::debug!("Selecting {:?}", region);
        let flag = self.profile.region_flag(region);
        self.write(self.profile.opcodes.write_status, &[flag])?;
        self.region = region;
        Ok(())
    }

    /// Region most recently selected with `select_region()`.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Read the flash status register.
    pub fn read_status(&mut self) -> Result<FlashStatus> {
        self.exchange(self.profile.opcodes.read_status, &[], 1).map(|data| FlashStatus(data[0]))
    }

    /// Check if the device is currently busy performing an erase or program.
    pub fn is_busy(&mut self) -> Result<bool> {
        let busy = self.profile.status.busy;
        self.read_status().map(|status| status.is_set(busy))
    }

    /// Wait until the device stops being busy, according to the poll policy.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        let policy = self.poll;
        let cancel = self.cancel.clone();
        let mut state = policy.start(&cancel);
        while self.is_busy()? {
            let wait = state.next_wait()?;
            if !wait.is_zero() {
                self.spi.gpio().sleep(wait);
            }
        }
        if state.polls() > 0 {
            log::trace!("Device ready after {} busy polls", state.polls());
        }
        Ok(())
    }

    /// Send WREN and check the write enable latch was set.
    ///
    /// Failure means no handshake with the device was achieved, and
    /// returns `Error::WriteEnableFailed`.
    pub fn enable_write(&mut self) -> Result<()> {
        log::debug!("Enabling write");
        self.command(self.profile.opcodes.write_enable)?;
        let status = self.read_status()?;
        if status.is_set(self.profile.status.write_enabled) {
            Ok(())
        } else {
            log::error!("Could not enable writing, status {}", status);
            Err(Error::WriteEnableFailed { status: status.0 })
        }
    }

    /// Send WRDIS, clearing the write enable latch.
    pub fn disable_write(&mut self) -> Result<()> {
        self.command(self.profile.opcodes.write_disable)
    }

    /// Erase the selected region entirely.
    ///
    /// Requires `enable_write()` first. Returns once the erase has completed.
    pub fn erase_all(&mut self) -> Result<()> {
        log::debug!("Erasing all");
        self.command(self.profile.opcodes.erase_all)?;
        self.wait_while_busy()
    }

    /// Erase one page of the selected region.
    ///
    /// Requires `enable_write()` first. Returns once the erase has completed.
    pub fn erase_page(&mut self, page: u8) -> Result<()> {
        log::debug!("Erasing page {}", page);
        self.write(self.profile.opcodes.erase_page, &[page])?;
        self.wait_while_busy()
    }

    /// Read `length` bytes of the selected region, starting at `address`.
    pub fn read(&mut self, address: u16, length: usize) -> Result<Vec<u8>> {
        self.check_address_length(address, length)?;
        self.exchange(self.profile.opcodes.read, &address.to_be_bytes(), length)
    }

    /// Program `data` to the selected region at `address` in a single
    /// PROGRAM command.
    ///
    /// Requires `enable_write()` first, and does not wait for completion.
    pub fn program(&mut self, address: u16, data: &[u8]) -> Result<()> {
        self.check_address_length(address, data.len())?;
        let mut tx = address.to_be_bytes().to_vec();
        tx.extend(data);
        self.write(self.profile.opcodes.program, &tx)
    }

    /// Read the flash protection configuration register.
    pub fn read_protection_config(&mut self) -> Result<u8> {
        self.exchange(self.profile.opcodes.read_protection_config, &[], 1).map(|data| data[0])
    }

    /// Program `data` to `address`, split into `chunk_size` runs.
    ///
    /// Before each run this waits for the device to be ready and enables
    /// writing. Waits for the final run to complete before returning.
    ///
    /// Calls `cb` with the number of bytes programmed so far after each run.
    pub fn program_data_cb<F: Fn(usize)>(&mut self, address: u16, data: &[u8], cb: F)
        -> Result<()>
    {
        self.check_address_length(address, data.len())?;
        let chunk_size = self.profile.chunk_size;
        log::trace!("Programming {} bytes to 0x{:04X}, chunk size {} bytes",
                    data.len(), address, chunk_size);

        let mut total_bytes = 0;
        cb(total_bytes);
        for chunk in data.chunks(chunk_size) {
            let chunk_address = address + total_bytes as u16;
            self.wait_while_busy()?;
            self.enable_write()?;
            log::debug!("Writing address 0x{:04X}", chunk_address);
            self.program(chunk_address, chunk)?;
            total_bytes += chunk.len();
            cb(total_bytes);
        }
        self.wait_while_busy()
    }

    /// Program `data` to `address` in `chunk_size` runs.
    pub fn program_data(&mut self, address: u16, data: &[u8]) -> Result<()> {
        self.program_data_cb(address, data, |_| {})
    }

    /// Program `data` to `address` in `chunk_size` runs, and draws a progress
    /// bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn program_data_progress(&mut self, address: u16, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        self.program_data_cb(address, data, |n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Writes `command` and `data` to the device, then returns `nbytes` of response.
    pub fn exchange<C: Into<u8>>(&mut self, command: C, data: &[u8], nbytes: usize)
        -> Result<Vec<u8>>
    {
        let mut tx = vec![command.into()];
        tx.extend(data);
        log::trace!("SPI exchange: write {:02X?}, read {} bytes", &tx, nbytes);
        tx.extend(vec![0u8; nbytes]);
        let rx = self.spi.exchange(&tx)?;
        log::trace!("SPI exchange: read {:02X?}", &rx[1+data.len()..]);
        Ok(rx[1+data.len()..].to_vec())
    }

    /// Writes `command` and `data` to the device, without reading the response.
    pub fn write<C: Into<u8>>(&mut self, command: C, data: &[u8]) -> Result<()> {
        let mut tx = vec![command.into()];
        tx.extend(data);
        log::trace!("SPI write: {:02X?}", &tx);
        self.spi.exchange(&tx)?;
        Ok(())
    }

    /// Convenience method for issuing a single command and not caring about the returned data
    pub fn command<C: Into<u8>>(&mut self, command: C) -> Result<()> {
        self.write(command, &[])
    }

    /// Check `length` bytes from `address` lie inside the selected region.
    fn check_address_length(&self, address: u16, length: usize) -> Result<()> {
        log::trace!("Checking address={:04X} length={}", address, length);
        let end = address as usize + length;
        if end > self.profile.region_size(self.region) {
            log::error!("Operation would exceed {:?} size", self.region);
            Err(Error::InvalidAddress { region: self.region, address: (end - 1) as u32 })
        } else {
            Ok(())
        }
    }
}
