/// Identifier of a GPIO line, interpreted by the [`crate::Gpio`] provider.
///
/// For the Linux character device backend this is the line offset on the chip.
pub type Pin = u32;

/// Assignment of the programming header signals to GPIO lines.
///
/// The map is fixed for the duration of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PinMap {
    /// Header pin carrying the ground reference.
    ///
    /// Recorded for wiring documentation only, it is never driven.
    pub ground: Pin,
    /// RESET, active low. Pulled up on the target when connected.
    pub reset: Pin,
    /// PROG, high to enter the flash programming agent on reset.
    pub prog: Pin,
    pub sck: Pin,
    pub mosi: Pin,
    pub miso: Pin,
    /// Chip select, active low.
    pub cs: Pin,
}

impl PinMap {
    /// The four lines driven by the SPI transceiver.
    pub fn spi_lines(&self) -> [Pin; 4] {
        [self.sck, self.mosi, self.miso, self.cs]
    }
}

impl Default for PinMap {
    /// Raspberry Pi expansion header wiring, as BCM line numbers.
    ///
    /// | Signal | Pi header | BCM | nRF24LU1+ header |
    /// |--------|-----------|-----|------------------|
    /// | GND    | 6         | -   | 9                |
    /// | RESET  | 18        | 24  | 3                |
    /// | PROG   | 22        | 25  | 2                |
    /// | SCK    | 23        | 11  | 4                |
    /// | MOSI   | 19        | 10  | 6                |
    /// | MISO   | 21        | 9   | 8                |
    /// | CS     | 24        | 8   | 10               |
    fn default() -> Self {
        PinMap { ground: 6, reset: 24, prog: 25, sck: 11, mosi: 10, miso: 9, cs: 8 }
    }
}

impl std::fmt::Display for PinMap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "reset={} prog={} sck={} mosi={} miso={} cs={} (gnd on header pin {})",
               self.reset, self.prog, self.sck, self.mosi, self.miso, self.cs, self.ground)
    }
}
