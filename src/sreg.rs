/// Flash Status Register (FSR)
///
/// Read with RDSR. Only the bits relevant to programming are decoded;
/// the bit masks come from the [`crate::DeviceProfile`] in use, the
/// `get_*` methods use the nRF24LU1+ positions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashStatus(pub u8);

impl FlashStatus {
    /// RDYN: set while an erase or program operation is in progress.
    pub const RDYN: u8 = 0b0001_0000;
    /// WEN: write enable latch.
    pub const WEN: u8 = 0b0010_0000;
    /// INFEN: info page selected instead of the main block.
    pub const INFEN: u8 = 0b0000_1000;

    /// Get RDYN (ready-not, busy) bit.
    pub fn get_busy(&self) -> bool {
        self.0 & Self::RDYN != 0
    }

    /// Get WEN (write enable latch) bit.
    pub fn get_write_enabled(&self) -> bool {
        self.0 & Self::WEN != 0
    }

    /// Get INFEN (info page enable) bit.
    pub fn get_info_page_enabled(&self) -> bool {
        self.0 & Self::INFEN != 0
    }

    /// Test an arbitrary bit mask.
    pub fn is_set(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }
}

impl std::fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:02X} (RDYN={} WEN={} INFEN={})", self.0,
               self.get_busy() as u8, self.get_write_enabled() as u8,
               self.get_info_page_enabled() as u8)
    }
}

#[test]
fn test_flash_status_bits() {
    let status = FlashStatus(0x38);
    assert!(status.get_busy());
    assert!(status.get_write_enabled());
    assert!(status.get_info_page_enabled());

    let status = FlashStatus(0x20);
    assert!(!status.get_busy());
    assert!(status.get_write_enabled());
    assert!(!status.get_info_page_enabled());
    assert_eq!(status.to_string(), "0x20 (RDYN=0 WEN=1 INFEN=0)");
}
