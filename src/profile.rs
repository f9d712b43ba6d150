use crate::sreg::FlashStatus;

/// nRF24LU1+ flash programming opcodes.
///
/// These are taken from the nRF24LU1+ product specification, section
/// "Flash programming from an external SPI master".
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatus = 0x05,
    WriteStatus = 0x01,
    /// Followed by a page number.
    ErasePage = 0x52,
    EraseAll = 0x62,
    /// Followed by a 16-bit big-endian address and the data.
    Program = 0x02,
    /// Followed by a 16-bit big-endian address, then clocks out data.
    Read = 0x03,
    ReadProtectionConfig = 0x89,

    // Irreversible: readback protection and hardware debug enable.
    // Listed for completeness, never issued by this crate.
    EnableReadbackProtection = 0x85,
    EnableDebug = 0x86,
}

/// Opcodes used by [`crate::Flash`].
///
/// Defaults to the nRF24LU1+ command set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpcodeTable {
    pub write_enable: u8,
    pub write_disable: u8,
    pub read_status: u8,
    pub write_status: u8,
    pub erase_page: u8,
    pub erase_all: u8,
    pub program: u8,
    pub read: u8,
    pub read_protection_config: u8,
}

impl OpcodeTable {
    pub const NRF24LU1P: OpcodeTable = OpcodeTable {
        write_enable: Opcode::WriteEnable as u8,
        write_disable: Opcode::WriteDisable as u8,
        read_status: Opcode::ReadStatus as u8,
        write_status: Opcode::WriteStatus as u8,
        erase_page: Opcode::ErasePage as u8,
        erase_all: Opcode::EraseAll as u8,
        program: Opcode::Program as u8,
        read: Opcode::Read as u8,
        read_protection_config: Opcode::ReadProtectionConfig as u8,
    };
}

/// Status register bit masks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusBits {
    pub busy: u8,
    pub write_enabled: u8,
    pub info_page: u8,
}

/// Flash memory region addressed by erase, program and read commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    MainBlock,
    InfoPage,
}

/// Opcodes, status bits and memory map of one target device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub opcodes: OpcodeTable,
    pub status: StatusBits,

    /// Main block size in bytes.
    pub main_block_size: usize,
    /// Info page size in bytes, which is also the erase page size.
    pub page_size: usize,

    /// Info page offset and length of the chip identity.
    pub chip_id_address: u16,
    pub chip_id_len: usize,
    /// Info page offset and length of the boot loader descriptor.
    pub info_descriptor_address: u16,
    pub info_descriptor_len: usize,

    /// Main block offset of the boot loader, and of the image suffix
    /// written by the fast strategy.
    pub bootloader_address: u16,
    /// Main block address of the boot loader banner.
    pub banner_address: u16,
    /// Expected banner text.
    pub banner: &'static str,
    /// Distance in bytes between consecutive banner characters.
    pub banner_stride: usize,

    /// Maximum number of bytes programmed per write enable cycle.
    pub chunk_size: usize,
}

impl DeviceProfile {
    /// nRF24LU1+ with 32kB flash (Crazyradio, Crazyradio PA).
    pub const NRF24LU1P_F32: DeviceProfile = DeviceProfile {
        name: "nRF24LU1P-F32",
        opcodes: OpcodeTable::NRF24LU1P,
        status: StatusBits {
            busy: FlashStatus::RDYN,
            write_enabled: FlashStatus::WEN,
            info_page: FlashStatus::INFEN,
        },
        main_block_size: 0x8000,
        page_size: 512,
        chip_id_address: 0x000B,
        chip_id_len: 5,
        info_descriptor_address: 0x0020,
        info_descriptor_len: 5,
        bootloader_address: 0x7800,
        banner_address: 0x7F50,
        banner: "Nordic Semiconductor.nRF24LU1P-F32 BOOT LDR",
        banner_stride: 2,
        chunk_size: 250,
    };

    /// Byte written to the status register to select `region`.
    pub fn region_flag(&self, region: Region) -> u8 {
        match region {
            Region::MainBlock => 0,
            Region::InfoPage => self.status.info_page,
        }
    }

    /// Size in bytes of `region`.
    pub fn region_size(&self, region: Region) -> usize {
        match region {
            Region::MainBlock => self.main_block_size,
            Region::InfoPage => self.page_size,
        }
    }

    /// 8051 `LJMP bootloader_address`, written at the reset vector so the
    /// boot loader runs after only the boot loader region was programmed.
    pub fn reset_vector(&self) -> [u8; 3] {
        let [hi, lo] = self.bootloader_address.to_be_bytes();
        [0x02, hi, lo]
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile::NRF24LU1P_F32
    }
}

#[test]
fn test_reset_vector() {
    assert_eq!(DeviceProfile::NRF24LU1P_F32.reset_vector(), [0x02, 0x78, 0x00]);
}

#[test]
fn test_opcode_decoding() {
    assert_eq!(Opcode::try_from(0x62).unwrap(), Opcode::EraseAll);
    assert_eq!(OpcodeTable::NRF24LU1P.read, 0x03);
    assert!(Opcode::try_from(0xFF).is_err());
    assert_eq!(DeviceProfile::NRF24LU1P_F32.region_flag(Region::InfoPage), 0x08);
    assert_eq!(DeviceProfile::NRF24LU1P_F32.region_flag(Region::MainBlock), 0x00);
}

#[test]
fn test_region_size() {
    assert_eq!(DeviceProfile::NRF24LU1P_F32.region_size(Region::MainBlock), 0x8000);
    assert_eq!(DeviceProfile::NRF24LU1P_F32.region_size(Region::InfoPage), 512);
}
