use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::profile::DeviceProfile;
use crate::{Error, Result};

/// Which part of the image is programmed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Only the boot loader region, plus a reset vector jumping to it.
    Fast,
    /// The entire image from address 0.
    Full,
}

/// One contiguous run of bytes to program at `address`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub address: u16,
    pub data: Vec<u8>,
}

/// Firmware image read from a byte source.
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Read an image from `reader`, keeping only what `strategy` programs.
    ///
    /// The fast strategy seeks straight to the boot loader offset.
    pub fn from_reader<R: Read + Seek>(mut reader: R, strategy: Strategy,
                                       profile: &DeviceProfile) -> Result<Self>
    {
        let offset = match strategy {
            Strategy::Fast => profile.bootloader_address as u64,
            Strategy::Full => 0,
        };
        let len = reader.seek(SeekFrom::End(0))? as usize;
        reader.seek(SeekFrom::Start(offset))?;
        log::debug!("Reading image of {} bytes from offset 0x{:04X}", len, offset);
        if len == 0 {
            log::error!("Image is empty");
            return Err(Error::ImageEmpty);
        }
        if len > profile.main_block_size {
            log::error!("Image is larger than the main block");
            return Err(Error::ImageTooLarge { len, max: profile.main_block_size });
        }
        if offset as usize >= len {
            log::error!("Image ends before the boot loader");
            return Err(Error::ImageTooShort { len, offset: offset as usize });
        }
        let mut data = vec![0xFF; offset as usize];
        reader.read_to_end(&mut data)?;
        Ok(FirmwareImage { data })
    }

    /// Read an image file.
    pub fn open<P: AsRef<Path>>(path: P, strategy: Strategy, profile: &DeviceProfile)
        -> Result<Self>
    {
        log::info!("Loading {}", path.as_ref().display());
        Self::from_reader(File::open(path)?, strategy, profile)
    }

    /// Image bytes, addressed from 0.
    ///
    /// With the fast strategy, bytes before the boot loader were never read and are 0xFF.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Work out what to program for `strategy`.
    pub fn segments(&self, strategy: Strategy, profile: &DeviceProfile) -> Vec<Segment> {
        match strategy {
            Strategy::Full => vec![Segment { address: 0, data: self.data.clone() }],
            Strategy::Fast => {
                let start = profile.bootloader_address;
                vec![
                    Segment { address: 0, data: profile.reset_vector().to_vec() },
                    Segment { address: start, data: self.data[start as usize..].to_vec() },
                ]
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|x| (x % 251) as u8).collect()
    }

    #[test]
    fn test_full_segments() {
        let profile = DeviceProfile::NRF24LU1P_F32;
        let raw = image(0x8000);
        let img = FirmwareImage::from_reader(Cursor::new(raw.clone()), Strategy::Full, &profile)
            .unwrap();
        let segments = img.segments(Strategy::Full, &profile);
        assert_eq!(segments, vec![Segment { address: 0, data: raw }]);
    }

    #[test]
    fn test_fast_segments() {
        let profile = DeviceProfile::NRF24LU1P_F32;
        let raw = image(0x8000);
        let img = FirmwareImage::from_reader(Cursor::new(raw.clone()), Strategy::Fast, &profile)
            .unwrap();
        assert_eq!(img.len(), 0x8000);
        assert!(img.data()[..0x7800].iter().all(|&b| b == 0xFF));
        let segments = img.segments(Strategy::Fast, &profile);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], Segment { address: 0, data: vec![0x02, 0x78, 0x00] });
        assert_eq!(segments[1].address, 0x7800);
        assert_eq!(segments[1].data, &raw[0x7800..]);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let profile = DeviceProfile::NRF24LU1P_F32;
        match FirmwareImage::from_reader(Cursor::new(image(0x8001)), Strategy::Full, &profile) {
            Err(Error::ImageTooLarge { len: 0x8001, max: 0x8000 }) => (),
            other => panic!("expected ImageTooLarge, got {:?}", other),
        }
        match FirmwareImage::from_reader(Cursor::new(image(0x7800)), Strategy::Fast, &profile) {
            Err(Error::ImageTooShort { len: 0x7800, offset: 0x7800 }) => (),
            other => panic!("expected ImageTooShort, got {:?}", other),
        }
        for strategy in [Strategy::Full, Strategy::Fast] {
            match FirmwareImage::from_reader(Cursor::new(Vec::new()), strategy, &profile) {
                Err(Error::ImageEmpty) => (),
                other => panic!("expected ImageEmpty, got {:?}", other),
            }
        }
        FirmwareImage::from_reader(Cursor::new(image(1)), Strategy::Full, &profile).unwrap();
    }
}
