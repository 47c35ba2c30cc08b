//! ROM image preparation for upload.
//!
//! The cart expects the image size in 512-byte units, rounded up to a power
//! of two, and accepts the payload in writes of at most 32 KiB.

use bytes::Bytes;

use super::FlashcartCommand;
use crate::error::{LinkError, Result};

/// Size unit used by the `cmdW` chunk count.
pub const ROM_UNIT_SIZE: usize = 512;

/// Largest single transport write while streaming a ROM.
pub const ROM_WRITE_CHUNK: usize = 32 * 1024;

/// Round `x` up to the next power of two.
///
/// Powers of two map to themselves, so the function is idempotent. Zero maps
/// to zero.
///
/// ```
/// use gebug_link::flashcart::pad_size;
///
/// assert_eq!(pad_size(1000), 1024);
/// assert_eq!(pad_size(1024), 1024);
/// ```
pub fn pad_size(x: u32) -> u32 {
    let mut v = x.wrapping_sub(1);
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v.wrapping_add(1)
}

/// A ROM image padded and split for upload.
#[derive(Debug, Clone)]
pub struct RomUpload {
    image: Bytes,
    address: u32,
}

impl RomUpload {
    /// Pad `rom` to its upload size.
    ///
    /// # Errors
    ///
    /// Empty images and images larger than 2 GiB are rejected.
    pub fn new(rom: &[u8], address: u32) -> Result<Self> {
        if rom.is_empty() {
            return Err(LinkError::InvalidRom("image is empty".to_string()));
        }
        let len = u32::try_from(rom.len())
            .ok()
            .filter(|&l| l <= 1 << 31)
            .ok_or_else(|| LinkError::InvalidRom(format!("image of {} bytes is too large", rom.len())))?;

        let padded = (pad_size(len) as usize).max(ROM_UNIT_SIZE);
        let mut image = Vec::with_capacity(padded);
        image.extend_from_slice(rom);
        image.resize(padded, 0);

        Ok(Self {
            image: Bytes::from(image),
            address,
        })
    }

    /// Padded image size in bytes.
    #[inline]
    pub fn padded_size(&self) -> usize {
        self.image.len()
    }

    /// The `cmdW` command announcing this upload.
    pub fn write_command(&self) -> FlashcartCommand {
        FlashcartCommand::write_rom(self.address, self.image.len() as u32)
    }

    /// Payload writes in order (zero-copy slices of the padded image).
    pub fn chunks(&self) -> impl Iterator<Item = Bytes> + '_ {
        (0..self.image.len())
            .step_by(ROM_WRITE_CHUNK)
            .map(move |start| {
                let end = (start + ROM_WRITE_CHUNK).min(self.image.len());
                self.image.slice(start..end)
            })
    }

    /// Number of payload writes.
    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(ROM_WRITE_CHUNK)
    }

    /// Integer percent complete after `written` bytes.
    pub fn percent(&self, written: usize) -> u8 {
        ((written.min(self.image.len()) * 100) / self.image.len()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_size_smallest_power_of_two() {
        for x in 1u32..=(1 << 20) {
            let p = pad_size(x);
            assert!(p.is_power_of_two(), "{x} -> {p}");
            assert!(p >= x);
            assert!(p / 2 < x, "{x} -> {p} is not the smallest");
        }
    }

    #[test]
    fn test_pad_size_idempotent() {
        for x in [1u32, 2, 3, 511, 512, 513, 65_535, 1 << 20, (1 << 20) + 1, 1 << 31] {
            assert_eq!(pad_size(pad_size(x)), pad_size(x));
        }
    }

    #[test]
    fn test_pad_size_zero() {
        assert_eq!(pad_size(0), 0);
    }

    #[test]
    fn test_upload_padding_and_command() {
        let upload = RomUpload::new(&[0xAA; 70_000], 0x1000_0000).unwrap();
        assert_eq!(upload.padded_size(), 131_072);

        let cmd = upload.write_command();
        assert_eq!(cmd.address(), 0x1000_0000);
        assert_eq!(cmd.chunk_count(), 256);
    }

    #[test]
    fn test_small_image_padded_to_one_unit() {
        let upload = RomUpload::new(&[1, 2, 3], 0).unwrap();
        assert_eq!(upload.padded_size(), ROM_UNIT_SIZE);
        assert_eq!(upload.write_command().chunk_count(), 1);
    }

    #[test]
    fn test_chunks_cover_image() {
        let upload = RomUpload::new(&[0x55; 100_000], 0).unwrap();
        let chunks: Vec<Bytes> = upload.chunks().collect();

        assert_eq!(chunks.len(), upload.chunk_count());
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= ROM_WRITE_CHUNK));
        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), 131_072);
        assert_eq!(chunks[0][0], 0x55);
        assert_eq!(chunks[3][chunks[3].len() - 1], 0);
    }

    #[test]
    fn test_percent() {
        let upload = RomUpload::new(&[0; 1024], 0).unwrap();
        assert_eq!(upload.percent(0), 0);
        assert_eq!(upload.percent(512), 50);
        assert_eq!(upload.percent(1024), 100);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(RomUpload::new(&[], 0), Err(LinkError::InvalidRom(_))));
    }
}
