//! Binary image representation and serialization.
//!
//! An image is what the assembler writes and the interpreter loads:
//!
//! ```text
//! [ code_start: u32 LE ][ body ... ]
//! ```
//!
//! The body is placed at address 0 of the machine's memory, so every offset
//! inside it (labels, jump targets, data addresses) is an absolute address.
//! Bytes before `code_start` are data; execution begins at `code_start`.

use crate::virtual_machine::errors::ImageError;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Size of the serialized header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Assembled program: entry offset plus the data-then-code body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Offset inside `body` where execution starts.
    pub code_start: u32,
    /// Raw data and instruction bytes.
    pub body: Vec<u8>,
}

impl Image {
    pub fn new(code_start: u32, body: Vec<u8>) -> Self {
        Self { code_start, body }
    }

    /// Serializes the image to its on-disk format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.code_start.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Deserializes an image, rejecting a short header or an entry point
    /// outside the body.
    pub fn from_bytes(input: &[u8]) -> Result<Self, ImageError> {
        let Some((header, body)) = input.split_first_chunk::<HEADER_SIZE>() else {
            return Err(ImageError::Truncated { len: input.len() });
        };
        let code_start = u32::from_le_bytes(*header);
        if code_start as usize > body.len() {
            return Err(ImageError::CodeStartOutOfRange {
                code_start,
                body_len: body.len(),
            });
        }
        Ok(Self::new(code_start, body.to_vec()))
    }

    /// Writes the serialized image to `path`.
    ///
    /// The bytes go to a temporary file in the same directory which is then
    /// renamed over `path`, so a failed write never leaves a partial image.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&self.to_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Bytes before the entry point.
    pub fn data(&self) -> &[u8] {
        &self.body[..self.split()]
    }

    /// Bytes from the entry point to the end of the body.
    pub fn code(&self) -> &[u8] {
        &self.body[self.split()..]
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn split(&self) -> usize {
        (self.code_start as usize).min(self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian() {
        let image = Image::new(0x0102, vec![0xAA; 0x0102]);
        let bytes = image.to_bytes();
        assert_eq!(&bytes[..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(bytes.len(), 4 + 0x0102);
        assert_eq!(Image::from_bytes(&bytes).unwrap(), image);
    }

    #[test]
    fn rejects_short_header() {
        for len in 0..HEADER_SIZE {
            let bytes = vec![0u8; len];
            assert_eq!(
                Image::from_bytes(&bytes),
                Err(ImageError::Truncated { len })
            );
        }
    }

    #[test]
    fn rejects_entry_past_body() {
        let bytes = [5, 0, 0, 0, 1, 2, 3];
        assert_eq!(
            Image::from_bytes(&bytes),
            Err(ImageError::CodeStartOutOfRange {
                code_start: 5,
                body_len: 3
            })
        );
    }

    #[test]
    fn entry_at_end_of_body_is_valid() {
        let image = Image::from_bytes(&[2, 0, 0, 0, 7, 8]).unwrap();
        assert_eq!(image.data(), &[7, 8]);
        assert!(image.code().is_empty());
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, vec![0xEE; 64]).unwrap();

        let image = Image::new(1, vec![9, 1, 1]);
        image.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 0, 0, 0, 9, 1, 1]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_save_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.bin");
        assert!(Image::new(0, vec![0]).save(&path).is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn splits_data_and_code() {
        let image = Image::new(3, vec![1, 2, 3, 0, 0x12]);
        assert_eq!(image.data(), &[1, 2, 3]);
        assert_eq!(image.code(), &[0, 0x12]);
        assert_eq!(image.len(), 5);
        assert!(!image.is_empty());
    }
}
