use crate::virtual_machine::errors::{Fault, ImageError};
use crate::virtual_machine::isa::Width;

/// Default arena size in bytes.
pub const DEFAULT_MEMORY_SIZE: usize = 65536;

/// Flat byte-addressed memory arena.
///
/// Memory layout: `[image body][stack ->        ]`
/// - **Image**: data and code loaded at address 0.
/// - **Stack**: starts right after the image and grows toward the end.
///
/// Every access is bounds-checked against the arena size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    /// Allocates a zeroed arena of `size` bytes.
    pub fn new(size: usize) -> Result<Self, ImageError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| ImageError::OutOfMemory(size))?;
        bytes.resize(size, 0);
        Ok(Self { bytes })
    }

    /// Copies `body` to address 0.
    pub fn load(&mut self, body: &[u8]) -> Result<(), ImageError> {
        let capacity = self.bytes.len();
        self.bytes
            .get_mut(..body.len())
            .ok_or(ImageError::TooLarge {
                body_len: body.len(),
                capacity,
            })?
            .copy_from_slice(body);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns `len` bytes starting at `address`.
    pub fn slice(&self, address: u32, len: usize) -> Result<&[u8], Fault> {
        let capacity = self.bytes.len();
        (address as usize)
            .checked_add(len)
            .and_then(|end| self.bytes.get(address as usize..end))
            .ok_or(Fault::MemoryOutOfBounds {
                address,
                size: len,
                capacity,
            })
    }

    /// Returns `len` writable bytes starting at `address`.
    pub fn slice_mut(&mut self, address: u32, len: usize) -> Result<&mut [u8], Fault> {
        let capacity = self.bytes.len();
        (address as usize)
            .checked_add(len)
            .and_then(|end| self.bytes.get_mut(address as usize..end))
            .ok_or(Fault::MemoryOutOfBounds {
                address,
                size: len,
                capacity,
            })
    }

    /// Reads a little-endian value of `width` at `address`.
    pub fn read(&self, address: u32, width: Width) -> Result<u32, Fault> {
        Ok(width.read_le(self.slice(address, width.size())?))
    }

    /// Writes the low bytes of `value` little-endian at `address`.
    pub fn write(&mut self, address: u32, width: Width, value: u32) -> Result<(), Fault> {
        width.write_le(value, self.slice_mut(address, width.size())?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_places_body_at_zero() {
        let mut memory = Memory::new(8).unwrap();
        memory.load(&[1, 2, 3]).unwrap();
        assert_eq!(memory.as_bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(
            memory.load(&[0; 9]),
            Err(ImageError::TooLarge {
                body_len: 9,
                capacity: 8
            })
        );
    }

    #[test]
    fn little_endian_access() {
        let mut memory = Memory::new(8).unwrap();
        memory.write(2, Width::Int, 0x0A0B_0C0D).unwrap();
        assert_eq!(&memory.as_bytes()[2..6], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(memory.read(2, Width::Short).unwrap(), 0x0C0D);
        assert_eq!(memory.read(5, Width::Byte).unwrap(), 0x0A);
    }

    #[test]
    fn accesses_are_bounds_checked() {
        let mut memory = Memory::new(4).unwrap();
        assert!(memory.read(0, Width::Int).is_ok());
        assert_eq!(
            memory.read(1, Width::Int),
            Err(Fault::MemoryOutOfBounds {
                address: 1,
                size: 4,
                capacity: 4
            })
        );
        assert!(memory.write(4, Width::Byte, 0).is_err());
        assert!(memory.slice(u32::MAX, 2).is_err());
        assert!(memory.slice(4, 0).unwrap().is_empty());
    }
}
