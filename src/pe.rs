//! # PE Header Patcher
//!
//! Sets bits in the `DllCharacteristics` field of a PE optional header in place.
//! The linker shipped with Visual C++ 2005 has no switch for ASLR or high-entropy
//! VA, so the bits are OR-ed into the finished executable instead.
//!
//! Layout used (all little-endian):
//!
//! ```text
//! 0x3C                    u32  e_lfanew: file offset of the "PE\0\0" signature
//! e_lfanew + 20           u16  SizeOfOptionalHeader (inside IMAGE_FILE_HEADER)
//! e_lfanew + 24           ...  optional header starts here
//! e_lfanew + 24 + 70      u16  DllCharacteristics
//! ```
//!
//! Only the two `DllCharacteristics` bytes are ever written.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use crate::error::{BuildError, BuildResult};
use crate::system::shared_open_options;

/// Offset of `e_lfanew` in the DOS header.
pub const PE_POINTER_OFFSET: u64 = 0x3C;
/// Signature (4 bytes) plus IMAGE_FILE_HEADER (20 bytes).
pub const PE_HEADER_SIZE: u64 = 24;
/// Offset of `SizeOfOptionalHeader`, relative to the signature.
pub const OPTIONAL_HEADER_SIZE_OFFSET: u64 = 20;
/// Offset of `DllCharacteristics` within the optional header.
pub const DLL_CHARACTERISTICS_OFFSET: u16 = 70;

pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x0020;
pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;

/// Header locations read from one file. Recomputed on every patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeOffsets {
    pub pe_header: u32,
    pub optional_header_size: u16,
}

impl PeOffsets {
    pub fn read<F: Read + Seek>(file: &mut F) -> std::io::Result<Self> {
        file.seek(SeekFrom::Start(PE_POINTER_OFFSET))?;
        let pe_header = file.read_u32::<LittleEndian>()?;

        file.seek(SeekFrom::Start(pe_header as u64 + OPTIONAL_HEADER_SIZE_OFFSET))?;
        let optional_header_size = file.read_u16::<LittleEndian>()?;

        Ok(Self {
            pe_header,
            optional_header_size,
        })
    }

    /// Older optional headers end before `DllCharacteristics`.
    pub fn has_dll_characteristics(&self) -> bool {
        self.optional_header_size >= DLL_CHARACTERISTICS_OFFSET + 2
    }

    pub fn dll_characteristics(&self) -> u64 {
        self.pe_header as u64 + PE_HEADER_SIZE + DLL_CHARACTERISTICS_OFFSET as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched { before: u16, after: u16 },
    /// The optional header is too short to hold the field; nothing was written.
    Skipped { optional_header_size: u16 },
}

/// ORs `bits` into the `DllCharacteristics` field of the executable at `path`.
pub fn add_dll_characteristics(path: &Path, bits: u16) -> BuildResult<PatchOutcome> {
    let mut file = shared_open_options()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BuildError::io(path, e))?;

    let outcome = patch_dll_characteristics(&mut file, bits).map_err(|e| BuildError::io(path, e))?;
    match outcome {
        PatchOutcome::Patched { before, after } => {
            info!("Patched {:?}: DllCharacteristics 0x{:04X} -> 0x{:04X}", path, before, after)
        }
        PatchOutcome::Skipped { optional_header_size } => info!(
            "Skipped {:?}: optional header is only {} bytes",
            path, optional_header_size
        ),
    }
    Ok(outcome)
}

/// Same as [`add_dll_characteristics`], on any seekable stream.
pub fn patch_dll_characteristics<F: Read + Write + Seek>(file: &mut F, bits: u16) -> std::io::Result<PatchOutcome> {
    let offsets = PeOffsets::read(file)?;
    if !offsets.has_dll_characteristics() {
        return Ok(PatchOutcome::Skipped {
            optional_header_size: offsets.optional_header_size,
        });
    }

    let field = offsets.dll_characteristics();
    file.seek(SeekFrom::Start(field))?;
    let before = file.read_u16::<LittleEndian>()?;
    let after = before | bits;

    file.seek(SeekFrom::Start(field))?;
    file.write_u16::<LittleEndian>(after)?;
    file.flush()?;

    Ok(PatchOutcome::Patched { before, after })
}

/// Builders for small synthetic images.
#[cfg(test)]
pub(crate) mod fixtures {
    /// A zero-filled image with `e_lfanew`, the PE signature and
    /// `SizeOfOptionalHeader` set, large enough to hold the declared header.
    pub fn minimal_image(pe_header: u32, optional_header_size: u16) -> Vec<u8> {
        let start = pe_header as usize;
        let len = (start + 24 + optional_header_size as usize).max(start + 24 + 72);
        let mut image = vec![0u8; len];
        image[0..2].copy_from_slice(b"MZ");
        image[0x3C..0x40].copy_from_slice(&pe_header.to_le_bytes());
        image[start..start + 4].copy_from_slice(b"PE\0\0");
        image[start + 20..start + 22].copy_from_slice(&optional_header_size.to_le_bytes());
        image
    }

    pub fn dll_characteristics_at(image: &[u8], pe_header: u32) -> [u8; 2] {
        let field = pe_header as usize + 24 + 70;
        [image[field], image[field + 1]]
    }
}
