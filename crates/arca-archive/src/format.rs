//! Archive format versions

use std::io::{Read, Write};

use arca_core::{ArcaError, ArcaResult, WireRead, WireWrite};
use arca_crypto::FileFormat;

/// First bytes of every decrypted recipient header.
pub const MAGIC: [u8; 8] = [0x6e, 0x6f, 0x63, 0x61, 0x01, 0x02, 0xab, 0xac];

/// Size of one recipient slot. Holds the RSA ciphertext of keys up to 4096 bits.
pub const SLOT_SIZE: usize = 512;

/// Upper bound of an RSA signature accepted by readers.
pub const SIG_SIZE: usize = 512;

/// Slots tried by a reader, and therefore the most recipients one archive
/// can carry.
pub const MAX_RECIPIENT_SLOTS: usize = 8;

const ITERATIONS: u32 = 1024;

/// Archive layout version. Each version pins its content cipher suite and the
/// encoding of the padding-size fields in the recipient header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// AES-CBC content, padding sizes as three u8
    V10,
    /// AES-GCM content, padding sizes as u16 BE, u8, u8
    V11,
}

impl ArchiveFormat {
    pub fn latest() -> Self {
        ArchiveFormat::V11
    }

    pub fn from_version(version: u8) -> ArcaResult<Self> {
        match version {
            10 => Ok(ArchiveFormat::V10),
            11 => Ok(ArchiveFormat::V11),
            _ => Err(ArcaError::Format),
        }
    }

    pub fn version(self) -> u8 {
        match self {
            ArchiveFormat::V10 => 10,
            ArchiveFormat::V11 => 11,
        }
    }

    pub fn file_format(self) -> FileFormat {
        match self {
            ArchiveFormat::V10 => FileFormat::V10,
            ArchiveFormat::V11 => FileFormat::V11,
        }
    }

    pub fn iterations(self) -> u32 {
        ITERATIONS
    }

    /// Largest padding1 the header can describe.
    pub fn padding1_max(self) -> usize {
        match self {
            ArchiveFormat::V10 => u8::MAX as usize,
            ArchiveFormat::V11 => 0x7fff,
        }
    }

    pub fn write_paddings<W: Write + ?Sized>(
        self,
        out: &mut W,
        sizes: PaddingSizes,
    ) -> ArcaResult<()> {
        let narrow = |v: usize| {
            u8::try_from(v)
                .map_err(|_| ArcaError::InvalidArgument(format!("padding size {v} too large")))
        };
        match self {
            ArchiveFormat::V10 => out.write_u8(narrow(sizes.padding1)?)?,
            ArchiveFormat::V11 => {
                if sizes.padding1 > self.padding1_max() {
                    return Err(ArcaError::InvalidArgument(format!(
                        "padding size {} too large",
                        sizes.padding1
                    )));
                }
                out.write_u16_be(sizes.padding1 as u16)?
            }
        }
        out.write_u8(narrow(sizes.padding2)?)?;
        out.write_u8(narrow(sizes.padding3)?)
    }

    pub fn read_paddings<R: Read + ?Sized>(self, input: &mut R) -> ArcaResult<PaddingSizes> {
        let padding1 = match self {
            ArchiveFormat::V10 => input.read_u8()? as usize,
            ArchiveFormat::V11 => input.read_u16_be()? as usize,
        };
        if padding1 > self.padding1_max() {
            return Err(ArcaError::Format);
        }
        Ok(PaddingSizes {
            padding1,
            padding2: input.read_u8()? as usize,
            padding3: input.read_u8()? as usize,
        })
    }
}

/// Random gaps around the signed prefix and after the content stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingSizes {
    /// Between the recipient slots and the signed prefix
    pub padding1: usize,
    /// Between the signed prefix and the first block IV
    pub padding2: usize,
    /// After the last content block
    pub padding3: usize,
}

impl PaddingSizes {
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self {
            padding1: rng.gen_range(96..160),
            padding2: rng.gen_range(0..128),
            padding3: rng.gen_range(0..128),
        }
    }
}
