//! Binary format definitions for N-body snapshot files (`.nbsf`).

use std::borrow::Cow;
use std::io::{self, Read, Write};

use super::{ComponentIndices, ComponentRange, Snapshot, SourceError};

/// Magic bytes identifying an N-body snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"NBSF";

/// Current format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Compression applied to each stored frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    /// LZ4 block with the raw size prepended. Without the `lz4` feature
    /// records are stored raw and the flag is only carried through.
    Lz4,
}

impl CompressionType {
    const MASK: u16 = 0x0F;
    const LZ4_CODE: u16 = 1;

    /// Turn an encoded record into its stored form.
    pub fn pack(self, raw: Vec<u8>) -> Vec<u8> {
        match self {
            Self::None => raw,
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::compress_prepend_size(&raw),
            #[cfg(not(feature = "lz4"))]
            Self::Lz4 => raw,
        }
    }

    /// Recover the encoded record from its stored form.
    pub fn unpack(self, stored: &[u8]) -> Result<Cow<'_, [u8]>, SourceError> {
        match self {
            Self::None => Ok(Cow::Borrowed(stored)),
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(stored)
                .map(Cow::Owned)
                .map_err(|e| SourceError::Format(format!("lz4: {}", e))),
            #[cfg(not(feature = "lz4"))]
            Self::Lz4 => Ok(Cow::Borrowed(stored)),
        }
    }
}

/// Header flag word: compression in the low nibble, velocity bit 4.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    pub compression: CompressionType,
    /// Every frame record carries a velocity array.
    pub has_velocities: bool,
}

impl FileFlags {
    const VELOCITY_BIT: u16 = 1 << 4;

    pub fn to_u16(self) -> u16 {
        let compression = match self.compression {
            CompressionType::None => 0,
            CompressionType::Lz4 => CompressionType::LZ4_CODE,
        };
        let velocity = if self.has_velocities {
            Self::VELOCITY_BIT
        } else {
            0
        };
        compression | velocity
    }

    /// Unknown compression codes decode as uncompressed.
    pub fn from_u16(word: u16) -> Self {
        let compression = if word & CompressionType::MASK == CompressionType::LZ4_CODE {
            CompressionType::Lz4
        } else {
            CompressionType::None
        };
        Self {
            compression,
            has_velocities: word & Self::VELOCITY_BIT != 0,
        }
    }
}

/// File header for the snapshot container.
///
/// Live streams send the same header on connect; their `frame_count` is
/// meaningless and written as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Total number of frames.
    pub frame_count: u64,
    /// File flags.
    pub flags: FileFlags,
}

impl FileHeader {
    /// Encoded size: magic 4, version 2, flags 2, frame count 8, reserved 16.
    pub const SIZE: usize = 32;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(SNAPSHOT_MAGIC);
        out[4..6].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_u16().to_le_bytes());
        out[8..16].copy_from_slice(&self.frame_count.to_le_bytes());
        out
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    /// Read and check a header. Wrong magic or version is `InvalidData`.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; Self::SIZE];
        r.read_exact(&mut raw)?;

        if &raw[0..4] != SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not an NBSF snapshot container",
            ));
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("NBSF version {} is not supported", version),
            ));
        }

        let mut count = [0u8; 8];
        count.copy_from_slice(&raw[8..16]);
        Ok(Self {
            frame_count: u64::from_le_bytes(count),
            flags: FileFlags::from_u16(u16::from_le_bytes([raw[6], raw[7]])),
        })
    }
}

/// Location of one frame record within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIndex {
    pub offset: u64,
    /// Stored (possibly compressed) size in bytes.
    pub size: u64,
}

impl FrameIndex {
    pub const SIZE: usize = 16;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut raw = [0u8; Self::SIZE];
        raw[..8].copy_from_slice(&self.offset.to_le_bytes());
        raw[8..].copy_from_slice(&self.size.to_le_bytes());
        w.write_all(&raw)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; Self::SIZE];
        r.read_exact(&mut raw)?;
        let (offset, size) = raw.split_at(8);
        let word = |b: &[u8]| {
            let mut w = [0u8; 8];
            w.copy_from_slice(b);
            u64::from_le_bytes(w)
        };
        Ok(Self {
            offset: word(offset),
            size: word(size),
        })
    }
}

const KIND_CONTIGUOUS: u8 = 0;
const KIND_EXPLICIT: u8 = 1;

/// Encode one snapshot into a frame record.
///
/// Velocities are written only when `with_velocities` is set; a snapshot
/// without velocities gets a zero-filled array so every record in a file
/// has the same layout.
pub fn encode_frame(snapshot: &Snapshot, with_velocities: bool) -> Vec<u8> {
    let n = snapshot.particle_count;
    let mut bytes = Vec::with_capacity(20 + n * 12 * if with_velocities { 2 } else { 1 });

    bytes.extend_from_slice(&snapshot.time.to_le_bytes());
    bytes.extend_from_slice(&(n as u64).to_le_bytes());
    bytes.extend_from_slice(&(snapshot.components.len() as u32).to_le_bytes());

    for component in &snapshot.components {
        let name = component.name.as_bytes();
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(name);
        match &component.indices {
            ComponentIndices::Contiguous { start, len } => {
                bytes.push(KIND_CONTIGUOUS);
                bytes.extend_from_slice(&(*start as u64).to_le_bytes());
                bytes.extend_from_slice(&(*len as u64).to_le_bytes());
            }
            ComponentIndices::Explicit(indices) => {
                bytes.push(KIND_EXPLICIT);
                bytes.extend_from_slice(&(indices.len() as u64).to_le_bytes());
                for index in indices {
                    bytes.extend_from_slice(&index.to_le_bytes());
                }
            }
        }
    }

    encode_f32s(&snapshot.positions, &mut bytes);
    if with_velocities {
        match &snapshot.velocities {
            Some(velocities) => encode_f32s(velocities, &mut bytes),
            None => bytes.resize(bytes.len() + n * 3 * 4, 0),
        }
    }

    bytes
}

/// Decode a frame record into a snapshot.
pub fn decode_frame(bytes: &[u8], has_velocities: bool) -> Result<Snapshot, SourceError> {
    let mut reader = RecordReader { bytes, pos: 0 };

    let time = reader.f64()?;
    let particle_count = usize::try_from(reader.u64()?)
        .map_err(|_| SourceError::Format("particle count overflows usize".into()))?;
    let component_count = reader.u32()? as usize;

    let mut components = Vec::with_capacity(component_count.min(1024));
    for _ in 0..component_count {
        let name_len = reader.u16()? as usize;
        let name = String::from_utf8(reader.take(name_len)?.to_vec())
            .map_err(|_| SourceError::Format("component name is not UTF-8".into()))?;
        let indices = match reader.u8()? {
            KIND_CONTIGUOUS => {
                let start = usize::try_from(reader.u64()?).ok();
                let len = usize::try_from(reader.u64()?).ok();
                match start.zip(len) {
                    Some((start, len)) if start.checked_add(len).is_some() => {
                        ComponentIndices::Contiguous { start, len }
                    }
                    _ => {
                        return Err(SourceError::Format(format!(
                            "component '{}' range overflows",
                            name
                        )));
                    }
                }
            }
            KIND_EXPLICIT => {
                let count = reader.u64()? as usize;
                let raw = reader.take(count.checked_mul(4).ok_or_else(truncated)?)?;
                ComponentIndices::Explicit(
                    raw.chunks_exact(4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                )
            }
            other => {
                return Err(SourceError::Format(format!(
                    "unknown component kind {} for '{}'",
                    other, name
                )));
            }
        };
        components.push(ComponentRange { name, indices });
    }

    let floats = particle_count.checked_mul(3).ok_or_else(truncated)?;
    let positions = reader.f32s(floats)?;
    let velocities = if has_velocities {
        Some(reader.f32s(floats)?)
    } else {
        None
    };

    if reader.pos != bytes.len() {
        return Err(SourceError::Format(format!(
            "frame record has {} trailing bytes",
            bytes.len() - reader.pos
        )));
    }

    Ok(Snapshot {
        time,
        particle_count,
        positions,
        velocities,
        components,
    })
}

fn encode_f32s(data: &[f32], out: &mut Vec<u8>) {
    for &v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn truncated() -> SourceError {
    SourceError::Format("truncated frame record".into())
}

/// Bounds-checked little-endian cursor over a frame record.
struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SourceError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SourceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SourceError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, SourceError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, SourceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, SourceError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, SourceError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn f32s(&mut self, count: usize) -> Result<Vec<f32>, SourceError> {
        let raw = self.take(count.checked_mul(4).ok_or_else(truncated)?)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}
