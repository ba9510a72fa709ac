//! Content sniffing for blobs whose type is not declared.
//!
//! Everything here works on a buffered prefix so the underlying stream is
//! never rewound: the caller reads up to [`SNIFF_LEN`] bytes, asks
//! [`sniff`] what they look like, and then rebuilds the full stream with
//! [`replay`].

use std::io::{self, Cursor, Read};

use flate2::read::MultiGzDecoder;

/// Bytes buffered before classifying a blob. Two tar blocks, so both a
/// header and an empty-archive marker fit.
pub const SNIFF_LEN: usize = 1024;

const TAR_BLOCK: usize = 512;
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// What a blob prefix looks like, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Tar,
    Gzip,
    Zstd,
    Json,
    Unknown,
}

impl Format {
    /// The decompressor to put in front of a tar reader, if this is a layer.
    pub fn layer_compression(self) -> Option<Compression> {
        match self {
            Format::Tar => Some(Compression::None),
            Format::Gzip => Some(Compression::Gzip),
            Format::Zstd => Some(Compression::Zstd),
            Format::Json | Format::Unknown => None,
        }
    }
}

/// Classify a buffered prefix: tar, then gzip, then zstd, then JSON.
pub fn sniff(prefix: &[u8]) -> Format {
    if is_tar(prefix) {
        Format::Tar
    } else if prefix.starts_with(&GZIP_MAGIC) {
        Format::Gzip
    } else if prefix.starts_with(&ZSTD_MAGIC) {
        Format::Zstd
    } else if is_json_start(prefix) {
        Format::Json
    } else {
        Format::Unknown
    }
}

fn is_tar(prefix: &[u8]) -> bool {
    let Some(block) = prefix.get(..TAR_BLOCK) else {
        return false;
    };
    // An empty layer is nothing but the end-of-archive marker.
    if block.iter().all(|&b| b == 0) {
        return true;
    }

    let Some(expected) = parse_octal(&block[148..156]) else {
        return false;
    };
    let actual: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' as u64 } else { b as u64 })
        .sum();
    actual == expected
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(field).ok()?;
    let s = s.trim_matches(|c: char| c == '\0' || c == ' ');
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 8).ok()
}

fn is_json_start(prefix: &[u8]) -> bool {
    matches!(
        prefix.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{' | b'[')
    )
}

/// Layer compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Map an OCI or Docker layer media type to its codec by suffix.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        if media_type.ends_with(".tar") {
            Some(Compression::None)
        } else if media_type.ends_with(".tar+gzip") || media_type.ends_with(".tar.gzip") {
            Some(Compression::Gzip)
        } else if media_type.ends_with(".tar+zstd") || media_type.ends_with(".tar.zstd") {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    /// Map a legacy archive entry name to its codec by suffix.
    pub fn from_entry_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar") {
            Some(Compression::None)
        } else if name.ends_with(".tar.gz") || name.ends_with("tgz") {
            Some(Compression::Gzip)
        } else {
            None
        }
    }

    /// Wrap `reader` in the matching decompressor.
    pub fn decoder<'a, R>(self, reader: R) -> io::Result<Box<dyn Read + 'a>>
    where
        R: Read + 'a,
    {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

/// Read up to `len` bytes, stopping early only at end of stream.
pub fn read_prefix<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Rebuild the original stream from a consumed prefix and the remainder.
pub fn replay<R: Read>(prefix: Vec<u8>, rest: R) -> io::Chain<Cursor<Vec<u8>>, R> {
    Cursor::new(prefix).chain(rest)
}
