//! Payload codecs for the durable attachment blob
//!
//! Every codec except `none` carries its own checksum (gzip CRC32, bzip2
//! block CRC, xz CRC64, zstd frame checksum), so a corrupted blob fails to
//! decode instead of yielding garbage. Encoders are configured to omit
//! timestamps so identical input produces identical output.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AttachmentError, Result};

/// zstd level, a good balance of speed vs ratio
const ZSTD_LEVEL: i32 = 3;

/// xz preset
const XZ_PRESET: u32 = 6;

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bz2,
    Lzma,
    #[default]
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Gzip,
        Compression::Bz2,
        Compression::Lzma,
        Compression::Zstd,
    ];

    /// Canonical lowercase name, as stored in the database
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bz2 => "bz2",
            Compression::Lzma => "lzma",
            Compression::Zstd => "zstd",
        }
    }

    /// Resolve an optional codec name.
    ///
    /// `None` selects `default`; an empty or unknown name is a validation error.
    pub fn select(name: Option<&str>, default: Compression) -> Result<Self> {
        match name {
            None => Ok(default),
            Some(name) => name.parse(),
        }
    }

    /// Compress a complete payload
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let encoded = match self {
            Compression::None => data.to_vec(),
            Compression::Gzip => {
                let mut encoder = flate2::GzBuilder::new()
                    .mtime(0)
                    .write(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Bz2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Lzma => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), XZ_PRESET);
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
                encoder.include_checksum(true)?;
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };
        Ok(encoded)
    }

    /// Wrap `reader` in a streaming decoder for this codec
    pub fn decoder<'a, R>(&self, reader: R) -> Result<Box<dyn Read + Send + 'a>>
    where
        R: Read + Send + 'a,
    {
        let decoder: Box<dyn Read + Send + 'a> = match self {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Compression::Bz2 => Box::new(bzip2::read::BzDecoder::new(reader)),
            Compression::Lzma => Box::new(xz2::read::XzDecoder::new(reader)),
            Compression::Zstd => Box::new(
                zstd::stream::read::Decoder::new(reader).map_err(|e| self.decode_error(e))?,
            ),
        };
        Ok(decoder)
    }

    /// Decompress a complete payload.
    ///
    /// `size_hint` pre-sizes the output buffer when the original length is
    /// known. It comes from stored metadata, so the preallocation is capped
    /// relative to the input and the buffer grows as needed past that.
    pub fn decode(&self, data: &[u8], size_hint: Option<u64>) -> Result<Vec<u8>> {
        if *self == Compression::None {
            return Ok(data.to_vec());
        }
        let limit = data.len().saturating_mul(4).saturating_add(1024);
        let capacity = size_hint.map_or(data.len().saturating_mul(2), |n| {
            usize::try_from(n).unwrap_or(usize::MAX).min(limit)
        });
        let mut decoded = Vec::with_capacity(capacity);
        self.decoder(data)?
            .read_to_end(&mut decoded)
            .map_err(|e| self.decode_error(e))?;
        Ok(decoded)
    }

    fn decode_error(&self, err: io::Error) -> AttachmentError {
        AttachmentError::integrity(format!("{} decode failed: {}", self.name(), err))
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = AttachmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" => Err(AttachmentError::invalid("compression name is empty")),
            "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            "lzma" | "xz" => Ok(Compression::Lzma),
            "zstd" | "zst" => Ok(Compression::Zstd),
            _ => Err(AttachmentError::invalid(format!(
                "unknown compression algorithm {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"x".to_vec(),
            b"Hello from the test framework".to_vec(),
            "Hello, world! ".repeat(1000).into_bytes(),
            (0..=255u8).cycle().take(10_000).collect(),
        ]
    }

    #[test]
    fn test_round_trip_all_codecs() {
        for compression in Compression::ALL {
            for payload in sample_payloads() {
                let encoded = compression.encode(&payload).unwrap();
                let decoded = compression
                    .decode(&encoded, Some(payload.len() as u64))
                    .unwrap();
                assert_eq!(decoded, payload, "{compression} round trip");
            }
        }
    }

    #[test]
    fn test_compressible_data_shrinks() {
        let data = "Hello, world! ".repeat(1000);
        for compression in [
            Compression::Gzip,
            Compression::Bz2,
            Compression::Lzma,
            Compression::Zstd,
        ] {
            let encoded = compression.encode(data.as_bytes()).unwrap();
            assert!(
                encoded.len() < data.len(),
                "{} produced {} bytes from {}",
                compression,
                encoded.len(),
                data.len()
            );
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let data = b"the same bytes every time";
        for compression in Compression::ALL {
            assert_eq!(
                compression.encode(data).unwrap(),
                compression.encode(data).unwrap(),
                "{compression} output differs between runs"
            );
        }
    }

    #[test]
    fn test_corrupt_payload_is_integrity_error() {
        let data = "Hello, world! ".repeat(100);
        for compression in [
            Compression::Gzip,
            Compression::Bz2,
            Compression::Lzma,
            Compression::Zstd,
        ] {
            let mut encoded = compression.encode(data.as_bytes()).unwrap();
            let middle = encoded.len() / 2;
            encoded[middle] ^= 0xff;
            encoded.truncate(encoded.len() - 4);
            let err = compression.decode(&encoded, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Integrity, "{compression}");
        }
    }

    #[test]
    fn test_mismatched_codec_fails() {
        let encoded = Compression::Gzip.encode(b"gzip payload").unwrap();
        for compression in [Compression::Bz2, Compression::Lzma, Compression::Zstd] {
            assert!(compression.decode(&encoded, None).is_err(), "{compression}");
        }
    }

    #[test]
    fn test_size_hint_is_only_a_hint() {
        let data = "Hello, world! ".repeat(1000);
        for compression in Compression::ALL {
            let encoded = compression.encode(data.as_bytes()).unwrap();
            for hint in [0, 3, u64::MAX] {
                let decoded = compression.decode(&encoded, Some(hint)).unwrap();
                assert_eq!(decoded, data.as_bytes(), "{compression} with hint {hint}");
            }
        }
    }

    #[test]
    fn test_streaming_decoder() {
        let data = "stream me ".repeat(500);
        let encoded = Compression::Lzma.encode(data.as_bytes()).unwrap();
        let mut out = String::new();
        Compression::Lzma
            .decoder(encoded.as_slice())
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_parse_names() {
        for compression in Compression::ALL {
            assert_eq!(compression.name().parse::<Compression>().unwrap(), compression);
        }
        assert_eq!("XZ".parse::<Compression>().unwrap(), Compression::Lzma);
        assert_eq!(
            "".parse::<Compression>().unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            "brotli".parse::<Compression>().unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_select_default() {
        assert_eq!(
            Compression::select(None, Compression::Bz2).unwrap(),
            Compression::Bz2
        );
        assert_eq!(
            Compression::select(Some("gzip"), Compression::Bz2).unwrap(),
            Compression::Gzip
        );
    }
}
