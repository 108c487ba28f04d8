// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segment container encoding and decoding
//!
//! A segment file is laid out as:
//!
//! ```text
//! CAMREC_SEGMENT|version=1|run_id=..|start=..|width=..|height=..|format=..|codec=..|compression=..\n
//! 0x01 | sequence u64 LE | timestamp_us i64 LE | payload_len u32 LE | payload   (repeated)
//! CAMREC_END|frames=N|end=..\n
//! ```
//!
//! Payloads are either JPEG images or raw pixels, the latter optionally
//! compressed with LZ4 or Zstd. A file without a trailer was not finalized.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::debug;

use crate::frame::{Frame, PixelFormat, RasterImage};
use crate::protocol::{CompressionLevel, CompressionType, FrameCodec};

pub const HEADER_MAGIC: &str = "CAMREC_SEGMENT";
pub const TRAILER_MAGIC: &str = "CAMREC_END";
pub const FORMAT_VERSION: u32 = 1;

const RECORD_TAG: u8 = 0x01;
const RECORD_FIXED_LEN: usize = 1 + 8 + 8 + 4;

/// Encode an image as JPEG
pub fn encode_jpeg(image: &RasterImage, quality: u8) -> Result<Vec<u8>> {
    let color = match image.format() {
        PixelFormat::Gray8 => ColorType::L8,
        PixelFormat::Rgb8 => ColorType::Rgb8,
    };
    let mut out = Vec::with_capacity(image.data().len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(image.data(), image.width(), image.height(), color)
        .context("JPEG encoding failed")?;
    Ok(out)
}

/// Serializes frames into the segment container format
#[derive(Debug, Clone)]
pub struct SegmentEncoder {
    codec: FrameCodec,
    jpeg_quality: u8,
    compression_type: CompressionType,
    compression_level: CompressionLevel,
}

impl SegmentEncoder {
    pub fn new(
        codec: FrameCodec,
        jpeg_quality: u8,
        compression_type: CompressionType,
        compression_level: CompressionLevel,
    ) -> Self {
        Self {
            codec,
            jpeg_quality,
            compression_type,
            compression_level,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Header line describing the segment, derived from its first frame
    pub fn header(&self, run_id: &str, start: DateTime<Utc>, first: &Frame) -> Vec<u8> {
        let compression = match self.codec {
            FrameCodec::Jpeg => CompressionType::None,
            FrameCodec::Raw => self.compression_type,
        };
        format!(
            "{}|version={}|run_id={}|start={}|width={}|height={}|format={}|codec={}|compression={}\n",
            HEADER_MAGIC,
            FORMAT_VERSION,
            run_id,
            start.to_rfc3339_opts(SecondsFormat::Micros, true),
            first.width(),
            first.height(),
            first.format(),
            self.codec.as_str(),
            compression.as_str()
        )
        .into_bytes()
    }

    /// Encode one frame as a length-prefixed record
    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = match self.codec {
            FrameCodec::Jpeg => encode_jpeg(frame.image(), self.jpeg_quality)?,
            FrameCodec::Raw => self.compress(frame.data())?,
        };

        if payload.len() > u32::MAX as usize {
            bail!("frame payload too large: {} bytes", payload.len());
        }

        let mut record = Vec::with_capacity(RECORD_FIXED_LEN + payload.len());
        record.push(RECORD_TAG);
        record.extend_from_slice(&frame.sequence().to_le_bytes());
        record.extend_from_slice(&frame.captured_at().timestamp_micros().to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);

        debug!(
            "Encoded frame {} ({} bytes raw -> {} bytes {})",
            frame.sequence(),
            frame.data().len(),
            payload.len(),
            self.codec.as_str()
        );

        Ok(record)
    }

    /// Trailer line that marks the segment as complete
    pub fn trailer(&self, frames: u64, end: DateTime<Utc>) -> Vec<u8> {
        format!(
            "{}|frames={}|end={}\n",
            TRAILER_MAGIC,
            frames,
            end.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
        .into_bytes()
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Lz4 => {
                let mut encoder = lz4::EncoderBuilder::new()
                    .level(self.compression_level.to_lz4_level())
                    .build(Vec::new())
                    .context("Failed to create LZ4 encoder")?;
                encoder
                    .write_all(data)
                    .context("Failed to write data to LZ4 encoder")?;
                let (compressed, result) = encoder.finish();
                result.context("LZ4 compression failed")?;
                Ok(compressed)
            }
            CompressionType::Zstd => zstd::encode_all(data, self.compression_level.to_zstd_level())
                .context("Zstd compression failed"),
        }
    }
}

/// Parsed segment header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    pub run_id: String,
    pub start: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub codec: FrameCodec,
    pub compression: CompressionType,
}

/// One frame record read back from a segment
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SegmentTrailer {
    pub frames: u64,
    pub end: DateTime<Utc>,
}

/// Fully decoded segment file
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    pub header: SegmentHeader,
    pub records: Vec<FrameRecord>,
    /// `None` when the file ends before a trailer (not finalized)
    pub trailer: Option<SegmentTrailer>,
}

impl DecodedSegment {
    /// Decode a segment from its bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .context("Segment header line missing")?;
        let header_line =
            std::str::from_utf8(&bytes[..newline]).context("Segment header is not UTF-8")?;
        let header = parse_header(header_line)?;

        let mut records = Vec::new();
        let mut trailer = None;
        let mut pos = newline + 1;

        while pos < bytes.len() {
            if bytes[pos] == RECORD_TAG {
                if bytes.len() - pos < RECORD_FIXED_LEN {
                    break;
                }
                let sequence = u64::from_le_bytes(read_array(&bytes[pos + 1..pos + 9]));
                let micros = i64::from_le_bytes(read_array(&bytes[pos + 9..pos + 17]));
                let len = u32::from_le_bytes(read_array(&bytes[pos + 17..pos + 21])) as usize;
                let start = pos + RECORD_FIXED_LEN;
                if bytes.len() - start < len {
                    break;
                }
                let timestamp = Utc
                    .timestamp_micros(micros)
                    .single()
                    .context("Invalid record timestamp")?;
                records.push(FrameRecord {
                    sequence,
                    timestamp,
                    payload: bytes[start..start + len].to_vec(),
                });
                pos = start + len;
            } else if bytes[pos..].starts_with(TRAILER_MAGIC.as_bytes()) {
                let line_end = bytes[pos..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|i| pos + i)
                    .unwrap_or(bytes.len());
                let line = std::str::from_utf8(&bytes[pos..line_end])
                    .context("Segment trailer is not UTF-8")?;
                trailer = Some(parse_trailer(line)?);
                break;
            } else {
                bail!("Unexpected byte 0x{:02x} at offset {}", bytes[pos], pos);
            }
        }

        Ok(Self {
            header,
            records,
            trailer,
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.trailer.is_some()
    }

    /// Recover raw pixels from a record of a raw-codec segment
    pub fn raw_pixels(&self, record: &FrameRecord) -> Result<Vec<u8>> {
        if self.header.codec != FrameCodec::Raw {
            bail!("segment codec is {}, not raw", self.header.codec.as_str());
        }
        match self.header.compression {
            CompressionType::None => Ok(record.payload.clone()),
            CompressionType::Lz4 => {
                let mut decoder =
                    lz4::Decoder::new(&record.payload[..]).context("Failed to create LZ4 decoder")?;
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .context("LZ4 decompression failed")?;
                Ok(out)
            }
            CompressionType::Zstd => {
                zstd::decode_all(&record.payload[..]).context("Zstd decompression failed")
            }
        }
    }
}

/// Parse the trailer from the tail of a segment file, if one is present
pub fn trailer_from_tail(tail: &[u8]) -> Option<SegmentTrailer> {
    let body = tail.strip_suffix(b"\n")?;
    let start = body
        .windows(TRAILER_MAGIC.len())
        .rposition(|w| w == TRAILER_MAGIC.as_bytes())?;
    let line = std::str::from_utf8(&body[start..]).ok()?;
    parse_trailer(line).ok()
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn fields(line: &str, magic: &str) -> Result<HashMap<String, String>> {
    let mut parts = line.split('|');
    if parts.next() != Some(magic) {
        bail!("Expected '{}' line, got '{}'", magic, line);
    }
    Ok(parts
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

fn field<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .with_context(|| format!("Missing '{}' field", key))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_header(line: &str) -> Result<SegmentHeader> {
    let map = fields(line, HEADER_MAGIC)?;
    let version: u32 = field(&map, "version")?.parse().context("Invalid version")?;
    if version != FORMAT_VERSION {
        bail!("Unsupported segment version {}", version);
    }
    let codec = match field(&map, "codec")? {
        "jpeg" => FrameCodec::Jpeg,
        "raw" => FrameCodec::Raw,
        other => bail!("Unknown codec '{}'", other),
    };
    let compression = match field(&map, "compression")? {
        "none" => CompressionType::None,
        "lz4" => CompressionType::Lz4,
        "zstd" => CompressionType::Zstd,
        other => bail!("Unknown compression '{}'", other),
    };
    Ok(SegmentHeader {
        run_id: field(&map, "run_id")?.to_string(),
        start: parse_time(field(&map, "start")?)?,
        width: field(&map, "width")?.parse().context("Invalid width")?,
        height: field(&map, "height")?.parse().context("Invalid height")?,
        format: field(&map, "format")?
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?,
        codec,
        compression,
    })
}

fn parse_trailer(line: &str) -> Result<SegmentTrailer> {
    let map = fields(line, TRAILER_MAGIC)?;
    Ok(SegmentTrailer {
        frames: field(&map, "frames")?.parse().context("Invalid frame count")?,
        end: parse_time(field(&map, "end")?)?,
    })
}
