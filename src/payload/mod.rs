//! Payload classification and decoding.
//!
//! A filled [`TransferBuffer`] is turned into an [`AcquiredFrame`] by a single
//! match over [`PayloadType`]. Every arm returns the same
//! `Result<AcquiredFrame, IterationError>`, so an unknown tag is just another
//! value rather than a fall-through.
//!
//! Frames are borrowed views: image data points into the transfer buffer (or
//! into the decompression scratch buffer) and cannot outlive the delivery
//! call. Use [`AcquiredFrame::to_owned_frame`] to keep pixels past requeue.
//!
//! ```compile_fail
//! use acq_stream::payload::AcquiredFrame;
//!
//! fn keep<'a>(frame: &AcquiredFrame<'a>, store: &mut Vec<AcquiredFrame<'static>>) {
//!     store.push(frame.clone()); // borrowed view cannot become 'static
//! }
//! ```

pub mod decompress;

use std::fmt;

use bytes::Bytes;

use crate::error::{IntegrityFault, IterationError};
use crate::pool::{BufferId, ImageLeader, TransferBuffer};

pub use decompress::{DecompressError, DecompressionFilter, OutputFormat};

/// Payload type tag of a completed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Uncompressed image.
    Image,
    /// Opaque raw bytes.
    RawData,
    /// Chunk data without image.
    ChunkData,
    /// Multi-part container.
    MultiPart,
    /// Compressed image (LZ4 with image header).
    CompressedImage,
    /// Any other tag, kept verbatim.
    Unsupported(u16),
}

impl PayloadType {
    /// GVSP tag for [`PayloadType::Image`].
    pub const IMAGE: u16 = 0x0001;
    /// GVSP tag for [`PayloadType::RawData`].
    pub const RAW_DATA: u16 = 0x0002;
    /// GVSP tag for [`PayloadType::ChunkData`].
    pub const CHUNK_DATA: u16 = 0x0004;
    /// GVSP tag for [`PayloadType::MultiPart`].
    pub const MULTI_PART: u16 = 0x000A;
    /// Device-specific tag for [`PayloadType::CompressedImage`].
    pub const COMPRESSED_IMAGE: u16 = 0x8001;

    /// Classify a raw tag.
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            Self::IMAGE => Self::Image,
            Self::RAW_DATA => Self::RawData,
            Self::CHUNK_DATA => Self::ChunkData,
            Self::MULTI_PART => Self::MultiPart,
            Self::COMPRESSED_IMAGE => Self::CompressedImage,
            other => Self::Unsupported(other),
        }
    }

    /// Raw tag of this payload type.
    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Image => Self::IMAGE,
            Self::RawData => Self::RAW_DATA,
            Self::ChunkData => Self::CHUNK_DATA,
            Self::MultiPart => Self::MULTI_PART,
            Self::CompressedImage => Self::COMPRESSED_IMAGE,
            Self::Unsupported(raw) => raw,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("Image"),
            Self::RawData => f.write_str("RawData"),
            Self::ChunkData => f.write_str("ChunkData"),
            Self::MultiPart => f.write_str("MultiPart"),
            Self::CompressedImage => f.write_str("CompressedImage"),
            Self::Unsupported(raw) => write!(f, "Unsupported({raw:#06x})"),
        }
    }
}

/// PFNC pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit monochrome
    Mono8,
    /// 10-bit monochrome, unpacked into 16 bits
    Mono10,
    /// 12-bit monochrome, unpacked into 16 bits
    Mono12,
    /// 16-bit monochrome
    Mono16,
    /// 8-bit Bayer RGGB
    BayerRg8,
    /// 24-bit RGB
    Rgb8,
    /// 24-bit BGR
    Bgr8,
    /// YUV 4:2:2, UYVY ordering
    YuvUyvy8,
    /// Unrecognised code, kept verbatim.
    Unknown(u32),
}

impl PixelFormat {
    const MONO8: u32 = 0x0108_0001;
    const MONO10: u32 = 0x0110_0003;
    const MONO12: u32 = 0x0110_0005;
    const MONO16: u32 = 0x0110_0007;
    const BAYER_RG8: u32 = 0x0108_0009;
    const RGB8: u32 = 0x0218_0014;
    const BGR8: u32 = 0x0218_0015;
    const YUV_UYVY8: u32 = 0x0210_001F;

    /// Classify a raw PFNC code.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::MONO8 => Self::Mono8,
            Self::MONO10 => Self::Mono10,
            Self::MONO12 => Self::Mono12,
            Self::MONO16 => Self::Mono16,
            Self::BAYER_RG8 => Self::BayerRg8,
            Self::RGB8 => Self::Rgb8,
            Self::BGR8 => Self::Bgr8,
            Self::YUV_UYVY8 => Self::YuvUyvy8,
            other => Self::Unknown(other),
        }
    }

    /// Raw PFNC code.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Mono8 => Self::MONO8,
            Self::Mono10 => Self::MONO10,
            Self::Mono12 => Self::MONO12,
            Self::Mono16 => Self::MONO16,
            Self::BayerRg8 => Self::BAYER_RG8,
            Self::Rgb8 => Self::RGB8,
            Self::Bgr8 => Self::BGR8,
            Self::YuvUyvy8 => Self::YUV_UYVY8,
            Self::Unknown(raw) => raw,
        }
    }

    /// Bits per pixel, taken from bits 16..24 of the PFNC code.
    #[must_use]
    pub fn bits_per_pixel(self) -> Option<u32> {
        match (self.to_raw() >> 16) & 0xFF {
            0 => None,
            bits => Some(bits),
        }
    }

    /// Bytes a `width` x `height` image of this format occupies.
    #[must_use]
    pub fn image_size(self, width: u32, height: u32) -> Option<usize> {
        let bits = u64::from(self.bits_per_pixel()?) * u64::from(width) * u64::from(height);
        usize::try_from(bits / 8).ok()
    }
}

/// Size-checked view of image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageView<'a> {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    /// Build a view over `data`, checking it holds the whole image.
    ///
    /// Trailing bytes beyond the image size are excluded from the view.
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: &'a [u8],
    ) -> Result<Self, IntegrityFault> {
        let required = pixel_format
            .image_size(width, height)
            .ok_or(IntegrityFault::UnknownPixelFormat(pixel_format.to_raw()))?;
        let data = data.get(..required).ok_or(IntegrityFault::Truncated {
            required,
            available: data.len(),
        })?;
        Ok(Self {
            width,
            height,
            pixel_format,
            data,
        })
    }

    fn from_leader(leader: &ImageLeader, data: &'a [u8]) -> Result<Self, IntegrityFault> {
        Self::new(
            leader.width,
            leader.height,
            PixelFormat::from_raw(leader.pixel_format),
            data,
        )
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Pixel bytes, exactly `image_size` long.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Bytes per row.
    #[must_use]
    pub fn stride(&self) -> usize {
        if self.height == 0 {
            0
        } else {
            self.data.len() / self.height as usize
        }
    }

    /// One row of pixels.
    #[must_use]
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.stride();
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Copy the pixels out of pool memory.
    #[must_use]
    pub fn to_owned_image(&self) -> OwnedImage {
        OwnedImage {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

/// Decoded payload contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    /// Uncompressed image.
    Image(ImageView<'a>),
    /// Decompressed image; `compressed_len` is the on-wire size.
    CompressedImage {
        /// View into the decompression scratch buffer.
        image: ImageView<'a>,
        /// Bytes received before decompression.
        compressed_len: usize,
    },
    /// Chunk data; only the chunk count is reported.
    ChunkData {
        /// Number of chunks.
        chunk_count: u32,
    },
    /// Raw bytes; only the length is reported.
    RawData {
        /// Payload length in bytes.
        length: usize,
    },
    /// Multi-part container; only the part count is reported.
    MultiPart {
        /// Number of parts.
        part_count: u32,
    },
}

/// A frame decoded from a filled buffer, valid only during delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredFrame<'a> {
    /// Block id assigned by the device.
    pub block_id: u64,
    /// Device timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Pool buffer the payload arrived in.
    pub buffer: BufferId,
    /// Decoded contents.
    pub payload: Payload<'a>,
}

impl<'a> AcquiredFrame<'a> {
    /// Payload type tag the frame was decoded from.
    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        match self.payload {
            Payload::Image(_) => PayloadType::Image,
            Payload::CompressedImage { .. } => PayloadType::CompressedImage,
            Payload::ChunkData { .. } => PayloadType::ChunkData,
            Payload::RawData { .. } => PayloadType::RawData,
            Payload::MultiPart { .. } => PayloadType::MultiPart,
        }
    }

    /// Image view for image and compressed-image payloads.
    #[must_use]
    pub fn image(&self) -> Option<&ImageView<'a>> {
        match &self.payload {
            Payload::Image(image) | Payload::CompressedImage { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Decompressed size over received size, for compressed payloads.
    #[must_use]
    pub fn compression_ratio(&self) -> Option<f64> {
        match &self.payload {
            Payload::CompressedImage {
                image,
                compressed_len,
            } if *compressed_len > 0 => Some(image.data().len() as f64 / *compressed_len as f64),
            _ => None,
        }
    }

    /// Copy the frame out of pool memory.
    #[must_use]
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            block_id: self.block_id,
            timestamp_ns: self.timestamp_ns,
            payload_type: self.payload_type(),
            image: self.image().map(ImageView::to_owned_image),
        }
    }
}

/// Image pixels copied out of pool memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub pixel_format: PixelFormat,
    /// Pixel bytes.
    pub data: Bytes,
}

/// A frame that survives requeue of its source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    /// Block id assigned by the device.
    pub block_id: u64,
    /// Device timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Payload type tag.
    pub payload_type: PayloadType,
    /// Pixels for image payloads.
    pub image: Option<OwnedImage>,
}

/// Classify and decode the payload of a filled buffer.
///
/// The returned frame borrows both `buffer` and `filter`; it must be dropped
/// before the buffer is requeued.
pub fn decode<'a>(
    buffer: &'a TransferBuffer,
    filter: &'a mut DecompressionFilter,
) -> Result<AcquiredFrame<'a>, IterationError> {
    let leader = buffer.leader();
    let block_id = leader.block_id;
    let payload_type = buffer.payload_type();
    let integrity = |fault| IterationError::DecodeIntegrity {
        block_id,
        payload_type,
        fault,
    };

    let payload = match payload_type {
        PayloadType::Image => {
            let geometry = leader
                .image
                .as_ref()
                .ok_or(IntegrityFault::MissingGeometry)
                .map_err(integrity)?;
            Payload::Image(ImageView::from_leader(geometry, buffer.data()).map_err(integrity)?)
        }
        PayloadType::CompressedImage => {
            let data = buffer.data();
            if !DecompressionFilter::is_compressed(data) {
                return Err(IterationError::FormatMismatch {
                    block_id,
                    reason: "payload is not compressed".into(),
                });
            }
            let format = DecompressionFilter::output_format_for(data).map_err(|e| {
                IterationError::FormatMismatch {
                    block_id,
                    reason: format!("could not read header: {e}"),
                }
            })?;
            let expected = format
                .expected_size()
                .ok_or(IntegrityFault::UnknownPixelFormat(format.pixel_format.to_raw()))
                .map_err(integrity)?;
            let pixels = filter.execute(data, expected).map_err(|e| match e {
                DecompressError::Oversized { declared, .. } => {
                    integrity(IntegrityFault::SizeMismatch {
                        expected,
                        actual: declared,
                    })
                }
                other => integrity(IntegrityFault::Decompression(other.to_string())),
            })?;
            if pixels.len() != expected {
                return Err(integrity(IntegrityFault::SizeMismatch {
                    expected,
                    actual: pixels.len(),
                }));
            }
            let image = ImageView::new(format.width, format.height, format.pixel_format, pixels)
                .map_err(integrity)?;
            Payload::CompressedImage {
                image,
                compressed_len: data.len(),
            }
        }
        PayloadType::ChunkData => Payload::ChunkData {
            chunk_count: leader.chunk_count,
        },
        PayloadType::RawData => Payload::RawData {
            length: buffer.received_len(),
        },
        PayloadType::MultiPart => Payload::MultiPart {
            part_count: leader.part_count,
        },
        PayloadType::Unsupported(_) => {
            return Err(IterationError::UnsupportedPayloadType {
                block_id,
                payload_type,
            })
        }
    };

    Ok(AcquiredFrame {
        block_id,
        timestamp_ns: leader.timestamp_ns,
        buffer: buffer.id(),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::decompress::compress_image;
    use super::*;
    use crate::pool::{BufferLeader, TransferBuffer};

    fn filled(payload_type: u16, image: Option<ImageLeader>, bytes: &[u8]) -> TransferBuffer {
        let mut buffer = TransferBuffer::new(BufferId(0), vec![0u8; 4096]);
        buffer.memory_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.complete(
            BufferLeader {
                block_id: 11,
                payload_type,
                image,
                chunk_count: 3,
                part_count: 2,
                ..Default::default()
            },
            bytes.len(),
        );
        buffer
    }

    fn mono8(width: u32, height: u32) -> ImageLeader {
        ImageLeader {
            width,
            height,
            pixel_format: PixelFormat::Mono8.to_raw(),
            ..Default::default()
        }
    }

    #[test]
    fn payload_tags_round_trip_through_classification() {
        for tag in [0x0001, 0x0002, 0x0004, 0x000A, 0x8001, 0x0006] {
            assert_eq!(PayloadType::from_raw(tag).to_raw(), tag);
        }
        assert_eq!(PayloadType::from_raw(0x0006), PayloadType::Unsupported(0x0006));
    }

    #[test]
    fn pixel_sizes_follow_pfnc_bit_field() {
        assert_eq!(PixelFormat::Mono8.bits_per_pixel(), Some(8));
        assert_eq!(PixelFormat::Mono12.bits_per_pixel(), Some(16));
        assert_eq!(PixelFormat::Rgb8.bits_per_pixel(), Some(24));
        assert_eq!(PixelFormat::YuvUyvy8.image_size(4, 2), Some(16));
        assert_eq!(PixelFormat::Unknown(0).bits_per_pixel(), None);
    }

    #[test]
    fn image_payload_decodes_geometry() {
        let pixels: Vec<u8> = (0..16).collect();
        let buffer = filled(PayloadType::IMAGE, Some(mono8(4, 4)), &pixels);
        let mut filter = DecompressionFilter::new();

        let frame = decode(&buffer, &mut filter).unwrap();
        let image = frame.image().unwrap();
        assert_eq!(frame.payload_type(), PayloadType::Image);
        assert_eq!((image.width(), image.height()), (4, 4));
        assert_eq!(image.row(1), Some(&pixels[4..8]));
        assert_eq!(image.row(4), None);
        assert_eq!(frame.block_id, 11);
    }

    #[test]
    fn truncated_image_is_an_integrity_error() {
        let buffer = filled(PayloadType::IMAGE, Some(mono8(8, 8)), &[0u8; 40]);
        let err = decode(&buffer, &mut DecompressionFilter::new()).unwrap_err();
        assert_eq!(
            err,
            IterationError::DecodeIntegrity {
                block_id: 11,
                payload_type: PayloadType::Image,
                fault: IntegrityFault::Truncated {
                    required: 64,
                    available: 40
                },
            }
        );
    }

    #[test]
    fn metadata_payloads_report_counts() {
        let mut filter = DecompressionFilter::new();

        let chunk = filled(PayloadType::CHUNK_DATA, None, &[1, 2, 3]);
        assert_eq!(
            decode(&chunk, &mut filter).unwrap().payload,
            Payload::ChunkData { chunk_count: 3 }
        );

        let raw = filled(PayloadType::RAW_DATA, None, &[0u8; 100]);
        assert_eq!(
            decode(&raw, &mut filter).unwrap().payload,
            Payload::RawData { length: 100 }
        );

        let multi = filled(PayloadType::MULTI_PART, None, &[0u8; 8]);
        assert_eq!(
            decode(&multi, &mut filter).unwrap().payload,
            Payload::MultiPart { part_count: 2 }
        );
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let buffer = filled(0x0006, None, &[0u8; 4]);
        let err = decode(&buffer, &mut DecompressionFilter::new()).unwrap_err();
        assert_eq!(err.payload_type(), Some(PayloadType::Unsupported(0x0006)));
    }

    #[test]
    fn compressed_payload_is_decompressed() {
        let format = OutputFormat {
            pixel_format: PixelFormat::Mono8,
            width: 32,
            height: 16,
        };
        let payload = compress_image(&format, &[9u8; 512]);
        let buffer = filled(PayloadType::COMPRESSED_IMAGE, None, &payload);
        let mut filter = DecompressionFilter::new();

        let frame = decode(&buffer, &mut filter).unwrap();
        assert_eq!(frame.payload_type(), PayloadType::CompressedImage);
        assert_eq!(frame.image().unwrap().data().len(), 512);
        assert!(frame.compression_ratio().unwrap() > 1.0);
    }

    #[test]
    fn uncompressed_contents_are_a_format_mismatch() {
        let buffer = filled(PayloadType::COMPRESSED_IMAGE, None, &[0u8; 64]);
        let err = decode(&buffer, &mut DecompressionFilter::new()).unwrap_err();
        assert!(matches!(err, IterationError::FormatMismatch { block_id: 11, .. }));
    }

    #[test]
    fn decompressed_size_mismatch_is_reported() {
        let format = OutputFormat {
            pixel_format: PixelFormat::Mono8,
            width: 32,
            height: 16,
        };
        let payload = compress_image(&format, &[9u8; 510]);
        let buffer = filled(PayloadType::COMPRESSED_IMAGE, None, &payload);

        let err = decode(&buffer, &mut DecompressionFilter::new()).unwrap_err();
        assert_eq!(
            err,
            IterationError::DecodeIntegrity {
                block_id: 11,
                payload_type: PayloadType::CompressedImage,
                fault: IntegrityFault::SizeMismatch {
                    expected: 512,
                    actual: 510
                },
            }
        );
    }

    #[test]
    fn corrupt_size_prefix_is_a_size_mismatch() {
        let format = OutputFormat {
            pixel_format: PixelFormat::Mono8,
            width: 32,
            height: 16,
        };
        let mut payload = compress_image(&format, &[9u8; 512]);
        let prefix = decompress::HEADER_LEN;
        payload[prefix..prefix + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let buffer = filled(PayloadType::COMPRESSED_IMAGE, None, &payload);
        let mut filter = DecompressionFilter::new();

        let err = decode(&buffer, &mut filter).unwrap_err();
        assert_eq!(
            err,
            IterationError::DecodeIntegrity {
                block_id: 11,
                payload_type: PayloadType::CompressedImage,
                fault: IntegrityFault::SizeMismatch {
                    expected: 512,
                    actual: u32::MAX as usize
                },
            }
        );
        assert_eq!(filter.executed(), 0);
    }

    #[test]
    fn owned_frame_outlives_buffer() {
        let pixels = [5u8; 16];
        let buffer = filled(PayloadType::IMAGE, Some(mono8(4, 4)), &pixels);
        let mut filter = DecompressionFilter::new();
        let owned = decode(&buffer, &mut filter).unwrap().to_owned_frame();
        drop(buffer);

        let image = owned.image.unwrap();
        assert_eq!(image.data.as_ref(), &pixels);
        assert_eq!(owned.payload_type, PayloadType::Image);
    }
}
