//! Incremental BMP decoder.
//!
//! Reads a Windows bitmap straight off an async byte stream (normally a
//! producer's stdout) one row at a time, so a frame is never held twice in
//! memory. Handles the layouts an encoder emits for uncompressed frames:
//!
//! - 8 bpp palettized
//! - 24 bpp BGR
//! - 32 bpp BGRX, or 32 bpp with explicit channel bit masks
//!
//! Rows may be stored bottom-up (positive height) or top-down (negative).

use std::fmt;
use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

use crate::pixel::{PixelGrid, Rgba};

const FILE_HEADER_LEN: usize = 14;
const SIGNATURE: u16 = 0x4D42; // "BM"
const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;
/// Largest frame accepted, in pixels.
pub const MAX_PIXELS: u64 = 1 << 26;

/// Which part of the stream was being read when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    FileHeader,
    InfoHeader,
    Masks,
    Palette,
    Gap,
    PixelData,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::FileHeader => "file header",
            Section::InfoHeader => "info header",
            Section::Masks => "channel masks",
            Section::Palette => "palette",
            Section::Gap => "gap before pixel data",
            Section::PixelData => "pixel data",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bitmap stream ended early while reading {0}")]
    Truncated(Section),
    #[error("failed to read bitmap stream: {0}")]
    Io(#[source] std::io::Error),
    #[error("not a bitmap: signature {0:#06x}")]
    BadSignature(u16),
    #[error("malformed bitmap header: {0}")]
    BadHeader(String),
    #[error("unsupported bitmap encoding: {bits} bpp, compression {compression}")]
    Unsupported { bits: u16, compression: u32 },
    #[error("bitmap dimensions must be positive, got {width}x{height}")]
    NonPositiveDimensions { width: i32, height: i32 },
    #[error("bitmap of {width}x{height} exceeds the decoder limit")]
    TooLarge { width: u32, height: u32 },
    #[error("palette index {index} out of range ({len} colors)")]
    PaletteIndex { index: u8, len: usize },
    #[error("bitmap is {}x{}, expected {}x{}", .actual.0, .actual.1, .expected.0, .expected.1)]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

impl DecodeError {
    /// True when the stream simply stopped, e.g. because the producer died.
    pub fn is_truncation(&self) -> bool {
        matches!(self, DecodeError::Truncated(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelMask {
    mask: u32,
    shift: u32,
    bits: u32,
}

impl ChannelMask {
    fn new(mask: u32) -> Self {
        Self {
            mask,
            shift: if mask == 0 { 0 } else { mask.trailing_zeros() },
            bits: mask.count_ones(),
        }
    }

    fn extract(&self, px: u32) -> Option<u8> {
        if self.mask == 0 {
            return None;
        }
        let value = (px & self.mask) >> self.shift;
        Some(if self.bits >= 8 {
            (value >> (self.bits - 8)) as u8
        } else {
            let max = (1u32 << self.bits) - 1;
            (value * 255 / max) as u8
        })
    }
}

#[derive(Debug)]
enum Layout {
    Indexed(Vec<Rgba>),
    Bgr24,
    Bgrx32,
    Masked([ChannelMask; 4]),
}

#[derive(Debug)]
struct Header {
    width: u32,
    height: u32,
    top_down: bool,
    bits_per_pixel: u16,
    layout: Layout,
}

impl Header {
    fn row_len(&self) -> usize {
        (usize::from(self.bits_per_pixel) * self.width as usize).div_ceil(32) * 4
    }
}

/// Pulls one bitmap off a byte stream.
pub struct BitmapDecoder<R> {
    reader: BufReader<R>,
    consumed: u64,
    expected: Option<(u32, u32)>,
}

impl<R: AsyncRead + Unpin> BitmapDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            consumed: 0,
            expected: None,
        }
    }

    /// Fail with `DimensionMismatch` unless the bitmap is exactly this size.
    /// Checked as soon as the header is read.
    pub fn expect_dimensions(mut self, width: u32, height: u32) -> Self {
        self.expected = Some((width, height));
        self
    }

    pub async fn decode(mut self) -> Result<PixelGrid, DecodeError> {
        let (header, pixel_offset) = self.read_header().await?;

        if let Some(expected) = self.expected {
            let actual = (header.width, header.height);
            if actual != expected {
                return Err(DecodeError::DimensionMismatch { expected, actual });
            }
        }

        if u64::from(pixel_offset) < self.consumed {
            return Err(DecodeError::BadHeader(format!(
                "pixel data offset {pixel_offset} overlaps {} header bytes",
                self.consumed
            )));
        }
        self.skip(u64::from(pixel_offset) - self.consumed).await?;

        let mut grid = PixelGrid::filled(header.width, header.height, Rgba::default());
        let mut row = vec![0u8; header.row_len()];
        for i in 0..header.height {
            self.read_exact(&mut row, Section::PixelData).await?;
            let y = if header.top_down {
                i
            } else {
                header.height - 1 - i
            };
            convert_row(&header.layout, &row, grid.row_mut(y))?;
        }

        debug!(
            width = header.width,
            height = header.height,
            bytes = self.consumed,
            "bitmap decoded"
        );
        Ok(grid)
    }

    async fn read_header(&mut self) -> Result<(Header, u32), DecodeError> {
        let mut file_header = [0u8; FILE_HEADER_LEN];
        self.read_exact(&mut file_header, Section::FileHeader).await?;
        let signature = u16::from_le_bytes([file_header[0], file_header[1]]);
        if signature != SIGNATURE {
            return Err(DecodeError::BadSignature(signature));
        }
        let pixel_offset = le_u32(&file_header, 10);

        let mut size = [0u8; 4];
        self.read_exact(&mut size, Section::InfoHeader).await?;
        let info_len = u32::from_le_bytes(size) as usize;
        if !matches!(info_len, 40 | 52 | 56 | 108 | 124) {
            return Err(DecodeError::BadHeader(format!(
                "unsupported info header size {info_len}"
            )));
        }
        let mut info = vec![0u8; info_len];
        info[..4].copy_from_slice(&size);
        self.read_exact(&mut info[4..], Section::InfoHeader).await?;

        let raw_width = le_i32(&info, 4);
        let raw_height = le_i32(&info, 8);
        let bits_per_pixel = u16::from_le_bytes([info[14], info[15]]);
        let compression = le_u32(&info, 16);
        let colors_used = le_u32(&info, 32);

        if raw_width <= 0 || raw_height == 0 {
            return Err(DecodeError::NonPositiveDimensions {
                width: raw_width,
                height: raw_height,
            });
        }
        let width = raw_width as u32;
        let height = raw_height.unsigned_abs();
        if u64::from(width) * u64::from(height) > MAX_PIXELS {
            return Err(DecodeError::TooLarge { width, height });
        }

        let layout = match (bits_per_pixel, compression) {
            (8, BI_RGB) => Layout::Indexed(self.read_palette(colors_used).await?),
            (24, BI_RGB) => Layout::Bgr24,
            (32, BI_RGB) => Layout::Bgrx32,
            (32, BI_BITFIELDS) => Layout::Masked(self.read_masks(&info).await?),
            (bits, compression) => {
                return Err(DecodeError::Unsupported { bits, compression });
            }
        };

        let header = Header {
            width,
            height,
            top_down: raw_height < 0,
            bits_per_pixel,
            layout,
        };
        debug!(
            width,
            height,
            top_down = header.top_down,
            bits_per_pixel,
            compression,
            pixel_offset,
            "bitmap header"
        );
        Ok((header, pixel_offset))
    }

    async fn read_palette(&mut self, colors_used: u32) -> Result<Vec<Rgba>, DecodeError> {
        let len = if colors_used == 0 { 256 } else { colors_used as usize };
        if len > 256 {
            return Err(DecodeError::BadHeader(format!(
                "{len} palette entries for an 8 bpp bitmap"
            )));
        }
        let mut raw = vec![0u8; len * 4];
        self.read_exact(&mut raw, Section::Palette).await?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| Rgba::opaque(c[2], c[1], c[0]))
            .collect())
    }

    /// Masks live inside the larger info headers; a plain 40-byte header is
    /// followed by three of them (no alpha).
    async fn read_masks(&mut self, info: &[u8]) -> Result<[ChannelMask; 4], DecodeError> {
        let (r, g, b, a) = if info.len() >= 52 {
            let alpha = if info.len() >= 56 { le_u32(info, 52) } else { 0 };
            (le_u32(info, 40), le_u32(info, 44), le_u32(info, 48), alpha)
        } else {
            let mut masks = [0u8; 12];
            self.read_exact(&mut masks, Section::Masks).await?;
            (le_u32(&masks, 0), le_u32(&masks, 4), le_u32(&masks, 8), 0)
        };
        Ok([r, g, b, a].map(ChannelMask::new))
    }

    async fn read_exact(&mut self, buf: &mut [u8], section: Section) -> Result<(), DecodeError> {
        match self.reader.read_exact(buf).await {
            Ok(n) => {
                self.consumed += n as u64;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(DecodeError::Truncated(section)),
            Err(e) => Err(DecodeError::Io(e)),
        }
    }

    async fn skip(&mut self, len: u64) -> Result<(), DecodeError> {
        if len == 0 {
            return Ok(());
        }
        let mut gap = (&mut self.reader).take(len);
        let skipped = tokio::io::copy(&mut gap, &mut tokio::io::sink())
            .await
            .map_err(DecodeError::Io)?;
        self.consumed += skipped;
        if skipped < len {
            return Err(DecodeError::Truncated(Section::Gap));
        }
        Ok(())
    }
}

/// Decode a whole bitmap from `reader`.
pub async fn decode<R: AsyncRead + Unpin>(reader: R) -> Result<PixelGrid, DecodeError> {
    BitmapDecoder::new(reader).decode().await
}

fn convert_row(layout: &Layout, raw: &[u8], out: &mut [Rgba]) -> Result<(), DecodeError> {
    match layout {
        Layout::Indexed(palette) => {
            for (px, &index) in out.iter_mut().zip(raw) {
                *px = *palette
                    .get(usize::from(index))
                    .ok_or(DecodeError::PaletteIndex {
                        index,
                        len: palette.len(),
                    })?;
            }
        }
        Layout::Bgr24 => {
            for (px, c) in out.iter_mut().zip(raw.chunks_exact(3)) {
                *px = Rgba::opaque(c[2], c[1], c[0]);
            }
        }
        Layout::Bgrx32 => {
            for (px, c) in out.iter_mut().zip(raw.chunks_exact(4)) {
                *px = Rgba::opaque(c[2], c[1], c[0]);
            }
        }
        Layout::Masked([r, g, b, a]) => {
            for (px, c) in out.iter_mut().zip(raw.chunks_exact(4)) {
                let value = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                *px = Rgba::new(
                    r.extract(value).unwrap_or(0),
                    g.extract(value).unwrap_or(0),
                    b.extract(value).unwrap_or(0),
                    a.extract(value).unwrap_or(255),
                );
            }
        }
    }
    Ok(())
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_i32(buf: &[u8], at: usize) -> i32 {
    le_u32(buf, at) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
    use std::io::Cursor;

    /// Hand-built 24 bpp bitmap. `rows` are given top row first.
    fn bmp24(rows: &[Vec<[u8; 3]>], top_down: bool) -> Vec<u8> {
        let height = rows.len() as i32;
        let width = rows[0].len() as i32;
        let row_len = ((24 * width as usize + 31) / 32) * 4;
        let mut out = Vec::new();
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&((54 + row_len * rows.len()) as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&54u32.to_le_bytes());
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&(if top_down { -height } else { height }).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&24u16.to_le_bytes());
        out.extend_from_slice(&[0; 24]);
        let ordered: Vec<&Vec<[u8; 3]>> = if top_down {
            rows.iter().collect()
        } else {
            rows.iter().rev().collect()
        };
        for row in ordered {
            let start = out.len();
            for [r, g, b] in row {
                out.extend_from_slice(&[*b, *g, *r]);
            }
            out.resize(start + row_len, 0);
        }
        out
    }

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Bmp).unwrap();
        buf.into_inner()
    }

    fn sample_rows() -> Vec<Vec<[u8; 3]>> {
        vec![
            vec![[255, 0, 0], [0, 255, 0], [0, 0, 255]],
            vec![[10, 20, 30], [40, 50, 60], [70, 80, 90]],
        ]
    }

    #[tokio::test]
    async fn bottom_up_rows_are_flipped() {
        let bytes = bmp24(&sample_rows(), false);
        let grid = decode(&bytes[..]).await.unwrap();
        assert_eq!(grid.dimensions(), (3, 2));
        assert_eq!(grid.get(0, 0), Some(Rgba::opaque(255, 0, 0)));
        assert_eq!(grid.get(2, 0), Some(Rgba::opaque(0, 0, 255)));
        assert_eq!(grid.get(1, 1), Some(Rgba::opaque(40, 50, 60)));
    }

    #[tokio::test]
    async fn top_down_rows_keep_order() {
        let bytes = bmp24(&sample_rows(), true);
        let grid = decode(&bytes[..]).await.unwrap();
        assert_eq!(grid.get(0, 0), Some(Rgba::opaque(255, 0, 0)));
        assert_eq!(grid.get(2, 1), Some(Rgba::opaque(70, 80, 90)));
    }

    #[tokio::test]
    async fn rgba_bitfields_from_image_encoder() {
        let img = RgbaImage::from_fn(5, 3, |x, y| {
            image::Rgba([(x * 50) as u8, (y * 80) as u8, 7, (255 - x * 30) as u8])
        });
        let bytes = encode(DynamicImage::ImageRgba8(img.clone()));
        let grid = decode(&bytes[..]).await.unwrap();
        assert_eq!(grid.dimensions(), (5, 3));
        for (x, y, p) in img.enumerate_pixels() {
            assert_eq!(grid.get(x, y), Some(Rgba::new(p[0], p[1], p[2], p[3])), "at {x},{y}");
        }
    }

    #[tokio::test]
    async fn rgb_with_row_padding_from_image_encoder() {
        // Width 3 at 24 bpp needs 3 bytes of padding per row.
        let img = RgbImage::from_fn(3, 4, |x, y| image::Rgb([x as u8 * 9, y as u8 * 11, 200]));
        let bytes = encode(DynamicImage::ImageRgb8(img.clone()));
        let grid = decode(&bytes[..]).await.unwrap();
        for (x, y, p) in img.enumerate_pixels() {
            assert_eq!(grid.get(x, y), Some(Rgba::opaque(p[0], p[1], p[2])));
        }
    }

    #[tokio::test]
    async fn palettized_gray_from_image_encoder() {
        let img = GrayImage::from_fn(4, 2, |x, y| image::Luma([(x * 60 + y) as u8]));
        let bytes = encode(DynamicImage::ImageLuma8(img.clone()));
        let grid = decode(&bytes[..]).await.unwrap();
        for (x, y, p) in img.enumerate_pixels() {
            assert_eq!(grid.get(x, y), Some(Rgba::opaque(p[0], p[0], p[0])));
        }
    }

    #[tokio::test]
    async fn expected_dimensions_are_enforced() {
        let bytes = bmp24(&sample_rows(), false);
        let err = BitmapDecoder::new(&bytes[..])
            .expect_dimensions(2, 2)
            .decode()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::DimensionMismatch {
                expected: (2, 2),
                actual: (3, 2)
            }
        ));
        let ok = BitmapDecoder::new(&bytes[..])
            .expect_dimensions(3, 2)
            .decode()
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn truncated_pixel_data() {
        let bytes = bmp24(&sample_rows(), false);
        let err = decode(&bytes[..bytes.len() - 1]).await.unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(Section::PixelData)));
        assert!(err.is_truncation());
    }

    #[tokio::test]
    async fn empty_stream_is_truncated_header() {
        let err = decode(&[][..]).await.unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(Section::FileHeader)));
    }

    #[tokio::test]
    async fn png_is_not_a_bitmap() {
        let bytes = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0, 0, 0];
        let err = decode(&bytes[..]).await.unwrap_err();
        assert!(matches!(err, DecodeError::BadSignature(0x5089)));
    }

    #[tokio::test]
    async fn zero_width_is_rejected() {
        let mut bytes = bmp24(&sample_rows(), false);
        bytes[18..22].copy_from_slice(&0i32.to_le_bytes());
        let err = decode(&bytes[..]).await.unwrap_err();
        assert!(matches!(
            err,
            DecodeError::NonPositiveDimensions { width: 0, height: 2 }
        ));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_allocating() {
        let mut bytes = bmp24(&sample_rows(), false);
        bytes[18..22].copy_from_slice(&100_000i32.to_le_bytes());
        bytes[22..26].copy_from_slice(&100_000i32.to_le_bytes());
        let err = decode(&bytes[..]).await.unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn compressed_bitmaps_are_unsupported() {
        let mut bytes = bmp24(&sample_rows(), false);
        // 8 bpp RLE
        bytes[28..30].copy_from_slice(&8u16.to_le_bytes());
        bytes[30..34].copy_from_slice(&1u32.to_le_bytes());
        let err = decode(&bytes[..]).await.unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Unsupported { bits: 8, compression: 1 }
        ));
    }

    #[tokio::test]
    async fn gap_before_pixel_data_is_skipped() {
        let mut bytes = bmp24(&sample_rows(), true);
        bytes.splice(54..54, [0xEE; 10]);
        bytes[10..14].copy_from_slice(&64u32.to_le_bytes());
        let grid = decode(&bytes[..]).await.unwrap();
        assert_eq!(grid.get(0, 0), Some(Rgba::opaque(255, 0, 0)));
    }

    #[tokio::test]
    async fn pixel_offset_inside_header_is_malformed() {
        let mut bytes = bmp24(&sample_rows(), true);
        bytes[10..14].copy_from_slice(&20u32.to_le_bytes());
        let err = decode(&bytes[..]).await.unwrap_err();
        assert!(matches!(err, DecodeError::BadHeader(_)));
    }

    #[test]
    fn narrow_masks_scale_to_full_range() {
        let five_bits = ChannelMask::new(0x7C00);
        assert_eq!(five_bits.extract(0x7C00), Some(255));
        assert_eq!(five_bits.extract(0), Some(0));
        assert_eq!(ChannelMask::new(0).extract(0xFFFF_FFFF), None);
    }
}
