// Live MJPEG feed for the streaming boundary.
//
// Each viewer owns one `LiveFeed`, backed by a shallow drop-oldest bus
// subscription, so a slow viewer only ever loses its own frames.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::codec::encode_jpeg;
use crate::error::CaptureError;
use crate::frame::{PixelFormat, RasterImage};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub struct LiveFeed {
    subscription: Subscription,
    quality: u8,
    gamma: Option<f32>,
    parts: u64,
}

impl LiveFeed {
    pub fn new(subscription: Subscription, quality: u8) -> Self {
        Self {
            subscription,
            quality,
            gamma: None,
            parts: 0,
        }
    }

    /// Enhance each frame for low light before encoding; `None` sends frames as captured
    pub fn with_enhancement(mut self, gamma: Option<f32>) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn parts_sent(&self) -> u64 {
        self.parts
    }

    /// Next multipart body part, or `None` once the pipeline has stopped
    pub async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            let frame = self.subscription.recv().await?;
            let image = frame.image().clone();
            let quality = self.quality;
            let gamma = self.gamma;

            let encoded = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
                match gamma {
                    Some(gamma) => encode_jpeg(&enhance_low_light(&image, gamma)?, quality),
                    None => encode_jpeg(&image, quality),
                }
            })
            .await;
            match encoded {
                Ok(Ok(jpeg)) => {
                    self.parts += 1;
                    return Some(multipart_part(&jpeg));
                }
                Ok(Err(e)) => warn!("Live feed skipped frame {}: {:#}", frame.sequence(), e),
                Err(e) => {
                    debug!("Live feed encoder task failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Low-light enhancement for viewing.
///
/// Luma is histogram-equalized (chroma is kept by shifting every channel by
/// the luma change), then each channel goes through a `(v / 255)^gamma` curve.
pub fn enhance_low_light(image: &RasterImage, gamma: f32) -> Result<RasterImage, CaptureError> {
    let lumas: Vec<u8> = (0..image.height())
        .flat_map(|y| (0..image.width()).map(move |x| image.luma_at(x, y)))
        .collect();
    let equalize = equalization_table(&lumas);
    let curve = gamma_table(gamma);

    let data: Vec<u8> = match image.format() {
        PixelFormat::Gray8 => lumas
            .iter()
            .map(|&luma| curve[equalize[luma as usize] as usize])
            .collect(),
        PixelFormat::Rgb8 => image
            .data()
            .chunks_exact(3)
            .zip(&lumas)
            .flat_map(|(pixel, &luma)| {
                let shift = equalize[luma as usize] as i16 - luma as i16;
                [pixel[0], pixel[1], pixel[2]]
                    .map(|channel| curve[(channel as i16 + shift).clamp(0, 255) as usize])
            })
            .collect(),
    };

    RasterImage::new(image.width(), image.height(), image.format(), data)
}

fn equalization_table(lumas: &[u8]) -> [u8; 256] {
    let mut histogram = [0u64; 256];
    for &luma in lumas {
        histogram[luma as usize] += 1;
    }

    let mut table = [0u8; 256];
    let total = lumas.len() as u64;
    let lowest = histogram.iter().copied().find(|&count| count > 0).unwrap_or(0);
    if total == lowest {
        // Single-valued image: nothing to stretch
        for (value, slot) in table.iter_mut().enumerate() {
            *slot = value as u8;
        }
        return table;
    }

    let mut cumulative = 0u64;
    for (slot, count) in table.iter_mut().zip(histogram) {
        cumulative += count;
        let scaled = cumulative.saturating_sub(lowest) as f64 * 255.0 / (total - lowest) as f64;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }
    table
}

fn gamma_table(gamma: f32) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (value, slot) in table.iter_mut().enumerate() {
        let level = (value as f32 / 255.0).powf(gamma) * 255.0;
        *slot = level.round().clamp(0.0, 255.0) as u8;
    }
    table
}

/// Wrap one JPEG image as a `multipart/x-mixed-replace` part
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 64);
    part.put_slice(b"--");
    part.put_slice(BOUNDARY.as_bytes());
    part.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FrameBus;
    use crate::frame::Frame;
    use chrono::Utc;

    fn spread(image: &RasterImage) -> (u8, u8) {
        let lumas: Vec<u8> = (0..image.height())
            .flat_map(|y| (0..image.width()).map(move |x| image.luma_at(x, y)))
            .collect();
        (*lumas.iter().min().unwrap(), *lumas.iter().max().unwrap())
    }

    #[test]
    fn test_dark_frame_histogram_is_stretched() {
        // 8x8 ramp over 10..=41
        let data: Vec<u8> = (0..64u8).map(|i| 10 + i / 2).collect();
        let dark = RasterImage::new(8, 8, PixelFormat::Gray8, data).unwrap();
        assert_eq!(spread(&dark), (10, 41));

        let enhanced = enhance_low_light(&dark, 1.5).unwrap();
        assert_eq!(spread(&enhanced), (0, 255));
        assert_eq!(enhanced.format(), PixelFormat::Gray8);

        // Equalization keeps the ordering of luma levels
        let before = dark.data();
        let after = enhanced.data();
        for i in 1..before.len() {
            assert!(after[i] >= after[i - 1]);
            if before[i] > before[i - 1] {
                assert!(after[i] > after[i - 1]);
            }
        }
    }

    #[test]
    fn test_color_frame_keeps_gray_pixels_gray() {
        let data: Vec<u8> = (0..16u8).flat_map(|i| [20 + i, 20 + i, 20 + i]).collect();
        let dark = RasterImage::new(4, 4, PixelFormat::Rgb8, data).unwrap();

        let enhanced = enhance_low_light(&dark, 1.5).unwrap();
        assert_eq!(spread(&enhanced), (0, 255));
        for pixel in enhanced.data().chunks_exact(3) {
            assert_eq!(pixel[0], pixel[1]);
            assert_eq!(pixel[1], pixel[2]);
        }
    }

    #[test]
    fn test_flat_frame_only_gets_gamma_curve() {
        let flat = RasterImage::new(4, 4, PixelFormat::Gray8, vec![128u8; 16]).unwrap();
        let enhanced = enhance_low_light(&flat, 1.0).unwrap();
        assert!(enhanced.data().iter().all(|&v| v == 128));
    }

    #[test]
    fn test_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_feed_ends_when_bus_closes() {
        let bus = FrameBus::new(2);
        let mut feed = LiveFeed::new(bus.subscribe("viewer"), 70).with_enhancement(Some(1.5));
        let image = RasterImage::new(8, 8, PixelFormat::Rgb8, vec![128u8; 192]).unwrap();
        bus.publish(Frame::new(1, Utc::now(), image));
        bus.close();

        let part = feed.next_part().await.unwrap();
        assert!(part.windows(2).any(|w| w == [0xFF, 0xD8]));
        assert!(feed.next_part().await.is_none());
        assert_eq!(feed.parts_sent(), 1);
    }
}
