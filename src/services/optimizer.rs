//! Byte-size targeting re-encoder.
//!
//! The source is first fitted to the output square (crop or stretch), then
//! the encoder quality is bisected until the payload lands in, or as close
//! as the iteration budget allows to, the `[min_bytes, max_bytes]` window.
//! Termination comes from the fixed iteration count, not from hitting the
//! window.

use crate::models::media_type::MediaType;
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use std::{io::Cursor, str::FromStr};
use thiserror::Error;
use tracing::{debug, trace};

pub const MAX_QUALITY: f32 = 0.98;
pub const PIVOT_QUALITY: f32 = 0.5;
pub const MIN_QUALITY: f32 = 0.1;
pub const MAX_OUTPUT_EDGE: u32 = 4096;
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizeError {
    #[error("encoder produced no output at any quality: {0}")]
    EncodingFailure(String),
    #[error("invalid compression target: {0}")]
    InvalidTarget(String),
    #[error("optimizer worker unavailable")]
    WorkerUnavailable,
}

/// Output window and geometry for one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionTarget {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub output_width: u32,
    pub output_height: u32,
    pub max_iterations: u32,
}

impl CompressionTarget {
    pub fn square(edge: u32, min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            min_bytes,
            max_bytes,
            output_width: edge,
            output_height: edge,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn contains(&self, size: usize) -> bool {
        (self.min_bytes..=self.max_bytes).contains(&size)
    }

    fn distance_to_midpoint(&self, size: usize) -> f64 {
        let mid = (self.min_bytes as f64 + self.max_bytes as f64) / 2.0;
        (size as f64 - mid).abs()
    }

    fn check(&self) -> Result<(), OptimizeError> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(OptimizeError::InvalidTarget("output size is zero".into()));
        }
        if self.output_width > MAX_OUTPUT_EDGE || self.output_height > MAX_OUTPUT_EDGE {
            return Err(OptimizeError::InvalidTarget(format!(
                "output size exceeds {MAX_OUTPUT_EDGE} pixels per side"
            )));
        }
        if self.min_bytes > self.max_bytes {
            return Err(OptimizeError::InvalidTarget(format!(
                "min_bytes {} exceeds max_bytes {}",
                self.min_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

/// How the source is fitted to the output rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Centered region with the output's aspect ratio; the rest is discarded.
    #[default]
    Crop,
    /// Whole source drawn into the output, aspect ratio ignored.
    Stretch,
}

impl FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crop" => Ok(Self::Crop),
            "stretch" => Ok(Self::Stretch),
            other => Err(format!("unknown resize mode `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct EncodeError(pub String);

/// A lossy encoder whose output size responds to a quality in `0.0..=1.0`.
pub trait ImageEncoder: Send + Sync + 'static {
    fn media_type(&self) -> MediaType;

    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, EncodeError>;
}

/// Baseline JPEG through the `image` crate; quality maps onto 1–100.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegQualityEncoder;

impl ImageEncoder for JpegQualityEncoder {
    fn media_type(&self) -> MediaType {
        MediaType::Jpeg
    }

    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality(quality));
        image
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| EncodeError(format!("JPEG encode failed: {e}")))?;
        Ok(buf.into_inner())
    }
}

fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Lossy WebP through libwebp; quality maps onto 0–100. This is the
/// vault's canonical output.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpQualityEncoder;

impl ImageEncoder for WebpQualityEncoder {
    fn media_type(&self) -> MediaType {
        MediaType::Webp
    }

    fn encode(&self, image: &DynamicImage, quality: f32) -> Result<Vec<u8>, EncodeError> {
        let quality = (quality * 100.0).clamp(0.0, 100.0);
        let (width, height) = (image.width(), image.height());
        let encoded = if image.color().has_alpha() {
            let rgba = image.to_rgba8();
            webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_simple(false, quality)
        } else {
            let rgb = image.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_simple(false, quality)
        };
        encoded
            .map(|memory| memory.to_vec())
            .map_err(|e| EncodeError(format!("WebP encode failed: {e:?}")))
    }
}

/// Result of a search.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub quality: f32,
    pub media_type: MediaType,
    /// Encoder invocations spent, including refused ones.
    pub attempts: u32,
}

impl Compressed {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Fit `source` to the target and run the quality search.
pub fn optimize<E: ImageEncoder + ?Sized>(
    source: &DynamicImage,
    mode: ResizeMode,
    target: &CompressionTarget,
    encoder: &E,
) -> Result<Compressed, OptimizeError> {
    target.check()?;
    if source.width() == 0 || source.height() == 0 {
        return Err(OptimizeError::EncodingFailure("source image is empty".into()));
    }
    let fitted = resize_to_target(source, mode, target.output_width, target.output_height);
    search_quality(&fitted, target, encoder)
}

pub fn resize_to_target(
    source: &DynamicImage,
    mode: ResizeMode,
    width: u32,
    height: u32,
) -> DynamicImage {
    match mode {
        ResizeMode::Stretch => source.resize_exact(width, height, FilterType::Lanczos3),
        ResizeMode::Crop => {
            let (x, y, w, h) = centered_crop(source.width(), source.height(), width, height);
            source
                .crop_imm(x, y, w, h)
                .resize_exact(width, height, FilterType::Lanczos3)
        }
    }
}

/// `(x, y, width, height)` of the largest centered region of the source
/// whose aspect ratio equals the output's.
fn centered_crop(src_w: u32, src_h: u32, out_w: u32, out_h: u32) -> (u32, u32, u32, u32) {
    let (sw, sh, ow, oh) = (src_w as u64, src_h as u64, out_w as u64, out_h as u64);
    if sw * oh > sh * ow {
        let w = ((sh * ow) / oh).clamp(1, sw) as u32;
        ((src_w - w) / 2, 0, w, src_h)
    } else {
        let h = ((sw * oh) / ow).clamp(1, sh) as u32;
        (0, (src_h - h) / 2, src_w, h)
    }
}

/// Bisect encoder quality toward the target window.
///
/// 1. Quality 0.98 already under `min_bytes`: returned as is.
/// 2. Quality 0.5 over `max_bytes`: bisect `[0.1, 0.5]`, first candidate
///    within `max_bytes` wins.
/// 3. Otherwise bisect `[0.5, 0.98]`, keeping the admissible candidate
///    closest to the window midpoint, in-window candidates first.
pub fn search_quality<E: ImageEncoder + ?Sized>(
    image: &DynamicImage,
    target: &CompressionTarget,
    encoder: &E,
) -> Result<Compressed, OptimizeError> {
    let mut search = Search {
        image,
        target,
        encoder,
        attempts: 0,
        last_error: None,
    };

    let top = search.encode(MAX_QUALITY);
    if let Some(top) = top.as_ref().filter(|c| c.size() < target.min_bytes) {
        debug!(size = top.size(), "source already below window at top quality");
        return Ok(search.finish(top.clone()));
    }

    let result = match search.encode(PIVOT_QUALITY) {
        Some(pivot) if pivot.size() > target.max_bytes => search.bisect_low(pivot),
        pivot => search.bisect_high(top, pivot),
    }?;

    debug!(
        quality = result.quality,
        size = result.size(),
        attempts = result.attempts,
        in_window = target.contains(result.size()),
        "quality search finished"
    );
    Ok(result)
}

struct Search<'a, E: ?Sized> {
    image: &'a DynamicImage,
    target: &'a CompressionTarget,
    encoder: &'a E,
    attempts: u32,
    last_error: Option<EncodeError>,
}

impl<E: ImageEncoder + ?Sized> Search<'_, E> {
    fn encode(&mut self, quality: f32) -> Option<Compressed> {
        self.attempts += 1;
        match self.encoder.encode(self.image, quality) {
            Ok(bytes) => {
                trace!(quality, size = bytes.len(), "candidate");
                Some(Compressed {
                    bytes,
                    quality,
                    media_type: self.encoder.media_type(),
                    attempts: self.attempts,
                })
            }
            Err(err) => {
                debug!(quality, error = %err, "encoder refused quality");
                self.last_error = Some(err);
                None
            }
        }
    }

    fn finish(&self, mut candidate: Compressed) -> Compressed {
        candidate.attempts = self.attempts;
        candidate
    }

    fn failure(&mut self) -> OptimizeError {
        let reason = self
            .last_error
            .take()
            .map(|e| e.0)
            .unwrap_or_else(|| "no candidate produced".into());
        OptimizeError::EncodingFailure(reason)
    }

    /// Admissible quality lies under the pivot. The upper bound only ever
    /// comes down, so the first admissible candidate is the highest found.
    fn bisect_low(&mut self, pivot: Compressed) -> Result<Compressed, OptimizeError> {
        let lo = MIN_QUALITY;
        let mut hi = PIVOT_QUALITY;
        let mut smallest = pivot;

        for _ in 0..self.target.max_iterations {
            let quality = (lo + hi) / 2.0;
            match self.encode(quality) {
                Some(candidate) if candidate.size() <= self.target.max_bytes => {
                    return Ok(self.finish(candidate));
                }
                Some(candidate) => {
                    if candidate.size() < smallest.size() {
                        smallest = candidate;
                    }
                    hi = quality;
                }
                None => hi = quality,
            }
        }
        Ok(self.finish(smallest))
    }

    fn bisect_high(
        &mut self,
        top: Option<Compressed>,
        pivot: Option<Compressed>,
    ) -> Result<Compressed, OptimizeError> {
        let mut lo = PIVOT_QUALITY;
        let mut hi = MAX_QUALITY;
        let mut best: Option<Compressed> = None;
        // smallest over-budget candidate, used only if nothing fits
        let mut fallback: Option<Compressed> = None;

        for seed in [pivot, top].into_iter().flatten() {
            if seed.size() > self.target.max_bytes {
                keep_smallest(&mut fallback, seed);
            } else {
                self.offer(&mut best, seed);
            }
        }

        for _ in 0..self.target.max_iterations {
            let quality = (lo + hi) / 2.0;
            match self.encode(quality) {
                Some(candidate) if candidate.size() > self.target.max_bytes => {
                    hi = quality;
                    keep_smallest(&mut fallback, candidate);
                }
                Some(candidate) => {
                    lo = quality;
                    self.offer(&mut best, candidate);
                }
                None => hi = quality,
            }
        }

        match best.or(fallback) {
            Some(candidate) => Ok(self.finish(candidate)),
            None => Err(self.failure()),
        }
    }

    fn offer(&self, best: &mut Option<Compressed>, candidate: Compressed) {
        let improves = match best.as_ref() {
            None => true,
            Some(current) => {
                match (
                    self.target.contains(candidate.size()),
                    self.target.contains(current.size()),
                ) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => {
                        self.target.distance_to_midpoint(candidate.size())
                            < self.target.distance_to_midpoint(current.size())
                    }
                }
            }
        };
        if improves {
            *best = Some(candidate);
        }
    }
}

fn keep_smallest(slot: &mut Option<Compressed>, candidate: Compressed) {
    if slot.as_ref().is_none_or(|c| candidate.size() < c.size()) {
        *slot = Some(candidate);
    }
}
