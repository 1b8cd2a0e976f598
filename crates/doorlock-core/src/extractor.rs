// ── State extraction ──
//
// Turns a screen capture into an `Observation` by comparing the pixels
// of the calibrated indicator region against reference colours. Pure
// and stateless apart from the calibration it was built from.

use image::RgbImage;
use tracing::{debug, trace};

use crate::config::{Calibration, ReferencePattern, Region};
use crate::device::Screenshot;
use crate::model::{Observation, Signature};

#[derive(Debug, Clone)]
pub struct StateExtractor {
    region: Region,
    patterns: Vec<ReferencePattern>,
    tolerance: u8,
    match_threshold: f32,
}

impl StateExtractor {
    pub fn new(calibration: &Calibration) -> Self {
        Self {
            region: calibration.region,
            patterns: calibration.patterns.clone(),
            tolerance: calibration.tolerance,
            match_threshold: calibration.match_threshold,
        }
    }

    /// Classify a capture. Never fails: undecodable or empty input yields
    /// an UNKNOWN reading with zero confidence.
    pub fn extract(&self, shot: &Screenshot) -> Observation {
        if shot.png.is_empty() {
            return Observation::unknown(Signature::Empty);
        }
        let image = match image::load_from_memory(&shot.png) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(e) => {
                debug!(error = %e, bytes = shot.png.len(), "capture did not decode");
                return Observation::unknown(Signature::Empty);
            }
        };
        let (signature, confidence) = self.classify(&image);
        let mut observation = Observation::from_screen(signature, confidence);
        observation.observed_at = shot.captured_at;
        observation
    }

    /// Best-matching signature and the fraction of region pixels that
    /// agreed with it.
    pub fn classify(&self, image: &RgbImage) -> (Signature, f32) {
        let Some((x0, y0, x1, y1)) = clip(self.region, image.width(), image.height()) else {
            return (Signature::Empty, 0.0);
        };
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let total = ((x1 - x0) * (y1 - y0)) as f32;

        let mut counts = vec![0u32; self.patterns.len()];
        let mut sum = [0u64; 3];
        for y in y0..y1 {
            for x in x0..x1 {
                let pixel = image.get_pixel(x, y).0;
                for (channel, value) in sum.iter_mut().zip(pixel) {
                    *channel += u64::from(value);
                }
                for (count, pattern) in counts.iter_mut().zip(&self.patterns) {
                    if within(pixel, pattern.rgb, self.tolerance) {
                        *count += 1;
                    }
                }
            }
        }
        trace!(
            mean = ?sum.map(|c| c / u64::from((x1 - x0) * (y1 - y0))),
            "indicator region mean colour"
        );

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let best = counts
            .iter()
            .zip(&self.patterns)
            .map(|(count, pattern)| (pattern.signature, *count as f32 / total))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((signature, fraction)) if fraction >= self.match_threshold => {
                (signature, fraction)
            }
            Some((_, fraction)) => (Signature::Unmatched, fraction),
            None => (Signature::Unmatched, 0.0),
        }
    }
}

/// Intersect the region with the image bounds. `None` when nothing is left.
fn clip(region: Region, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = region.x.min(width);
    let y0 = region.y.min(height);
    let x1 = region.x.saturating_add(region.width).min(width);
    let y1 = region.y.saturating_add(region.height).min(height);
    (x1 > x0 && y1 > y0).then_some((x0, y0, x1, y1))
}

fn within(pixel: [u8; 3], reference: [u8; 3], tolerance: u8) -> bool {
    pixel
        .iter()
        .zip(reference)
        .all(|(p, r)| p.abs_diff(r) <= tolerance)
}
