//! Automated image checks run before an image is accepted as cover art.

use image::GenericImageView;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

impl QualityVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a generated image is good enough to put a title on.
pub trait QualityGate: Send + Sync {
    fn check(&self, image: &[u8]) -> QualityVerdict;
}

/// Local pixel heuristics; no model call.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicQualityGate {
    pub min_width: u32,
    pub min_height: u32,
    /// Accepted width/height range; covers are portrait or square.
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Luma standard deviation below this is a blank or flat image.
    pub min_luma_stddev: f32,
    pub min_mean_luma: f32,
    pub max_mean_luma: f32,
}

impl Default for HeuristicQualityGate {
    fn default() -> Self {
        Self {
            min_width: 512,
            min_height: 512,
            min_aspect: 0.55,
            max_aspect: 1.05,
            min_luma_stddev: 12.0,
            min_mean_luma: 20.0,
            max_mean_luma: 235.0,
        }
    }
}

impl QualityGate for HeuristicQualityGate {
    fn check(&self, bytes: &[u8]) -> QualityVerdict {
        let img = match image::load_from_memory(bytes) {
            Ok(img) => img,
            Err(e) => return QualityVerdict::reject(format!("image could not be decoded: {e}")),
        };

        let (w, h) = img.dimensions();
        if w < self.min_width || h < self.min_height {
            return QualityVerdict::reject(format!(
                "resolution {w}x{h} below minimum {}x{}",
                self.min_width, self.min_height
            ));
        }

        let aspect = w as f32 / h as f32;
        if aspect < self.min_aspect || aspect > self.max_aspect {
            return QualityVerdict::reject(format!("aspect ratio {aspect:.2} is not a cover shape"));
        }

        let (mean, stddev) = luma_stats(&img.to_luma8());
        if stddev < self.min_luma_stddev {
            return QualityVerdict::reject(format!("image is nearly uniform (luma stddev {stddev:.1})"));
        }
        if mean < self.min_mean_luma {
            return QualityVerdict::reject(format!("image is too dark (mean luma {mean:.1})"));
        }
        if mean > self.max_mean_luma {
            return QualityVerdict::reject(format!("image is blown out (mean luma {mean:.1})"));
        }

        QualityVerdict::pass()
    }
}

fn luma_stats(luma: &image::GrayImage) -> (f32, f32) {
    let n = (luma.width() as f64) * (luma.height() as f64);
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sum_sq) = luma.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean as f32, variance.sqrt() as f32)
}
