//! Local stand-in for a vision model: samples the band the title sits on.

use async_trait::async_trait;

use storyforge_ai::{AiError, AiResult, ImageAnalysis, ImageAnalyzer};

use super::typography::cover_window;

/// Averages the colour of the top `band` fraction of the cover window,
/// the same 2:3 crop the typography stage lays text over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaAnalyzer {
    pub band: f32,
}

impl Default for LumaAnalyzer {
    fn default() -> Self {
        Self { band: 0.3 }
    }
}

impl LumaAnalyzer {
    fn dominant(&self, bytes: &[u8]) -> AiResult<[u8; 3]> {
        let rgb = image::load_from_memory(bytes)
            .map_err(|e| AiError::InvalidInput(format!("cannot decode image: {e}")))?
            .to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(AiError::InvalidInput("image has no pixels".into()));
        }

        let (x0, y0, w, h) = cover_window(rgb.width(), rgb.height());
        let band = f64::from(self.band.clamp(0.05, 1.0));
        let rows = ((f64::from(h) * band).round() as u32).clamp(1, h);

        let mut sum = [0u64; 3];
        let mut n = 0u64;
        for y in y0..y0 + rows {
            for x in x0..x0 + w {
                let p = rgb.get_pixel(x, y).0;
                sum[0] += p[0] as u64;
                sum[1] += p[1] as u64;
                sum[2] += p[2] as u64;
                n += 1;
            }
        }
        if n == 0 {
            return Err(AiError::InvalidInput("image has no pixels".into()));
        }
        Ok([(sum[0] / n) as u8, (sum[1] / n) as u8, (sum[2] / n) as u8])
    }
}

#[async_trait]
impl ImageAnalyzer for LumaAnalyzer {
    async fn analyze(&self, image: &[u8]) -> AiResult<ImageAnalysis> {
        let analyzer = *self;
        let bytes = image.to_vec();
        let dominant_color = tokio::task::spawn_blocking(move || analyzer.dominant(&bytes))
            .await
            .map_err(|e| AiError::InvalidInput(format!("analysis task failed: {e}")))??;
        Ok(ImageAnalysis { dominant_color })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_png, solid_png};
    use image::{Rgb, RgbImage};

    #[tokio::test]
    async fn samples_only_the_title_band() {
        // Dark top, bright bottom.
        let img = RgbImage::from_fn(100, 100, |_, y| if y < 30 { Rgb([10, 10, 10]) } else { Rgb([250, 250, 250]) });
        let analysis = LumaAnalyzer::default().analyze(&encode_png(&img)).await.unwrap();
        assert_eq!(analysis.dominant_color, [10, 10, 10]);
        assert!(analysis.luminance() < 0.1);
    }

    #[tokio::test]
    async fn tall_images_are_sampled_inside_the_crop() {
        // 100x300 crops to rows 75..225; its title band is rows 75..120.
        let img = RgbImage::from_fn(100, 300, |_, y| {
            if (75..120).contains(&y) { Rgb([10, 10, 10]) } else { Rgb([250, 250, 250]) }
        });
        let analysis = LumaAnalyzer::default().analyze(&encode_png(&img)).await.unwrap();
        assert_eq!(analysis.dominant_color, [10, 10, 10]);
    }

    #[tokio::test]
    async fn wide_images_ignore_the_cropped_sides() {
        // 300x100 crops to columns 117..183.
        let img = RgbImage::from_fn(300, 100, |x, _| {
            if (117..183).contains(&x) { Rgb([240, 240, 240]) } else { Rgb([0, 0, 0]) }
        });
        let analysis = LumaAnalyzer::default().analyze(&encode_png(&img)).await.unwrap();
        assert_eq!(analysis.dominant_color, [240, 240, 240]);
    }

    #[tokio::test]
    async fn bright_images_read_as_bright() {
        let analysis = LumaAnalyzer::default().analyze(&solid_png(64, 96, 240)).await.unwrap();
        assert!(analysis.luminance() > 0.9);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_invalid_input() {
        let err = LumaAnalyzer::default().analyze(b"nope").await.unwrap_err();
        assert!(matches!(err, AiError::InvalidInput(_)));
    }
}
