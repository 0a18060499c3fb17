//! Deterministic cover typography.
//!
//! Crops and scales the accepted image to the cover canvas, then sets the
//! title and author in fixed safe zones. No model calls happen here; every
//! error is a processing or font error.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ab_glyph::{Font, FontVec, PxScale, ScaleFont, point};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};

use storyforge_ai::ImageAnalysis;

use super::CoverError;

pub const COVER_WIDTH: u32 = 1600;
pub const COVER_HEIGHT: u32 = 2400;

pub const DEFAULT_FONT_FAMILY: &str = "LibreBaskerville";

/// Soft limit for one title line before wrapping.
const TITLE_LINE_CHARS: usize = 16;

const GENRE_FONTS: &[(&[&str], &str)] = &[
    (&["fantasy", "myth", "epic"], "Cinzel"),
    (&["romance", "love"], "PlayfairDisplay"),
    (&["thriller", "mystery", "crime", "suspense"], "Oswald"),
    (&["science fiction", "sci-fi", "scifi", "cyberpunk", "space"], "Orbitron"),
    (&["horror", "gothic"], "Creepster"),
    (&["children", "kids", "picture"], "Fredoka"),
    (&["memoir", "biography", "history", "nonfiction", "non-fiction"], "Merriweather"),
];

/// Font family for a genre; unknown genres get [`DEFAULT_FONT_FAMILY`].
pub fn font_family_for_genre(genre: &str) -> &'static str {
    let genre = genre.trim().to_ascii_lowercase();
    GENRE_FONTS
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| genre.contains(k)))
        .map_or(DEFAULT_FONT_FAMILY, |(_, family)| family)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextColor {
    Light,
    Dark,
}

impl TextColor {
    /// Dark text on bright backgrounds, light text otherwise.
    pub fn for_luminance(luminance: f32) -> Self {
        if luminance > 0.5 {
            TextColor::Dark
        } else {
            TextColor::Light
        }
    }

    pub fn rgba(&self) -> Rgba<u8> {
        match self {
            TextColor::Light => Rgba([248, 246, 240, 255]),
            TextColor::Dark => Rgba([18, 18, 22, 255]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeZone {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SafeZone {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Where text may go on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverLayout {
    pub title: SafeZone,
    pub author: SafeZone,
}

impl CoverLayout {
    /// Title band across the upper quarter, author near the foot, 8% side margins.
    pub fn standard(width: u32, height: u32) -> Self {
        let margin = width * 8 / 100;
        let inner = width - 2 * margin;
        Self {
            title: SafeZone {
                x: margin,
                y: height * 6 / 100,
                width: inner,
                height: height * 22 / 100,
            },
            author: SafeZone {
                x: margin,
                y: height * 88 / 100,
                width: inner,
                height: height * 8 / 100,
            },
        }
    }
}

/// Greedy word wrap. Words longer than `max_chars` get a line of their own.
pub fn wrap_title(title: &str, max_chars: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in title.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Largest centred 2:3 window of a `width`x`height` image, as `(x, y, w, h)`.
pub fn cover_window(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let (crop_w, crop_h) = if width as u64 * 3 > height as u64 * 2 {
        (height * 2 / 3, height)
    } else {
        (width, width * 3 / 2)
    };
    let (crop_w, crop_h) = (crop_w.clamp(1, width.max(1)), crop_h.clamp(1, height.max(1)));
    ((width - crop_w.min(width)) / 2, (height - crop_h.min(height)) / 2, crop_w, crop_h)
}

/// Centre-crop to 2:3 and scale to the cover canvas.
pub fn fit_to_cover(image: &DynamicImage) -> RgbaImage {
    let (w, h) = image.dimensions();
    let (x, y, crop_w, crop_h) = cover_window(w, h);
    image
        .crop_imm(x, y, crop_w, crop_h)
        .resize_exact(COVER_WIDTH, COVER_HEIGHT, FilterType::Triangle)
        .to_rgba8()
}

/// Renders lines of text centred inside a zone.
pub trait Typesetter: Send + Sync {
    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        lines: &[String],
        family: &str,
        zone: SafeZone,
        color: Rgba<u8>,
    ) -> Result<(), CoverError>;
}

/// `ab_glyph` typesetter reading `<font_dir>/<family>.ttf` (or `.otf`).
///
/// A family without a font file falls back to [`DEFAULT_FONT_FAMILY`].
pub struct GlyphTypesetter {
    font_dir: PathBuf,
    fonts: Mutex<HashMap<String, Arc<FontVec>>>,
}

impl GlyphTypesetter {
    pub fn new(font_dir: impl Into<PathBuf>) -> Self {
        Self {
            font_dir: font_dir.into(),
            fonts: Mutex::new(HashMap::new()),
        }
    }

    fn font(&self, family: &str) -> Result<Arc<FontVec>, CoverError> {
        let mut fonts = self
            .fonts
            .lock()
            .map_err(|_| CoverError::Font("font cache lock poisoned".into()))?;
        for candidate in [family, DEFAULT_FONT_FAMILY] {
            if let Some(font) = fonts.get(candidate) {
                return Ok(font.clone());
            }
            if let Some(font) = self.load(candidate)? {
                let font = Arc::new(font);
                fonts.insert(candidate.to_string(), font.clone());
                return Ok(font);
            }
            tracing::debug!(family = candidate, dir = %self.font_dir.display(), "font family not found");
        }
        Err(CoverError::Font(format!(
            "no font file for {family:?} or {DEFAULT_FONT_FAMILY:?} in {}",
            self.font_dir.display()
        )))
    }

    fn load(&self, family: &str) -> Result<Option<FontVec>, CoverError> {
        for ext in ["ttf", "otf"] {
            let path = self.font_dir.join(format!("{family}.{ext}"));
            match std::fs::read(&path) {
                Ok(bytes) => {
                    return FontVec::try_from_vec(bytes)
                        .map(Some)
                        .map_err(|e| CoverError::Font(format!("{}: {e}", path.display())));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CoverError::Font(format!("{}: {e}", path.display()))),
            }
        }
        Ok(None)
    }
}

impl Typesetter for GlyphTypesetter {
    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        lines: &[String],
        family: &str,
        zone: SafeZone,
        color: Rgba<u8>,
    ) -> Result<(), CoverError> {
        if lines.is_empty() {
            return Ok(());
        }
        let font = self.font(family)?;
        let font: &FontVec = &font;

        // Start from the zone height and shrink until the widest line fits.
        let mut px = (zone.height as f32 / lines.len() as f32) * 0.8;
        loop {
            let scaled = font.as_scaled(PxScale::from(px));
            let widest = lines
                .iter()
                .map(|l| line_width(&scaled, l))
                .fold(0.0f32, f32::max);
            let total = scaled.height() * lines.len() as f32;
            if (widest <= zone.width as f32 && total <= zone.height as f32) || px <= 12.0 {
                break;
            }
            px *= 0.9;
        }

        let scaled = font.as_scaled(PxScale::from(px));
        let line_height = scaled.height() + scaled.line_gap();
        let block = line_height * lines.len() as f32 - scaled.line_gap();
        let top = zone.y as f32 + ((zone.height as f32 - block) / 2.0).max(0.0);

        for (i, line) in lines.iter().enumerate() {
            let width = line_width(&scaled, line);
            let mut caret = zone.x as f32 + ((zone.width as f32 - width) / 2.0).max(0.0);
            let baseline = top + scaled.ascent() + i as f32 * line_height;
            let mut previous = None;

            for ch in line.chars() {
                let id = scaled.glyph_id(ch);
                if let Some(prev) = previous {
                    caret += scaled.kern(prev, id);
                }
                let glyph = id.with_scale_and_position(px, point(caret, baseline));
                caret += scaled.h_advance(id);
                previous = Some(id);

                if let Some(outlined) = font.outline_glyph(glyph) {
                    let bounds = outlined.px_bounds();
                    outlined.draw(|gx, gy, coverage| {
                        let x = bounds.min.x as i64 + gx as i64;
                        let y = bounds.min.y as i64 + gy as i64;
                        if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
                            return;
                        }
                        blend(canvas.get_pixel_mut(x as u32, y as u32), color, coverage);
                    });
                }
            }
        }
        Ok(())
    }
}

fn line_width<F: Font, SF: ScaleFont<F>>(scaled: &SF, line: &str) -> f32 {
    let mut width = 0.0;
    let mut previous = None;
    for ch in line.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            width += scaled.kern(prev, id);
        }
        width += scaled.h_advance(id);
        previous = Some(id);
    }
    width
}

fn blend(pixel: &mut Rgba<u8>, color: Rgba<u8>, coverage: f32) {
    let alpha = coverage.clamp(0.0, 1.0) * color.0[3] as f32 / 255.0;
    for c in 0..3 {
        let under = pixel.0[c] as f32;
        pixel.0[c] = (under + (color.0[c] as f32 - under) * alpha).round() as u8;
    }
}

/// Fit `image` to the canvas and set the title (and author) on it. Returns PNG bytes.
pub fn compose_cover(
    image: &[u8],
    title: &str,
    author: Option<&str>,
    genre: &str,
    analysis: &ImageAnalysis,
    typesetter: &dyn Typesetter,
) -> Result<Vec<u8>, CoverError> {
    let decoded = image::load_from_memory(image)
        .map_err(|e| CoverError::Processing(format!("cannot decode accepted image: {e}")))?;
    let mut canvas = fit_to_cover(&decoded);

    let layout = CoverLayout::standard(COVER_WIDTH, COVER_HEIGHT);
    let color = TextColor::for_luminance(analysis.luminance()).rgba();
    let family = font_family_for_genre(genre);

    typesetter.draw_text(
        &mut canvas,
        &wrap_title(title, TITLE_LINE_CHARS),
        family,
        layout.title,
        color,
    )?;
    if let Some(author) = author.map(str::trim).filter(|a| !a.is_empty()) {
        typesetter.draw_text(&mut canvas, &[author.to_string()], family, layout.author, color)?;
    }

    let mut out = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| CoverError::Processing(format!("cannot encode cover: {e}")))?;
    Ok(out)
}
