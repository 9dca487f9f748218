//! Text-to-bitmap rendering seam.
//!
//! The pipeline consumes rendering as a pure `text -> bitmap` function
//! through [`Renderer`]. Bitmaps are a single line: fixed height, width
//! growing with the text.
//!
//! [`GlyphStripRenderer`] is a deterministic stand-in with one fixed-width
//! cell per character. It exists so the pipeline is self-contained; any
//! font rasterizer can replace it behind the trait.

use image::{GrayImage, Luma};

use crate::error::{VisionCotError, VisionCotResult};

/// Single-line grayscale raster of a reasoning trace (255 = background).
pub type Bitmap = GrayImage;

/// Renders text into a single-line bitmap.
pub trait Renderer: Send + Sync {
    /// Render `text`. Line breaks are flattened into the single line.
    fn render(&self, text: &str) -> VisionCotResult<Bitmap>;

    /// Fixed bitmap height in pixels.
    fn height(&self) -> u32;
}

/// Fixed-cell renderer drawing a deterministic ink pattern per character.
#[derive(Debug, Clone, Copy)]
pub struct GlyphStripRenderer {
    height: u32,
    cell_width: u32,
}

const INK: Luma<u8> = Luma([0]);
const BACKGROUND: Luma<u8> = Luma([255]);

impl GlyphStripRenderer {
    /// Create a renderer with the given line height and per-character width.
    pub fn new(height: u32, cell_width: u32) -> Self {
        Self {
            height: height.max(1),
            cell_width: cell_width.max(1),
        }
    }

    /// Width in pixels of one character cell.
    pub fn cell_width(&self) -> u32 {
        self.cell_width
    }

    fn glyph_bits(c: char) -> u64 {
        // splitmix64 over the code point
        let mut z = (c as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn draw_cell(&self, img: &mut GrayImage, index: u32, c: char) {
        if c.is_whitespace() {
            return;
        }
        let bits = Self::glyph_bits(c);
        let x0 = index * self.cell_width;
        // One pixel margin on every side keeps neighbouring glyphs separate.
        for y in 1..self.height.saturating_sub(1) {
            for x in 1..self.cell_width.saturating_sub(1) {
                let bit = (y * self.cell_width + x) % 64;
                if (bits >> bit) & 1 == 1 {
                    img.put_pixel(x0 + x, y, INK);
                }
            }
        }
    }
}

impl Default for GlyphStripRenderer {
    fn default() -> Self {
        Self::new(16, 8)
    }
}

impl Renderer for GlyphStripRenderer {
    fn render(&self, text: &str) -> VisionCotResult<Bitmap> {
        let chars: Vec<char> = text
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        let width = u32::try_from(chars.len())
            .ok()
            .and_then(|n| n.checked_mul(self.cell_width))
            .ok_or_else(|| {
                VisionCotError::InvalidInput(format!(
                    "Text of {} characters is too wide to render at {} px per cell",
                    chars.len(),
                    self.cell_width
                ))
            })?;

        let mut img = GrayImage::from_pixel(width, self.height, BACKGROUND);
        for (i, c) in chars.into_iter().enumerate() {
            self.draw_cell(&mut img, i as u32, c);
        }
        Ok(img)
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_tracks_characters() {
        let r = GlyphStripRenderer::new(16, 8);
        let img = r.render("abc").unwrap();
        assert_eq!(img.dimensions(), (24, 16));
    }

    #[test]
    fn test_deterministic() {
        let r = GlyphStripRenderer::default();
        assert_eq!(r.render("Step 1").unwrap(), r.render("Step 1").unwrap());
    }

    #[test]
    fn test_distinct_characters_differ() {
        let r = GlyphStripRenderer::default();
        assert_ne!(r.render("a").unwrap(), r.render("b").unwrap());
    }

    #[test]
    fn test_newlines_flattened() {
        let r = GlyphStripRenderer::default();
        assert_eq!(r.render("a\nb").unwrap(), r.render("a b").unwrap());
    }

    #[test]
    fn test_space_is_blank() {
        let r = GlyphStripRenderer::default();
        let img = r.render(" ").unwrap();
        assert!(img.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_overflowing_width_is_an_error() {
        let r = GlyphStripRenderer::new(1, u32::MAX);
        let err = r.render("ab").unwrap_err();
        assert!(matches!(err, VisionCotError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_text_has_zero_width() {
        let r = GlyphStripRenderer::default();
        assert_eq!(r.render("").unwrap().width(), 0);
    }
}
