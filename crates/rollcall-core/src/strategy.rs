//! Detection strategies tried in order when a frame yields no usable face.
//!
//! Classroom photos arrive at arbitrary orientations and exposure levels, so
//! a single detection pass misses real faces. The ladder runs each strategy's
//! transform through detect+embed and stops at the first one that produces at
//! least one embedding.

use image::DynamicImage;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Contrast adjustment applied by [`DetectionStrategy::EnhancedContrast`].
const CONTRAST_BOOST: f32 = 30.0;
/// Brightness offset applied by [`DetectionStrategy::EnhancedContrast`].
const BRIGHTNESS_BOOST: i32 = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown detection strategy '{0}'")]
pub struct ParseStrategyError(String);

/// One image transform to run detection against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStrategy {
    /// Contrast/brightness boost; helps underexposed classroom shots.
    EnhancedContrast,
    /// The frame as submitted.
    Original,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl DetectionStrategy {
    /// Produce the image this strategy wants detection to run on.
    pub fn apply(&self, image: &DynamicImage) -> DynamicImage {
        match self {
            Self::EnhancedContrast => image.adjust_contrast(CONTRAST_BOOST).brighten(BRIGHTNESS_BOOST),
            Self::Original => image.clone(),
            Self::Rotate90 => image.rotate90(),
            Self::Rotate180 => image.rotate180(),
            Self::Rotate270 => image.rotate270(),
        }
    }

    /// The default ladder: enhanced pass first, then the untouched frame,
    /// then the three quarter-turn rotations.
    pub fn default_ladder() -> Vec<DetectionStrategy> {
        vec![
            Self::EnhancedContrast,
            Self::Original,
            Self::Rotate90,
            Self::Rotate180,
            Self::Rotate270,
        ]
    }
}

impl fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnhancedContrast => "enhanced",
            Self::Original => "original",
            Self::Rotate90 => "rotate90",
            Self::Rotate180 => "rotate180",
            Self::Rotate270 => "rotate270",
        };
        f.write_str(name)
    }
}

impl FromStr for DetectionStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "enhanced" => Ok(Self::EnhancedContrast),
            "original" => Ok(Self::Original),
            "rotate90" => Ok(Self::Rotate90),
            "rotate180" => Ok(Self::Rotate180),
            "rotate270" => Ok(Self::Rotate270),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

/// Parse a comma-separated ladder, e.g. `"enhanced,original,rotate90"`.
pub fn parse_ladder(raw: &str) -> Result<Vec<DetectionStrategy>, ParseStrategyError> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(DetectionStrategy::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn uniform(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([value; 3])))
    }

    #[test]
    fn test_original_preserves_dimensions() {
        let img = uniform(320, 240, 100);
        let out = DetectionStrategy::Original.apply(&img);
        assert_eq!((out.width(), out.height()), (320, 240));
    }

    #[test]
    fn test_quarter_rotations_swap_dimensions() {
        let img = uniform(320, 240, 100);
        for strategy in [DetectionStrategy::Rotate90, DetectionStrategy::Rotate270] {
            let out = strategy.apply(&img);
            assert_eq!((out.width(), out.height()), (240, 320), "{strategy}");
        }
        let out = DetectionStrategy::Rotate180.apply(&img);
        assert_eq!((out.width(), out.height()), (320, 240));
    }

    #[test]
    fn test_enhanced_contrast_brightens_midtones() {
        let img = uniform(8, 8, 120);
        let out = DetectionStrategy::EnhancedContrast.apply(&img).to_rgb8();
        assert!(out.get_pixel(0, 0)[0] > 120);
    }

    #[test]
    fn test_default_ladder_order() {
        let ladder = DetectionStrategy::default_ladder();
        assert_eq!(ladder[0], DetectionStrategy::EnhancedContrast);
        assert_eq!(ladder[1], DetectionStrategy::Original);
        assert_eq!(ladder.len(), 5);
    }

    #[test]
    fn test_parse_ladder() {
        let ladder = parse_ladder("enhanced, original,rotate180").unwrap();
        assert_eq!(
            ladder,
            vec![
                DetectionStrategy::EnhancedContrast,
                DetectionStrategy::Original,
                DetectionStrategy::Rotate180,
            ]
        );
    }

    #[test]
    fn test_parse_ladder_rejects_unknown() {
        assert!(parse_ladder("original,flip").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for strategy in DetectionStrategy::default_ladder() {
            let parsed: DetectionStrategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
    }
}
