//! Where the visible signature goes on the page.
//!
//! The bottom of the page is split in four quadrants, one per recipient
//! position, all in PDF user space with the origin at the bottom left.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const BOTTOM_MARGIN: f32 = 25.0;
pub const SIDE_MARGIN: f32 = 13.0;
pub const GAP: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Position {
    Left,
    CenterLeft,
    CenterRight,
    Right,
}

impl Position {
    pub const ALL: [Position; 4] = [
        Position::Left,
        Position::CenterLeft,
        Position::CenterRight,
        Position::Right,
    ];

    pub fn quadrant(self) -> usize {
        match self {
            Position::Left => 0,
            Position::CenterLeft => 1,
            Position::CenterRight => 2,
            Position::Right => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Position::Left => "LEFT",
            Position::CenterLeft => "CENTER-LEFT",
            Position::CenterRight => "CENTER-RIGHT",
            Position::Right => "RIGHT",
        }
    }

    /// Left edge of this quadrant on a page of the given width.
    pub fn left_edge(self, page_width: f32) -> f32 {
        let k = self.quadrant() as f32;
        SIDE_MARGIN + k * (quadrant_width(page_width) + SIDE_MARGIN + GAP)
    }

    /// The position whose quadrant starts at `x`, if any.
    pub fn from_left_edge(page_width: f32, x: f32) -> Option<Position> {
        Position::ALL
            .into_iter()
            .find(|p| (p.left_edge(page_width) - x).abs() < 0.5)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown signature position {0:?}")]
pub struct UnknownPosition(String);

impl FromStr for Position {
    type Err = UnknownPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "left" => Ok(Position::Left),
            "center-left" => Ok(Position::CenterLeft),
            "center-right" => Ok(Position::CenterRight),
            "right" => Ok(Position::Right),
            _ => Err(UnknownPosition(s.to_string())),
        }
    }
}

pub fn quadrant_width(page_width: f32) -> f32 {
    page_width / 4.0 - 20.0
}

/// Signature rectangle `[x0, y0, x1, y1]` for an image of the given size.
pub fn signature_box(
    page_width: f32,
    image_width: u32,
    image_height: u32,
    position: Position,
) -> [f32; 4] {
    let width = quadrant_width(page_width);
    let image_width = image_width as f32;
    let scale = width.min(image_width) / width.max(image_width);
    let height = image_height as f32 * scale;
    let x = position.left_edge(page_width);
    [x, BOTTOM_MARGIN, x + width, BOTTOM_MARGIN + height]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_quadrants() {
        // 612 / 4 - 20 = 133
        assert_eq!(quadrant_width(612.0), 133.0);
        let edges: Vec<f32> = Position::ALL.iter().map(|p| p.left_edge(612.0)).collect();
        assert_eq!(edges, [13.0, 164.0, 315.0, 466.0]);
    }

    #[test]
    fn box_keeps_image_ratio_when_shrinking() {
        let rect = signature_box(612.0, 266, 100, Position::Right);
        assert_eq!(rect, [466.0, 25.0, 599.0, 75.0]);
    }

    #[test]
    fn small_images_use_the_inverse_ratio() {
        // scale = 100 / 133
        let rect = signature_box(612.0, 100, 133, Position::Left);
        assert_eq!(rect[0], 13.0);
        assert!((rect[3] - (25.0 + 100.0)).abs() < 0.01);
    }

    #[test]
    fn parse_and_locate() {
        assert_eq!("center_left".parse::<Position>().unwrap(), Position::CenterLeft);
        assert_eq!("RIGHT".parse::<Position>().unwrap(), Position::Right);
        assert!("top".parse::<Position>().is_err());
        assert_eq!(Position::from_left_edge(612.0, 315.0), Some(Position::CenterRight));
        assert_eq!(Position::from_left_edge(612.0, 200.0), None);
    }
}
