//! Canvas layout entries and automatic layouts

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::params::LayoutMode;
use crate::error::{EngineError, EngineResult};
use crate::types::{StreamType, UserId};

pub const MIN_Z_ORDER: u32 = 1;
pub const MAX_Z_ORDER: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillMode {
    /// Cover the rectangle, cropping the source
    Fill,
    /// Show the whole source, letterboxing the rest
    #[default]
    Fit,
}

/// Placement of one source on the canvas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub user_id: UserId,
    pub stream_type: StreamType,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Higher values are drawn later and cover lower ones
    pub z_order: u32,
    pub fill_mode: FillMode,
    /// Letterbox color (0xRRGGBB); the canvas background when unset
    pub color: Option<u32>,
}

impl LayoutEntry {
    pub fn new(user_id: impl Into<UserId>, stream_type: StreamType, x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            user_id: user_id.into(),
            stream_type,
            x,
            y,
            width,
            height,
            z_order: MIN_Z_ORDER,
            fill_mode: FillMode::Fit,
            color: None,
        }
    }

    pub fn validate(&self, canvas_width: u32, canvas_height: u32) -> EngineResult<()> {
        if !self.stream_type.is_video() {
            return Err(EngineError::invalid_parameter(format!(
                "layout of {} names non-video stream {}",
                self.user_id, self.stream_type
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::invalid_parameter(format!(
                "layout of {} has no area",
                self.user_id
            )));
        }
        let right = u64::from(self.x) + u64::from(self.width);
        let bottom = u64::from(self.y) + u64::from(self.height);
        if right > u64::from(canvas_width) || bottom > u64::from(canvas_height) {
            return Err(EngineError::invalid_parameter(format!(
                "layout of {} leaves the {canvas_width}x{canvas_height} canvas",
                self.user_id
            )));
        }
        if !(MIN_Z_ORDER..=MAX_Z_ORDER).contains(&self.z_order) {
            return Err(EngineError::invalid_parameter(format!(
                "z order {} is outside {MIN_Z_ORDER}..={MAX_Z_ORDER}",
                self.z_order
            )));
        }
        if self.color.is_some_and(|c| c > 0x00FF_FFFF) {
            return Err(EngineError::invalid_parameter("layout color is 0xRRGGBB"));
        }
        Ok(())
    }
}

/// Validate a full layout set; rejects the whole set on any bad entry
pub fn validate_layout(entries: &[LayoutEntry], canvas_width: u32, canvas_height: u32) -> EngineResult<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        entry.validate(canvas_width, canvas_height)?;
        if !seen.insert((&entry.user_id, entry.stream_type)) {
            return Err(EngineError::invalid_parameter(format!(
                "{} {} appears twice in the layout",
                entry.user_id, entry.stream_type
            )));
        }
    }
    Ok(())
}

/// Drawing order: ascending z, ties keep their position in the set
#[must_use]
pub fn paint_order(entries: &[LayoutEntry]) -> Vec<LayoutEntry> {
    let mut ordered = entries.to_vec();
    ordered.sort_by_key(|e| e.z_order);
    ordered
}

/// Cell grid (columns, rows) of an automatic layout with `cells` slots
#[must_use]
pub fn grid_shape(mode: LayoutMode, cells: u32) -> (u32, u32) {
    let cells = cells.max(1);
    match mode {
        LayoutMode::LinearHorizontal => (cells, 1),
        LayoutMode::LinearVertical => (1, cells),
        LayoutMode::SpeedDial | LayoutMode::Manual => {
            let target = u64::from(cells);
            let mut cols: u64 = 1;
            while cols * cols < target {
                cols += 1;
            }
            let cols = u32::try_from(cols).unwrap_or(u32::MAX);
            (cols, cells.div_ceil(cols))
        }
    }
}

/// Compute the layout of an automatic mode
///
/// `sources` are the participants' video streams in join order. With
/// `max_layout_count == 0` the grid is sized to the sources; otherwise it
/// has exactly that many cells and extra sources are left out.
#[must_use]
pub fn auto_layout(
    mode: LayoutMode,
    canvas_width: u32,
    canvas_height: u32,
    max_layout_count: u32,
    sources: &[(UserId, StreamType)],
) -> Vec<LayoutEntry> {
    if mode == LayoutMode::Manual || sources.is_empty() {
        return Vec::new();
    }
    let cells = if max_layout_count == 0 {
        u32::try_from(sources.len()).unwrap_or(u32::MAX)
    } else {
        max_layout_count
    };
    let (cols, rows) = grid_shape(mode, cells);
    let (cell_w, cell_h) = (canvas_width / cols, canvas_height / rows);
    if cell_w == 0 || cell_h == 0 {
        return Vec::new();
    }

    sources
        .iter()
        .take(cells as usize)
        .enumerate()
        .map(|(i, (user_id, stream_type))| {
            let i = u32::try_from(i).unwrap_or(u32::MAX);
            LayoutEntry::new(
                user_id.clone(),
                *stream_type,
                (i % cols) * cell_w,
                (i / cols) * cell_h,
                cell_w,
                cell_h,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(n: usize) -> Vec<(UserId, StreamType)> {
        (0..n)
            .map(|i| (UserId::new(format!("u{i}")), StreamType::VideoHigh))
            .collect()
    }

    #[test]
    fn test_validate_rejects_out_of_canvas_and_bad_z() {
        let mut entry = LayoutEntry::new("a", StreamType::VideoHigh, 300, 0, 100, 100);
        assert!(entry.validate(320, 240).is_err());
        entry.x = 220;
        assert!(entry.validate(320, 240).is_ok());
        entry.z_order = 101;
        assert!(entry.validate(320, 240).is_err());
        entry.z_order = 0;
        assert!(entry.validate(320, 240).is_err());
    }

    #[test]
    fn test_validate_layout_rejects_duplicates() {
        let a = LayoutEntry::new("a", StreamType::VideoHigh, 0, 0, 16, 16);
        assert!(validate_layout(&[a.clone(), a], 64, 64).is_err());
    }

    #[test]
    fn test_speed_dial_grid() {
        assert_eq!(grid_shape(LayoutMode::SpeedDial, 5), (3, 2));
        assert_eq!(grid_shape(LayoutMode::SpeedDial, 4), (2, 2));
        assert_eq!(grid_shape(LayoutMode::SpeedDial, 1), (1, 1));
        assert_eq!(grid_shape(LayoutMode::SpeedDial, 0), (1, 1));

        let layout = auto_layout(LayoutMode::SpeedDial, 300, 200, 5, &sources(2));
        assert_eq!(layout.len(), 2);
        assert_eq!((layout[1].x, layout[1].y, layout[1].width, layout[1].height), (100, 0, 100, 100));
    }

    #[test]
    fn test_huge_cell_counts_do_not_overflow() {
        assert_eq!(grid_shape(LayoutMode::SpeedDial, u32::MAX), (65_536, 65_536));
        assert_eq!(grid_shape(LayoutMode::Manual, u32::MAX - 1), (65_536, 65_536));
        assert_eq!(grid_shape(LayoutMode::LinearHorizontal, u32::MAX), (u32::MAX, 1));
        assert!(auto_layout(LayoutMode::SpeedDial, 640, 480, u32::MAX, &sources(3)).is_empty());
    }

    #[test]
    fn test_linear_layouts_follow_join_order() {
        let horizontal = auto_layout(LayoutMode::LinearHorizontal, 500, 100, 5, &sources(2));
        assert_eq!(horizontal[0].x, 0);
        assert_eq!(horizontal[1].x, 100);
        assert_eq!(horizontal[1].width, 100);

        let vertical = auto_layout(LayoutMode::LinearVertical, 90, 300, 0, &sources(3));
        assert_eq!(vertical.iter().map(|e| e.y).collect::<Vec<_>>(), vec![0, 100, 200]);
    }

    #[test]
    fn test_fixed_count_drops_extra_sources() {
        let layout = auto_layout(LayoutMode::LinearHorizontal, 200, 100, 2, &sources(4));
        assert_eq!(layout.len(), 2);
        assert!(auto_layout(LayoutMode::Manual, 200, 100, 2, &sources(4)).is_empty());
    }

    #[test]
    fn test_paint_order_is_stable() {
        let mut low = LayoutEntry::new("low", StreamType::VideoHigh, 0, 0, 16, 16);
        low.z_order = 5;
        let first = LayoutEntry::new("first", StreamType::VideoHigh, 0, 0, 16, 16);
        let second = LayoutEntry::new("second", StreamType::VideoHigh, 0, 0, 16, 16);
        let order: Vec<String> = paint_order(&[low, first, second])
            .into_iter()
            .map(|e| e.user_id.to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "low"]);
    }
}
