//! Compound paths.

use crate::Plot;
use crate::bezier::{cubic_bezier_into, quad_bezier_into};
use crate::line::plot_line_into;

/// One sub-segment of a compound path. Coordinates are absolute; each
/// segment starts where the previous one ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Line { x0: i32, y0: i32, x1: i32, y1: i32 },
    Quad { x0: i32, y0: i32, cx: i32, cy: i32, x1: i32, y1: i32 },
    Cubic { x0: i32, y0: i32, c1x: i32, c1y: i32, c2x: i32, c2y: i32, x1: i32, y1: i32 },
}

impl Segment {
    pub fn start(&self) -> (i32, i32) {
        match *self {
            Segment::Line { x0, y0, .. } => (x0, y0),
            Segment::Quad { x0, y0, .. } => (x0, y0),
            Segment::Cubic { x0, y0, .. } => (x0, y0),
        }
    }

    fn plot_into(&self, out: &mut Vec<Plot>) {
        match *self {
            Segment::Line { x0, y0, x1, y1 } => plot_line_into(x0, y0, x1, y1, out),
            Segment::Quad { x0, y0, cx, cy, x1, y1 } => quad_bezier_into(x0, y0, cx, cy, x1, y1, out),
            Segment::Cubic {
                x0,
                y0,
                c1x,
                c1y,
                c2x,
                c2y,
                x1,
                y1,
            } => cubic_bezier_into(x0, y0, c1x, c1y, c2x, c2y, x1, y1, out),
        }
    }
}

/// Splice the plots of each sub-segment. A segment's first point is skipped
/// when it repeats the previous segment's last point, so joints do not
/// produce zero-length runs downstream.
pub fn plot_path(segments: &[Segment]) -> impl Iterator<Item = Plot> + use<> {
    let mut out: Vec<Plot> = Vec::new();
    for segment in segments {
        let joint = out.last().copied();
        let from = out.len();
        segment.plot_into(&mut out);
        if let (Some((jx, jy, _)), Some(&(fx, fy, _))) = (joint, out.get(from))
            && (jx, jy) == (fx, fy)
        {
            out.remove(from);
        }
    }
    out.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splices_segments_without_duplicate_joints() {
        let path = [
            Segment::Line { x0: 0, y0: 0, x1: 4, y1: 0 },
            Segment::Line { x0: 4, y0: 0, x1: 4, y1: 3 },
        ];
        let pts: Vec<_> = plot_path(&path).collect();
        assert_eq!(pts.first(), Some(&(0, 0, 1)));
        assert_eq!(pts.last(), Some(&(4, 3, 1)));
        let fours = pts.iter().filter(|p| (p.0, p.1) == (4, 0)).count();
        assert_eq!(fours, 1, "joint plotted twice: {pts:?}");
        assert_eq!(pts.len(), 8);
    }

    #[test]
    fn mixed_segment_kinds_stay_contiguous() {
        let path = [
            Segment::Line { x0: 0, y0: 0, x1: 5, y1: 0 },
            Segment::Quad { x0: 5, y0: 0, cx: 10, cy: 0, x1: 10, y1: 5 },
            Segment::Cubic {
                x0: 10,
                y0: 5,
                c1x: 10,
                c1y: 10,
                c2x: 5,
                c2y: 10,
                x1: 0,
                y1: 10,
            },
        ];
        let pts: Vec<_> = plot_path(&path).collect();
        for pair in pts.windows(2) {
            let dx = (pair[1].0 - pair[0].0).abs();
            let dy = (pair[1].1 - pair[0].1).abs();
            assert!(dx <= 1 && dy <= 1, "gap between {:?} and {:?}", pair[0], pair[1]);
        }
        assert_eq!(pts.last().map(|p| (p.0, p.1)), Some((0, 10)));
    }

    #[test]
    fn empty_path_plots_nothing() {
        assert_eq!(plot_path(&[]).count(), 0);
    }
}
