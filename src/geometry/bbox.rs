use crate::geometry::element::{Element, GridDataElement, RectangleElement};
use serde::{Deserialize, Serialize};

/// The axis-aligned bounding box of an element, plus a complexity metric
/// (`details`, the number of points defining the element) and the length of
/// the box's x-y diagonal (`size`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub lowx: f64,
    pub lowy: f64,
    pub lowz: f64,
    pub highx: f64,
    pub highy: f64,
    pub highz: f64,
    pub size: f64,
    pub details: i64,
}

/// Computes bounding box information for an element. Points have no spatial
/// extent, so they get a small non-zero-area region centered on them.
pub fn bounding_box(element: &Element) -> Bbox {
    match element {
        Element::Point(point) => from_center(point.center, 0.5, 0.5, 1),
        Element::Arrow(arrow) => from_points(arrow.points.iter().copied()),
        Element::Circle(circle) => from_center(circle.center, circle.radius, circle.radius, 4),
        Element::Polyline(line) => from_points(line.points.iter().copied()),
        Element::Rectangle(rect) | Element::Ellipse(rect) => from_rectangle(rect),
        Element::RectangleGrid(grid) => from_rectangle(&RectangleElement {
            base: grid.base.clone(),
            center: grid.center,
            width: grid.width,
            height: grid.height,
            rotation: grid.rotation,
            normal: grid.normal,
        }),
        Element::Heatmap(heatmap) => from_points(heatmap.points.iter().map(|p| [p[0], p[1], p[2]])),
        Element::GridData(grid) => from_grid(grid),
    }
}

fn finish(lowx: f64, lowy: f64, lowz: f64, highx: f64, highy: f64, highz: f64, details: i64) -> Bbox {
    let size = ((highx - lowx).powi(2) + (highy - lowy).powi(2)).sqrt();
    Bbox {
        lowx,
        lowy,
        lowz,
        highx,
        highy,
        highz,
        size,
        details,
    }
}

fn from_points(points: impl Iterator<Item = [f64; 3]>) -> Bbox {
    let mut count: i64 = 0;
    let mut low = [f64::INFINITY; 3];
    let mut high = [f64::NEG_INFINITY; 3];
    for point in points {
        count += 1;
        for axis in 0..3 {
            low[axis] = low[axis].min(point[axis]);
            high[axis] = high[axis].max(point[axis]);
        }
    }
    if count == 0 {
        return finish(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1);
    }
    finish(low[0], low[1], low[2], high[0], high[1], high[2], count)
}

fn from_center(center: [f64; 3], half_width: f64, half_height: f64, details: i64) -> Bbox {
    finish(
        center[0] - half_width,
        center[1] - half_height,
        center[2],
        center[0] + half_width,
        center[1] + half_height,
        center[2],
        details,
    )
}

fn from_rectangle(rect: &RectangleElement) -> Bbox {
    let mut half_width = rect.width * 0.5;
    let mut half_height = rect.height * 0.5;
    if let Some(rotation) = rect.rotation.filter(|&rotation| rotation != 0.0) {
        let abs_sin = rotation.sin().abs();
        let abs_cos = rotation.cos().abs();
        (half_width, half_height) = (
            (abs_cos * half_width).max(abs_sin * half_height),
            (abs_sin * half_width).max(abs_cos * half_height),
        );
    }
    from_center(rect.center, half_width, half_height, 4)
}

fn from_grid(grid: &GridDataElement) -> Bbox {
    let origin = grid.origin.unwrap_or_default();
    let dx = grid.dx.unwrap_or(1.0);
    let dy = grid.dy.unwrap_or(1.0);
    let width = grid.grid_width.max(1);
    let len = grid.values.len() as i64;
    let rows = ((len + width - 1) / width).max(1);
    finish(
        origin[0],
        origin[1],
        origin[2],
        origin[0] + dx * (width - 1) as f64,
        origin[1] + dy * (rows - 1) as f64,
        origin[2],
        (grid.values.len() as i64).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(value: serde_json::Value) -> Element {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn rectangle_diagonal() {
        let bbox = bounding_box(&element(json!({
            "type": "rectangle", "center": [20, 25, 0], "width": 14, "height": 15,
        })));
        assert_eq!(bbox.lowx, 13.0);
        assert_eq!(bbox.highx, 27.0);
        assert_eq!(bbox.lowy, 17.5);
        assert_eq!(bbox.highy, 32.5);
        assert_eq!(bbox.details, 4);
        assert!((bbox.size - (14.0_f64.powi(2) + 15.0_f64.powi(2)).sqrt()).abs() < 1e-9);
        assert!((bbox.size - 20.5183).abs() < 1e-4);
    }

    #[test]
    fn rotated_rectangle_bounds_tighten() {
        let quarter_turn = bounding_box(&element(json!({
            "type": "rectangle",
            "center": [0, 0, 0],
            "width": 10,
            "height": 2,
            "rotation": std::f64::consts::FRAC_PI_2,
        })));
        // A quarter turn swaps the extents.
        assert!((quarter_turn.highx - 1.0).abs() < 1e-9);
        assert!((quarter_turn.highy - 5.0).abs() < 1e-9);

        let eighth_turn = bounding_box(&element(json!({
            "type": "rectangle",
            "center": [0, 0, 0],
            "width": 10,
            "height": 10,
            "rotation": std::f64::consts::FRAC_PI_4,
        })));
        assert!((eighth_turn.highx - 5.0 * 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn circle_is_a_square_box() {
        let bbox = bounding_box(&element(json!({
            "type": "circle", "center": [10, 10, 0], "radius": 3,
        })));
        assert_eq!((bbox.lowx, bbox.lowy, bbox.highx, bbox.highy), (7.0, 7.0, 13.0, 13.0));
        assert_eq!(bbox.details, 4);
    }

    #[test]
    fn point_gets_degenerate_extent() {
        let bbox = bounding_box(&element(json!({
            "type": "point", "center": [5, 6, 7],
        })));
        assert_eq!((bbox.lowx, bbox.highx), (4.5, 5.5));
        assert_eq!((bbox.lowy, bbox.highy), (5.5, 6.5));
        assert_eq!((bbox.lowz, bbox.highz), (7.0, 7.0));
        assert_eq!(bbox.details, 1);
        assert!((bbox.size - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn polyline_details_count_points() {
        let bbox = bounding_box(&element(json!({
            "type": "polyline",
            "points": [[0, 0, 0], [10, 0, 0], [10, 20, 2], [0, 20, 0]],
            "closed": true,
        })));
        assert_eq!(bbox.details, 4);
        assert_eq!((bbox.highx, bbox.highy, bbox.highz), (10.0, 20.0, 2.0));
    }

    #[test]
    fn heatmap_ignores_values_column() {
        let bbox = bounding_box(&element(json!({
            "type": "heatmap",
            "points": [[0, 0, 0, 99.0], [4, 3, 0, -1.0]],
            "radius": 5.0,
        })));
        assert_eq!((bbox.highx, bbox.highy), (4.0, 3.0));
        assert_eq!(bbox.size, 5.0);
        assert_eq!(bbox.details, 2);
    }

    #[test]
    fn griddata_spans_the_grid() {
        let bbox = bounding_box(&element(json!({
            "type": "griddata",
            "origin": [100, 200, 0],
            "dx": 10,
            "dy": 5,
            "gridWidth": 3,
            "values": [0, 1, 2, 3, 4, 5],
        })));
        assert_eq!((bbox.lowx, bbox.lowy), (100.0, 200.0));
        assert_eq!((bbox.highx, bbox.highy), (120.0, 205.0));
        assert_eq!(bbox.details, 6);
    }

    #[test]
    fn computation_is_pure() {
        let shape = element(json!({
            "type": "rectangle", "center": [1, 2, 3], "width": 4, "height": 5, "rotation": 0.3,
        }));
        assert_eq!(bounding_box(&shape), bounding_box(&shape));
    }
}
