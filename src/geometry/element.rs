use crate::geometry::color;
use crate::string::{self, SmallString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One geometric primitive of an annotation, tagged by its `type` field.
/// Style and identity fields common to every shape live in [`ElementBase`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    Point(PointElement),
    Arrow(ArrowElement),
    Circle(CircleElement),
    Polyline(PolylineElement),
    Rectangle(RectangleElement),
    RectangleGrid(RectangleGridElement),
    Ellipse(RectangleElement),
    Heatmap(HeatmapElement),
    GridData(GridDataElement),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementBase {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<SmallString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_color: Option<SmallString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<SmallString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<SmallString>,
    /// Schema-free field for callers to extend elements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<LabelVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<SmallString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelVisibility {
    Hidden,
    Always,
    Onhover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub center: [f64; 3],
}

/// The first point is the head of the arrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrowElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub points: [[f64; 3]; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub center: [f64; 3],
    pub radius: f64,
}

/// An open or closed line strip. A closed polyline is a polygon and may
/// carry interior holes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolylineElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub points: Vec<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holes: Option<Vec<Vec<[f64; 3]>>>,
}

/// Shared by `rectangle` and `ellipse`; rotation is radians counterclockwise
/// around the normal, which is the positive z-axis unless specified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RectangleElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub center: [f64; 3],
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectangleGridElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub center: [f64; 3],
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal: Option<[f64; 3]>,
    pub width_subdivisions: i64,
    pub height_subdivisions: i64,
}

/// A weighted point cloud. Points are `[x, y, z, value]` tuples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapElement {
    #[serde(flatten)]
    pub base: ElementBase,
    pub points: Vec<[f64; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_range: Option<Vec<SmallString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_values: Option<Vec<f64>>,
    /// If true, rangeValues are on a 0..1 scale mapped onto the data extent;
    /// if false (the default) they are actual data values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalize_range: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridInterpretation {
    Heatmap,
    Contour,
    Choropleth,
}

/// A dense value grid anchored at `origin` with `dx`/`dy` spacing. `values`
/// is row-major with `grid_width` entries per row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridDataElement {
    #[serde(flatten)]
    pub base: ElementBase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dy: Option<f64>,
    pub grid_width: i64,
    pub values: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<GridInterpretation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_range: Option<Vec<SmallString>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_values: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalize_range: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stepped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_color: Option<SmallString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_color: Option<SmallString>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ElementConstraint(pub &'static str);

impl Element {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "point",
            Self::Arrow(_) => "arrow",
            Self::Circle(_) => "circle",
            Self::Polyline(_) => "polyline",
            Self::Rectangle(_) => "rectangle",
            Self::RectangleGrid(_) => "rectanglegrid",
            Self::Ellipse(_) => "ellipse",
            Self::Heatmap(_) => "heatmap",
            Self::GridData(_) => "griddata",
        }
    }

    pub fn base(&self) -> &ElementBase {
        match self {
            Self::Point(element) => &element.base,
            Self::Arrow(element) => &element.base,
            Self::Circle(element) => &element.base,
            Self::Polyline(element) => &element.base,
            Self::Rectangle(element) | Self::Ellipse(element) => &element.base,
            Self::RectangleGrid(element) => &element.base,
            Self::Heatmap(element) => &element.base,
            Self::GridData(element) => &element.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut ElementBase {
        match self {
            Self::Point(element) => &mut element.base,
            Self::Arrow(element) => &mut element.base,
            Self::Circle(element) => &mut element.base,
            Self::Polyline(element) => &mut element.base,
            Self::Rectangle(element) | Self::Ellipse(element) => &mut element.base,
            Self::RectangleGrid(element) => &mut element.base,
            Self::Heatmap(element) => &mut element.base,
            Self::GridData(element) => &mut element.base,
        }
    }

    /// Constraint checks that serde's type checking cannot express. This is
    /// the slow half of validation; the structural fast path skips it.
    pub fn check_constraints(&self) -> Result<(), ElementConstraint> {
        self.check_base()?;
        match self {
            Self::Point(_) | Self::Arrow(_) => Ok(()),
            Self::Circle(element) => {
                check(element.radius >= 0.0, "circle radius must be non-negative")
            }
            Self::Polyline(element) => {
                check(element.points.len() >= 2, "polyline requires at least two points")
            }
            Self::Rectangle(element) | Self::Ellipse(element) => {
                check(element.width >= 0.0 && element.height >= 0.0, "width and height must be non-negative")
            }
            Self::RectangleGrid(element) => {
                check(element.width >= 0.0 && element.height >= 0.0, "width and height must be non-negative")?;
                check(
                    element.width_subdivisions >= 1 && element.height_subdivisions >= 1,
                    "grid subdivisions must be at least 1",
                )
            }
            Self::Heatmap(element) => {
                check(element.radius.is_none_or(|radius| radius > 0.0), "heatmap radius must be positive")?;
                check_colors(element.color_range.as_deref())
            }
            Self::GridData(element) => {
                check(element.grid_width >= 1, "gridWidth must be at least 1")?;
                check(element.radius.is_none_or(|radius| radius > 0.0), "griddata radius must be positive")?;
                check_colors(element.color_range.as_deref())?;
                check_color(element.min_color.as_deref())?;
                check_color(element.max_color.as_deref())
            }
        }
    }

    fn check_base(&self) -> Result<(), ElementConstraint> {
        let base = self.base();
        if let Some(id) = &base.id {
            check(string::is_object_id(id), "element id must be a 24-digit hex string")?;
        }
        check(base.line_width.is_none_or(|width| width >= 0.0), "lineWidth must be non-negative")?;
        check_color(base.line_color.as_deref())?;
        check_color(base.fill_color.as_deref())?;
        if let Some(label) = &base.label {
            check(label.font_size.is_none_or(|size| size > 0.0), "label fontSize must be positive")?;
            check_color(label.color.as_deref())?;
        }
        Ok(())
    }
}

fn check(condition: bool, message: &'static str) -> Result<(), ElementConstraint> {
    condition.then_some(()).ok_or(ElementConstraint(message))
}

fn check_color(color: Option<&str>) -> Result<(), ElementConstraint> {
    check(color.is_none_or(color::is_valid_color), "color must be #rgb, #rrggbb, rgb() or rgba()")
}

fn check_colors(colors: Option<&[SmallString]>) -> Result<(), ElementConstraint> {
    colors
        .unwrap_or_default()
        .iter()
        .try_for_each(|entry| check_color(Some(entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_roundtrip() {
        let element: Element = serde_json::from_value(json!({
            "type": "rectangle",
            "center": [20.0, 25.0, 0.0],
            "width": 14.0,
            "height": 15.0,
            "lineColor": "#00ff00",
            "group": "tumor",
        }))
        .unwrap();
        assert_eq!(element.type_name(), "rectangle");
        assert_eq!(element.base().group.as_deref(), Some("tumor"));

        let encoded = serde_json::to_value(&element).unwrap();
        assert_eq!(encoded["type"], "rectangle");
        assert_eq!(encoded["center"][1], 25.0);
        // Absent optional fields stay absent on the wire.
        assert!(encoded.get("rotation").is_none());
    }

    #[test]
    fn constraint_checks() {
        let bad_radius: Element = serde_json::from_value(json!({
            "type": "circle", "center": [0, 0, 0], "radius": -1.0,
        }))
        .unwrap();
        assert!(bad_radius.check_constraints().is_err());

        let bad_color: Element = serde_json::from_value(json!({
            "type": "point", "center": [0, 0, 0], "lineColor": "chartreuse",
        }))
        .unwrap();
        assert!(bad_color.check_constraints().is_err());

        let short_line: Element = serde_json::from_value(json!({
            "type": "polyline", "points": [[0, 0, 0]],
        }))
        .unwrap();
        assert!(short_line.check_constraints().is_err());

        let good: Element = serde_json::from_value(json!({
            "type": "heatmap",
            "points": [[0, 0, 0, 0.5], [1, 1, 0, 0.7]],
            "radius": 25.0,
            "colorRange": ["rgba(0, 0, 0, 0)", "rgba(255, 0, 0, 1)"],
            "rangeValues": [0.0, 1.0],
        }))
        .unwrap();
        assert!(good.check_constraints().is_ok());
    }

    #[test]
    fn unknown_shape_rejected() {
        let result = serde_json::from_value::<Element>(json!({
            "type": "pixelmap", "center": [0, 0, 0],
        }));
        assert!(result.is_err());
    }
}
