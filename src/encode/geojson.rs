use crate::api::{ApiError, ApiResult};
use crate::geometry::element::{Element, PolylineElement, RectangleElement};
use serde_json::{Map, Value, json};

/// Properties that cross the GeoJSON boundary unchanged in both directions.
const PASSTHROUGH_KEYS: [&str; 12] = [
    "id",
    "label",
    "group",
    "user",
    "lineColor",
    "lineWidth",
    "fillColor",
    "radius",
    "width",
    "height",
    "rotation",
    "normal",
];

/// Converts one element to a GeoJSON Feature. Returns `None` for shapes with
/// no GeoJSON rendering (heatmap, griddata, arrow, rectanglegrid).
pub fn element_to_feature(element: &Element) -> Option<Value> {
    let geometry = match element {
        Element::Point(point) => json!({"type": "Point", "coordinates": point.center}),
        Element::Polyline(line) => polyline_geometry(line),
        Element::Rectangle(rect) | Element::Ellipse(rect) => rectangle_geometry(rect),
        Element::Circle(circle) => {
            let [x, y, z] = circle.center;
            let r = circle.radius;
            json!({"type": "Polygon", "coordinates": [[
                [x - r, y - r, z],
                [x + r, y - r, z],
                [x + r, y + r, z],
                [x - r, y + r, z],
                [x - r, y - r, z],
            ]]})
        }
        Element::Arrow(_) | Element::RectangleGrid(_) | Element::Heatmap(_) | Element::GridData(_) => return None,
    };

    let serialized = serde_json::to_value(element).ok()?;
    let mut properties = Map::new();
    if let Some(map) = serialized.as_object() {
        for key in PASSTHROUGH_KEYS {
            if let Some(value) = map.get(key) {
                properties.insert(key.to_string(), value.clone());
            }
        }
    }
    let geometry_type = geometry["type"].as_str().unwrap_or_default().to_lowercase();
    if geometry_type != element.type_name() {
        properties.insert(String::from("type"), Value::String(element.type_name().to_string()));
    }
    Some(json!({"type": "Feature", "geometry": geometry, "properties": properties}))
}

fn polyline_geometry(line: &PolylineElement) -> Value {
    if line.closed.unwrap_or(false) {
        let mut rings = Vec::new();
        let mut outer = line.points.clone();
        if let Some(first) = outer.first().copied() {
            outer.push(first);
        }
        rings.push(outer);
        for hole in line.holes.as_deref().unwrap_or_default() {
            let mut ring = hole.clone();
            if let Some(first) = ring.first().copied() {
                ring.push(first);
            }
            rings.push(ring);
        }
        json!({"type": "Polygon", "coordinates": rings})
    } else {
        json!({"type": "LineString", "coordinates": line.points})
    }
}

fn rectangle_geometry(rect: &RectangleElement) -> Value {
    let [x, y, z] = rect.center;
    let rotation = rect.rotation.unwrap_or(0.0);
    let left = x - rect.width / 2.0;
    let right = x + rect.width / 2.0;
    let top = y - rect.height / 2.0;
    let bottom = y + rect.height / 2.0;
    json!({"type": "Polygon", "coordinates": [[
        rotate(rotation, x, y, left, top, z),
        rotate(rotation, x, y, right, top, z),
        rotate(rotation, x, y, right, bottom, z),
        rotate(rotation, x, y, left, bottom, z),
        rotate(rotation, x, y, left, top, z),
    ]]})
}

fn rotate(rotation: f64, cx: f64, cy: f64, x: f64, y: f64, z: f64) -> [f64; 3] {
    if rotation == 0.0 {
        return [x, y, z];
    }
    let (sin, cos) = rotation.sin_cos();
    let (x, y) = (x - cx, y - cy);
    [x * cos - y * sin + cx, x * sin + y * cos + cy, z]
}

/// Converts the elements of an annotation into a GeoJSON FeatureCollection.
/// The first converted feature carries the annotation header (minus its
/// elements) under `properties.annotation`. With `must_convert`, an
/// unrepresentable element is an error; otherwise it is skipped.
pub fn feature_collection(
    elements: &[Value],
    annotation: &Value,
    must_convert: bool,
) -> ApiResult<Value> {
    let mut features = Vec::new();
    for raw in elements {
        let element: Element = serde_json::from_value(raw.clone())
            .map_err(|err| ApiError::InvalidAnnotation(err.to_string()))?;
        match element_to_feature(&element) {
            Some(mut feature) => {
                if features.is_empty()
                    && let Some(properties) = feature["properties"].as_object_mut()
                {
                    properties.insert(String::from("annotation"), annotation.clone());
                }
                features.push(feature);
            }
            None if must_convert => {
                return Err(ApiError::UnrepresentableElement(element.type_name().into()));
            }
            None => {}
        }
    }
    Ok(json!({"type": "FeatureCollection", "features": features}))
}

/// Checks if a JSON value appears to contain a GeoJSON record.
pub fn is_geojson(value: &Value) -> bool {
    let candidate = match value {
        Value::Array(entries) => match entries.first() {
            Some(first) => first,
            None => return false,
        },
        other => other,
    };
    matches!(
        candidate.get("type").and_then(Value::as_str),
        Some(
            "Feature"
                | "FeatureCollection"
                | "GeometryCollection"
                | "Point"
                | "LineString"
                | "Polygon"
                | "MultiPoint"
                | "MultiLineString"
                | "MultiPolygon"
        )
    )
}

/// An annotation reconstructed from GeoJSON features.
#[derive(Debug, Default)]
pub struct GeoJsonAnnotation {
    pub annotation: Map<String, Value>,
    pub elements: Vec<Value>,
}

impl GeoJsonAnnotation {
    pub fn parse(geojson: &Value) -> Self {
        let mut result = Self::default();
        result.parse_feature(geojson);
        result
    }

    /// The parsed content as an annotation payload value, elements included.
    pub fn into_annotation(mut self) -> Value {
        if !self.annotation.contains_key("name") {
            self.annotation.insert(String::from("name"), Value::String(String::from("GeoJSON")));
        }
        self.annotation.insert(String::from("elements"), Value::Array(self.elements));
        Value::Object(self.annotation)
    }

    fn parse_feature(&mut self, value: &Value) {
        if let Value::Array(entries) = value {
            for entry in entries {
                self.parse_feature(entry);
            }
        }
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return;
        };
        match kind {
            "FeatureCollection" => {
                self.parse_feature(value.get("features").unwrap_or(&Value::Null));
            }
            "GeometryCollection" => {
                for geometry in value.get("geometries").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                    self.parse_feature(&json!({"type": "Feature", "geometry": geometry}));
                }
            }
            "Feature" => self.parse_one(value),
            "Point" | "LineString" | "Polygon" | "MultiPoint" | "MultiLineString" | "MultiPolygon" => {
                self.parse_one(&json!({"type": "Feature", "geometry": value}));
            }
            _ => {}
        }
    }

    fn parse_one(&mut self, feature: &Value) {
        let properties = feature.get("properties").and_then(Value::as_object);
        let mut element = Map::new();
        if let Some(properties) = properties {
            for key in PASSTHROUGH_KEYS {
                if let Some(value) = properties.get(key) {
                    element.insert(key.to_string(), value.clone());
                }
            }
            if let Some(annotation) = properties.get("annotation").and_then(Value::as_object) {
                for (key, value) in annotation {
                    if key != "elements" {
                        self.annotation.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        let geometry = feature.get("geometry").unwrap_or(&Value::Null);
        let declared = properties
            .and_then(|map| map.get("type"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty());
        let geometry_type = geometry.get("type").and_then(Value::as_str).unwrap_or_default();
        let kind = declared.unwrap_or(geometry_type);

        match kind.to_lowercase().as_str() {
            "circle" => self.push(circle_from(geometry, element)),
            "ellipse" => {
                if let Some(mut parsed) = rectangle_from(geometry, element) {
                    parsed.insert(String::from("type"), json!("ellipse"));
                    self.push(Some(parsed));
                }
            }
            "rectangle" => self.push(rectangle_from(geometry, element)),
            "point" => self.push(point_from(geometry.get("coordinates"), element)),
            "multipoint" => {
                for coordinates in geometry.get("coordinates").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                    self.push(point_from(Some(coordinates), element.clone()));
                }
            }
            "polyline" if geometry_type == "LineString" => self.push(linestring_from(geometry, element)),
            "polyline" | "polygon" => self.push(polygon_from(geometry.get("coordinates"), element)),
            "multipolygon" => {
                for rings in geometry.get("coordinates").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                    self.push(polygon_from(Some(rings), element.clone()));
                }
            }
            "linestring" => self.push(linestring_from(geometry, element)),
            "multilinestring" => {
                for points in geometry.get("coordinates").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                    let geometry = json!({"coordinates": points});
                    self.push(linestring_from(&geometry, element.clone()));
                }
            }
            _ => {}
        }
    }

    fn push(&mut self, element: Option<Map<String, Value>>) {
        if let Some(element) = element {
            self.elements.push(Value::Object(element));
        }
    }
}

fn coordinate(value: &Value) -> [f64; 3] {
    let mut point = [0.0; 3];
    if let Some(entries) = value.as_array() {
        for (axis, entry) in entries.iter().take(3).enumerate() {
            point[axis] = entry.as_f64().unwrap_or(0.0);
        }
    }
    point
}

fn ring_corners(geometry: &Value) -> Option<Vec<[f64; 3]>> {
    let ring = geometry.get("coordinates")?.get(0)?.as_array()?;
    Some(ring.iter().map(coordinate).collect())
}

fn circle_from(geometry: &Value, mut element: Map<String, Value>) -> Option<Map<String, Value>> {
    let corners = ring_corners(geometry)?;
    let corners = corners.get(..4)?;
    let cx = corners.iter().map(|corner| corner[0]).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|corner| corner[1]).sum::<f64>() / 4.0;
    let cz = corners[0][2];
    let max_x = corners.iter().map(|corner| corner[0]).fold(f64::NEG_INFINITY, f64::max);
    let min_x = corners.iter().map(|corner| corner[0]).fold(f64::INFINITY, f64::min);
    element.insert(String::from("type"), json!("circle"));
    element.insert(String::from("center"), json!([cx, cy, cz]));
    element.insert(String::from("radius"), json!((max_x - min_x) / 2.0));
    Some(element)
}

fn rectangle_from(geometry: &Value, mut element: Map<String, Value>) -> Option<Map<String, Value>> {
    let corners = ring_corners(geometry)?;
    let corners = corners.get(..4)?;
    let cx = corners.iter().map(|corner| corner[0]).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|corner| corner[1]).sum::<f64>() / 4.0;
    let cz = corners[0][2];
    let width = ((corners[0][0] - corners[1][0]).powi(2) + (corners[0][1] - corners[1][1]).powi(2)).sqrt();
    let height = ((corners[1][0] - corners[2][0]).powi(2) + (corners[1][1] - corners[2][1]).powi(2)).sqrt();
    let rotation = (corners[1][1] - corners[0][1]).atan2(corners[1][0] - corners[0][0]);
    element.insert(String::from("type"), json!("rectangle"));
    element.insert(String::from("center"), json!([cx, cy, cz]));
    element.insert(String::from("width"), json!(width));
    element.insert(String::from("height"), json!(height));
    element.insert(String::from("rotation"), json!(rotation));
    Some(element)
}

fn point_from(coordinates: Option<&Value>, mut element: Map<String, Value>) -> Option<Map<String, Value>> {
    element.insert(String::from("type"), json!("point"));
    element.insert(String::from("center"), json!(coordinate(coordinates?)));
    Some(element)
}

fn linestring_from(geometry: &Value, mut element: Map<String, Value>) -> Option<Map<String, Value>> {
    let points: Vec<[f64; 3]> = geometry.get("coordinates")?.as_array()?.iter().map(coordinate).collect();
    element.insert(String::from("type"), json!("polyline"));
    element.insert(String::from("points"), json!(points));
    element.insert(String::from("closed"), json!(false));
    Some(element)
}

fn polygon_from(coordinates: Option<&Value>, mut element: Map<String, Value>) -> Option<Map<String, Value>> {
    let rings = coordinates?.as_array()?;
    let outer = rings.first()?.as_array()?;
    let points: Vec<[f64; 3]> = outer.iter().take(outer.len().saturating_sub(1)).map(coordinate).collect();
    element.insert(String::from("type"), json!("polyline"));
    element.insert(String::from("points"), json!(points));
    element.insert(String::from("closed"), json!(true));
    if rings.len() > 1 {
        let holes: Vec<Vec<[f64; 3]>> = rings[1..]
            .iter()
            .filter_map(Value::as_array)
            .map(|ring| ring.iter().take(ring.len().saturating_sub(1)).map(coordinate).collect())
            .collect();
        element.insert(String::from("holes"), json!(holes));
    }
    Some(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(element: Value) -> Value {
        let typed: Element = serde_json::from_value(element).unwrap();
        let feature = element_to_feature(&typed).unwrap();
        let parsed = GeoJsonAnnotation::parse(&feature);
        assert_eq!(parsed.elements.len(), 1);
        parsed.elements.into_iter().next().unwrap()
    }

    #[test]
    fn point_roundtrip() {
        let result = roundtrip(json!({"type": "point", "center": [3.0, 4.0, 5.0], "group": "nuclei"}));
        assert_eq!(result["type"], "point");
        assert_eq!(result["center"], json!([3.0, 4.0, 5.0]));
        assert_eq!(result["group"], "nuclei");
    }

    #[test]
    fn open_polyline_is_a_linestring() {
        let typed: Element =
            serde_json::from_value(json!({"type": "polyline", "points": [[0, 0, 0], [5, 5, 0], [9, 1, 0]]})).unwrap();
        let feature = element_to_feature(&typed).unwrap();
        assert_eq!(feature["geometry"]["type"], "LineString");
        assert_eq!(feature["properties"]["type"], "polyline");

        let result = roundtrip(json!({"type": "polyline", "points": [[0, 0, 0], [5, 5, 0], [9, 1, 0]]}));
        assert_eq!(result["closed"], false);
        assert_eq!(result["points"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn closed_polyline_keeps_holes() {
        let source = json!({
            "type": "polyline",
            "closed": true,
            "points": [[0, 0, 0], [10, 0, 0], [10, 10, 0], [0, 10, 0]],
            "holes": [[[4, 4, 0], [6, 4, 0], [6, 6, 0], [4, 6, 0]]],
        });
        let typed: Element = serde_json::from_value(source.clone()).unwrap();
        let feature = element_to_feature(&typed).unwrap();
        assert_eq!(feature["geometry"]["type"], "Polygon");
        // Rings close back onto their first point on the wire.
        assert_eq!(feature["geometry"]["coordinates"][0].as_array().unwrap().len(), 5);

        let result = roundtrip(source);
        assert_eq!(result["closed"], true);
        assert_eq!(result["points"].as_array().unwrap().len(), 4);
        assert_eq!(result["holes"][0].as_array().unwrap().len(), 4);
    }

    #[test]
    fn rectangle_roundtrip_preserves_rotation() {
        let result = roundtrip(json!({
            "type": "rectangle", "center": [50.0, 60.0, 0.0], "width": 20.0, "height": 10.0, "rotation": 0.4,
        }));
        assert_eq!(result["type"], "rectangle");
        let center = result["center"].as_array().unwrap();
        assert!((center[0].as_f64().unwrap() - 50.0).abs() < 1e-9);
        assert!((center[1].as_f64().unwrap() - 60.0).abs() < 1e-9);
        assert!((result["width"].as_f64().unwrap() - 20.0).abs() < 1e-9);
        assert!((result["height"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert!((result["rotation"].as_f64().unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn ellipse_and_circle_roundtrip() {
        let ellipse = roundtrip(json!({
            "type": "ellipse", "center": [5.0, 5.0, 0.0], "width": 8.0, "height": 4.0,
        }));
        assert_eq!(ellipse["type"], "ellipse");
        assert!((ellipse["width"].as_f64().unwrap() - 8.0).abs() < 1e-9);

        let circle = roundtrip(json!({
            "type": "circle", "center": [5.0, 5.0, 0.0], "radius": 2.5,
        }));
        assert_eq!(circle["type"], "circle");
        assert!((circle["radius"].as_f64().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(circle["center"], json!([5.0, 5.0, 0.0]));
    }

    #[test]
    fn unrepresentable_shapes_skip_or_reject() {
        let elements = vec![
            json!({"type": "point", "center": [0, 0, 0]}),
            json!({"type": "heatmap", "points": [[0, 0, 0, 1.0]], "radius": 5.0}),
        ];
        let annotation = json!({"name": "mixed"});

        let collection = feature_collection(&elements, &annotation, false).unwrap();
        let features = collection["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["annotation"]["name"], "mixed");

        assert!(feature_collection(&elements, &annotation, true).is_err());
    }

    #[test]
    fn bare_geometries_and_collections_parse() {
        let parsed = GeoJsonAnnotation::parse(&json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]},
                 "properties": {"annotation": {"name": "from geojson", "description": "d"}}},
                {"type": "MultiPoint", "coordinates": [[3, 4], [5, 6]]},
            ],
        }));
        assert_eq!(parsed.elements.len(), 3);
        assert_eq!(parsed.annotation["name"], "from geojson");

        let annotation = parsed.into_annotation();
        assert_eq!(annotation["elements"].as_array().unwrap().len(), 3);
        // Missing z coordinates fill with zero.
        assert_eq!(annotation["elements"][0]["center"], json!([1.0, 2.0, 0.0]));
    }

    #[test]
    fn detects_geojson_payloads() {
        assert!(is_geojson(&json!({"type": "FeatureCollection", "features": []})));
        assert!(is_geojson(&json!({"type": "Point", "coordinates": [0, 0]})));
        assert!(is_geojson(&json!([{"type": "Feature"}])));
        assert!(!is_geojson(&json!({"name": "x", "elements": []})));
        assert!(!is_geojson(&json!([])));
    }
}
