use crate::geometry::Element;
use crate::model::annotation::AnnotationData;
use crate::string;
use crate::time::ProgressTicker;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::info;

/// Arrays longer than this are numerically probed in full but schema-checked
/// against a truncated prefix.
pub const VALIDATE_ARRAY_LENGTH: usize = 1000;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn fail<T>(message: impl Into<String>) -> Result<T, ValidationError> {
    Err(ValidationError(message.into()))
}

/// Validates an annotation payload: the header fields, then each element.
///
/// Validating every element in full is expensive when a caller submits
/// thousands of near-identical shapes, so elements whose JSON structure
/// matches the previously fully-validated element skip the constraint pass.
/// Returns `(validated, skipped)` element counts.
pub fn validate_annotation(data: &AnnotationData) -> Result<(usize, usize), ValidationError> {
    if data.name.is_empty() {
        return fail("annotation name must not be empty");
    }
    if let Some(attributes) = &data.attributes
        && !attributes.is_object()
    {
        return fail("annotation attributes must be an object");
    }

    let mut ticker = ProgressTicker::new();
    let mut baseline: Option<&Value> = None;
    let mut skipped = 0;
    for (index, element) in data.elements.iter().enumerate() {
        if baseline.is_some_and(|last| similar_structure(last, element, None)) {
            skipped += 1;
        } else {
            validate_element(element).map_err(|err| ValidationError(format!("element {index}: {err}")))?;
            baseline = Some(element);
        }
        if ticker.tick() {
            info!("Validated {} of {} elements in {:.3?}", index + 1, data.elements.len(), ticker.elapsed());
        }
    }

    let mut seen = HashSet::new();
    let duplicated = data
        .elements
        .iter()
        .filter_map(|element| element.get("id").and_then(Value::as_str))
        .any(|id| !seen.insert(id));
    if duplicated {
        return fail("annotation element ids are not unique");
    }
    Ok((data.elements.len() - skipped, skipped))
}

/// Full validation of one element: key-set checks against the schema for its
/// shape, then typed deserialization and constraint checks. Oversized
/// `points`/`values` arrays are probed numerically and truncated before the
/// typed pass.
fn validate_element(raw: &Value) -> Result<(), ValidationError> {
    let map = match raw.as_object() {
        Some(map) => map,
        None => return fail("element must be an object"),
    };
    let type_name = match map.get("type").and_then(Value::as_str) {
        Some(name) => name,
        None => return fail("element requires a string 'type'"),
    };
    let allowed = match allowed_keys(type_name) {
        Some(allowed) => allowed,
        None => return fail(format!("unknown element type '{type_name}'")),
    };
    for key in map.keys() {
        if !BASE_KEYS.contains(&key.as_str()) && !allowed.contains(&key.as_str()) {
            return fail(format!("'{key}' is not a valid {type_name} property"));
        }
    }

    let mut truncated = None;
    if let Some(key) = oversized_array_key(map)
        && probe_numeric_array(&map[key], key)
    {
        let mut clone = map.clone();
        if let Some(entries) = clone.get_mut(key).and_then(Value::as_array_mut) {
            entries.truncate(VALIDATE_ARRAY_LENGTH);
        }
        truncated = Some(Value::Object(clone));
    }
    let subject = truncated.as_ref().unwrap_or(raw);

    let element: Element = serde_json::from_value(subject.clone()).map_err(|err| ValidationError(err.to_string()))?;
    element.check_constraints().map_err(|err| ValidationError(err.to_string()))
}

const BASE_KEYS: &[&str] = &["id", "type", "label", "lineColor", "lineWidth", "group", "user"];

fn allowed_keys(type_name: &str) -> Option<&'static [&'static str]> {
    Some(match type_name {
        "point" => &["center", "fillColor"],
        "arrow" => &["points", "fillColor"],
        "circle" => &["center", "radius", "fillColor"],
        "polyline" => &["points", "closed", "holes", "fillColor"],
        "rectangle" | "ellipse" => &["center", "width", "height", "rotation", "normal", "fillColor"],
        "rectanglegrid" => &[
            "center",
            "width",
            "height",
            "rotation",
            "normal",
            "fillColor",
            "widthSubdivisions",
            "heightSubdivisions",
        ],
        "heatmap" => &["points", "radius", "colorRange", "rangeValues", "normalizeRange"],
        "griddata" => &[
            "origin",
            "dx",
            "dy",
            "gridWidth",
            "values",
            "interpretation",
            "radius",
            "colorRange",
            "rangeValues",
            "normalizeRange",
            "stepped",
            "minColor",
            "maxColor",
        ],
        _ => return None,
    })
}

fn oversized_array_key(map: &Map<String, Value>) -> Option<&'static str> {
    ["points", "values"]
        .into_iter()
        .find(|key| map.get(*key).and_then(Value::as_array).is_some_and(|entries| entries.len() > VALIDATE_ARRAY_LENGTH))
}

/// Checks that the whole array coerces numerically: flat numbers for
/// `values`, uniform numeric tuples for `points`.
fn probe_numeric_array(array: &Value, key: &str) -> bool {
    let entries = match array.as_array() {
        Some(entries) => entries,
        None => return false,
    };
    if key == "values" {
        return entries.iter().all(Value::is_number);
    }
    let width = entries.first().and_then(Value::as_array).map(Vec::len);
    entries.iter().all(|entry| {
        entry
            .as_array()
            .is_some_and(|tuple| Some(tuple.len()) == width && tuple.iter().all(Value::is_number))
    })
}

/// Compares two elements to determine if they are similar enough that if one
/// validates, the other should, too. Types must match, objects must have the
/// same keys, arrays the same length. Numbers may differ freely, ids only
/// need to be well-formed, label values may differ, and `points`/`values`
/// arrays may differ in length as long as every entry is a numeric 3-tuple.
pub fn similar_structure(a: &Value, b: &Value, parent_key: Option<&str>) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter().all(|(key, a_value)| match b.get(key) {
                None => false,
                Some(b_value) if key == "id" => {
                    b_value.as_str().is_some_and(string::is_object_id)
                }
                Some(_) if parent_key == Some("label") && key == "value" => true,
                Some(b_value) => similar_structure(a_value, b_value, Some(key)),
            })
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                if !matches!(parent_key, Some("points" | "values")) || a.len() < 2 || b.len() < 2 {
                    return false;
                }
                // A resized point array passes as long as it stays point-shaped.
                return b.iter().all(|entry| {
                    entry
                        .as_array()
                        .is_some_and(|tuple| tuple.len() == 3 && tuple.iter().all(Value::is_number))
                });
            }
            a.iter().zip(b).all(|(a_entry, b_entry)| similar_structure(a_entry, b_entry, parent_key))
        }
        (Value::Number(_), Value::Number(_)) => true,
        (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b) && a == b,
    }
}

/// The annotation schema document served at `/annotation/schema`.
pub fn annotation_schema() -> Value {
    let coord = json!({
        "type": "array",
        "items": {"type": "number"},
        "minItems": 3,
        "maxItems": 3,
        "description": "An X, Y, Z coordinate tuple, in base layer pixel coordinates, where the origin is the upper-left.",
    });
    let coord_value = json!({
        "type": "array",
        "items": {"type": "number"},
        "minItems": 4,
        "maxItems": 4,
        "description": "An X, Y, Z, value coordinate tuple, in base layer pixel coordinates, where the origin is the upper-left.",
    });
    let color = json!({
        "type": "string",
        "pattern": r"^(#[0-9a-fA-F]{3,6}|rgb\(\d+,\s*\d+,\s*\d+\)|rgba\(\d+,\s*\d+,\s*\d+,\s*(\d?\.|)\d+\))$",
    });
    let base_properties = json!({
        "id": {"type": "string", "pattern": "^[0-9a-f]{24}$"},
        "type": {"type": "string"},
        "user": {"type": "object", "additionalProperties": true},
        "label": {
            "type": "object",
            "properties": {
                "value": {"type": "string"},
                "visibility": {"type": "string", "enum": ["hidden", "always", "onhover"]},
                "fontSize": {"type": "number", "exclusiveMinimum": 0},
                "color": color,
            },
            "required": ["value"],
            "additionalProperties": false,
        },
        "lineColor": color,
        "lineWidth": {"type": "number", "minimum": 0},
        "group": {"type": "string"},
        "fillColor": color,
    });

    let shape = |type_name: &str, extra: Value, required: Value| {
        let mut properties = base_properties.as_object().cloned().unwrap_or_default();
        properties.insert(String::from("type"), json!({"type": "string", "enum": [type_name]}));
        if let Value::Object(extra) = extra {
            properties.extend(extra);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    };

    json!({
        "$schema": "http://json-schema.org/schema#",
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "description": {"type": "string"},
            "attributes": {
                "type": "object",
                "additionalProperties": true,
                "description": "Subjective things that apply to the entire image.",
            },
            "elements": {
                "type": "array",
                "description": "Subjective things that apply to a spatial region.",
                "items": {"anyOf": [
                    shape("point", json!({"center": coord}), json!(["type", "center"])),
                    shape(
                        "arrow",
                        json!({"points": {"type": "array", "items": coord, "minItems": 2, "maxItems": 2}}),
                        json!(["type", "points"]),
                    ),
                    shape(
                        "circle",
                        json!({"center": coord, "radius": {"type": "number", "minimum": 0}}),
                        json!(["type", "center", "radius"]),
                    ),
                    shape(
                        "polyline",
                        json!({
                            "points": {"type": "array", "items": coord, "minItems": 2},
                            "closed": {"type": "boolean"},
                            "holes": {"type": "array", "items": {"type": "array", "items": coord}},
                        }),
                        json!(["type", "points"]),
                    ),
                    shape(
                        "rectangle",
                        json!({
                            "center": coord,
                            "width": {"type": "number", "minimum": 0},
                            "height": {"type": "number", "minimum": 0},
                            "rotation": {"type": "number"},
                            "normal": coord,
                        }),
                        json!(["type", "center", "width", "height"]),
                    ),
                    shape(
                        "rectanglegrid",
                        json!({
                            "center": coord,
                            "width": {"type": "number", "minimum": 0},
                            "height": {"type": "number", "minimum": 0},
                            "rotation": {"type": "number"},
                            "normal": coord,
                            "widthSubdivisions": {"type": "integer", "minimum": 1},
                            "heightSubdivisions": {"type": "integer", "minimum": 1},
                        }),
                        json!(["type", "center", "width", "height", "widthSubdivisions", "heightSubdivisions"]),
                    ),
                    shape(
                        "ellipse",
                        json!({
                            "center": coord,
                            "width": {"type": "number", "minimum": 0},
                            "height": {"type": "number", "minimum": 0},
                            "rotation": {"type": "number"},
                            "normal": coord,
                        }),
                        json!(["type", "center", "width", "height"]),
                    ),
                    shape(
                        "heatmap",
                        json!({
                            "points": {"type": "array", "items": coord_value},
                            "radius": {"type": "number", "exclusiveMinimum": 0},
                            "colorRange": {"type": "array", "items": color},
                            "rangeValues": {"type": "array", "items": {"type": "number"}},
                            "normalizeRange": {"type": "boolean"},
                        }),
                        json!(["type", "points"]),
                    ),
                    shape(
                        "griddata",
                        json!({
                            "origin": coord,
                            "dx": {"type": "number"},
                            "dy": {"type": "number"},
                            "gridWidth": {"type": "integer", "minimum": 1},
                            "values": {"type": "array", "items": {"type": "number"}},
                            "interpretation": {"type": "string", "enum": ["heatmap", "contour", "choropleth"]},
                            "radius": {"type": "number", "exclusiveMinimum": 0},
                            "colorRange": {"type": "array", "items": color},
                            "rangeValues": {"type": "array", "items": {"type": "number"}},
                            "normalizeRange": {"type": "boolean"},
                            "stepped": {"type": "boolean"},
                            "minColor": color,
                            "maxColor": color,
                        }),
                        json!(["type", "values", "gridWidth"]),
                    ),
                ]},
            },
        },
        "additionalProperties": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::SmallString;

    fn payload(elements: Vec<Value>) -> AnnotationData {
        AnnotationData {
            name: SmallString::new("sample"),
            description: None,
            attributes: None,
            elements,
        }
    }

    fn rect(x: f64) -> Value {
        json!({"type": "rectangle", "center": [x, 0.0, 0.0], "width": 2.0, "height": 3.0})
    }

    #[test]
    fn similar_elements_skip_revalidation() {
        let elements = vec![rect(0.0), rect(10.0), rect(20.5)];
        let (validated, skipped) = validate_annotation(&payload(elements)).unwrap();
        assert_eq!((validated, skipped), (1, 2));
    }

    #[test]
    fn dissimilar_elements_revalidate() {
        let elements = vec![
            rect(0.0),
            json!({"type": "circle", "center": [0, 0, 0], "radius": 1.0}),
            rect(1.0),
        ];
        let (validated, skipped) = validate_annotation(&payload(elements)).unwrap();
        assert_eq!((validated, skipped), (3, 0));
    }

    #[test]
    fn numbers_are_interchangeable() {
        assert!(similar_structure(&json!(1), &json!(1.5), None));
        assert!(similar_structure(&rect(0.0), &rect(7.25), None));
        assert!(!similar_structure(&json!("a"), &json!("b"), None));
        assert!(!similar_structure(&json!(1), &json!("1"), None));
    }

    #[test]
    fn label_values_may_differ() {
        let a = json!({"label": {"value": "first"}});
        let b = json!({"label": {"value": "second"}});
        assert!(similar_structure(&a, &b, None));

        let c = json!({"label": {"value": "first", "color": "#f00"}});
        assert!(!similar_structure(&a, &c, None));
    }

    #[test]
    fn ids_only_need_to_be_well_formed() {
        let a = json!({"id": "0123456789abcdef01234567"});
        assert!(similar_structure(&a, &json!({"id": "aaaabbbbccccddddeeeeffff"}), None));
        assert!(!similar_structure(&a, &json!({"id": "not-an-id"}), None));
    }

    #[test]
    fn point_arrays_may_change_length() {
        let a = json!({"points": [[0, 0, 0], [1, 1, 0]]});
        let b = json!({"points": [[0, 0, 0], [1, 1, 0], [2, 2, 0]]});
        assert!(similar_structure(&a, &b, None));

        let malformed = json!({"points": [[0, 0, 0], [1, 1]]});
        assert!(!similar_structure(&a, &malformed, None));

        let other_key = json!({"holes": [[0, 0, 0], [1, 1, 0]]});
        let other_key_resized = json!({"holes": [[0, 0, 0], [1, 1, 0], [2, 2, 0]]});
        assert!(!similar_structure(&other_key, &other_key_resized, None));
    }

    #[test]
    fn rejects_unknown_properties_and_bad_constraints() {
        let unknown = payload(vec![json!({
            "type": "rectangle", "center": [0, 0, 0], "width": 1, "height": 1, "sideways": true,
        })]);
        assert!(validate_annotation(&unknown).is_err());

        let bad_color = payload(vec![json!({
            "type": "point", "center": [0, 0, 0], "fillColor": "mauve",
        })]);
        assert!(validate_annotation(&bad_color).is_err());

        let fill_on_heatmap = payload(vec![json!({
            "type": "heatmap", "points": [], "fillColor": "#fff",
        })]);
        assert!(validate_annotation(&fill_on_heatmap).is_err());
    }

    #[test]
    fn rejects_duplicate_ids_and_empty_names() {
        let id = "0123456789abcdef01234567";
        let mut first = rect(0.0);
        first["id"] = json!(id);
        let mut second = json!({"type": "circle", "center": [0, 0, 0], "radius": 1.0});
        second["id"] = json!(id);
        assert!(validate_annotation(&payload(vec![first, second])).is_err());

        let mut unnamed = payload(vec![]);
        unnamed.name = SmallString::new("");
        assert!(validate_annotation(&unnamed).is_err());
    }

    #[test]
    fn oversized_arrays_probe_then_truncate() {
        let many: Vec<Value> = (0..1500).map(|i| json!([i, i, 0])).collect();
        let big = payload(vec![json!({"type": "polyline", "points": many, "closed": true})]);
        assert!(validate_annotation(&big).is_ok());

        // A non-numeric entry past the truncation point still fails: the
        // probe rejects truncation and the full array is validated.
        let mut corrupt: Vec<Value> = (0..1500).map(|i| json!([i, i, 0])).collect();
        corrupt[1200] = json!(["x", 0, 0]);
        let bad = payload(vec![json!({"type": "polyline", "points": corrupt, "closed": true})]);
        assert!(validate_annotation(&bad).is_err());
    }

    #[test]
    fn schema_document_lists_all_shapes() {
        let schema = annotation_schema();
        let shapes = schema["properties"]["elements"]["items"]["anyOf"].as_array().unwrap();
        assert_eq!(shapes.len(), 9);
    }
}
