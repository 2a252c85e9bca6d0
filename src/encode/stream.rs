use crate::api::ApiResult;
use crate::model::annotation::AnnotationDocument;
use crate::model::element::ElementRow;
use crate::store::element::ElementCursor;
use crate::store::query::{ElementQueryPlan, RegionParams};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use diesel::PgConnection;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Elements are collected into batches before being JSON-encoded and
/// emitted. Batching balances streaming promptly against encoder overhead.
const BATCH_SIZE: usize = 100;

/// Per-element property columns deduplicated into `_elementQuery.props` in
/// centroid mode.
pub const PROPS_KEYS: [&str; 5] = ["type", "fillColor", "lineColor", "lineWidth", "closed"];

/// Each centroid record is `uint64 || uint32` big-endian for the 24-hex id,
/// then little-endian `f32 cx, f32 cy, f32 size, i32 propIndex`.
pub const CENTROID_RECORD_SIZE: usize = 28;

/// The serialized annotation envelope around the `elements` slot: `prefix`
/// ends just inside `"elements":[`, `suffix` continues from the matching `]`
/// through the remaining header fields, leaving the root object open for the
/// `_elementQuery` trailer.
pub struct Envelope {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
}

/// Serializes the header document key by key (serde_json maps iterate in
/// sorted key order), bookmarking the elements slot as it is written.
pub fn build_envelope(root: &Map<String, Value>) -> serde_json::Result<Envelope> {
    let mut buffer = Vec::new();
    let mut split = None;
    buffer.push(b'{');
    let mut first = true;
    for (key, value) in root {
        if !first {
            buffer.push(b',');
        }
        first = false;
        serde_json::to_writer(&mut buffer, key)?;
        buffer.push(b':');
        match (key.as_str(), value.as_object()) {
            ("annotation", Some(inner)) => {
                buffer.push(b'{');
                let mut inner_first = true;
                for (inner_key, inner_value) in inner {
                    if !inner_first {
                        buffer.push(b',');
                    }
                    inner_first = false;
                    serde_json::to_writer(&mut buffer, inner_key)?;
                    buffer.push(b':');
                    if inner_key == "elements" {
                        buffer.push(b'[');
                        split = Some(buffer.len());
                        buffer.push(b']');
                    } else {
                        serde_json::to_writer(&mut buffer, inner_value)?;
                    }
                }
                buffer.push(b'}');
            }
            _ => serde_json::to_writer(&mut buffer, value)?,
        }
    }
    let split = split.unwrap_or(buffer.len());
    let suffix = buffer.split_off(split);
    Ok(Envelope { prefix: buffer, suffix })
}

/// Accumulates full element payloads and emits them as comma-joined JSON
/// chunks with the batch's outer brackets stripped.
#[derive(Default)]
pub struct JsonBatcher {
    batch: Vec<Value>,
    emitted: bool,
}

impl JsonBatcher {
    pub fn push(&mut self, element: Value) -> serde_json::Result<Option<Vec<u8>>> {
        self.batch.push(element);
        if self.batch.len() >= BATCH_SIZE {
            return self.drain().map(Some);
        }
        Ok(None)
    }

    pub fn finish(mut self) -> serde_json::Result<Option<Vec<u8>>> {
        if self.batch.is_empty() {
            return Ok(None);
        }
        self.drain().map(Some)
    }

    fn drain(&mut self) -> serde_json::Result<Vec<u8>> {
        let encoded = serde_json::to_vec(&self.batch)?;
        self.batch.clear();
        let stripped = &encoded[1..encoded.len() - 1];
        let mut chunk = Vec::with_capacity(stripped.len() + 1);
        if self.emitted {
            chunk.push(b',');
        }
        chunk.extend_from_slice(stripped);
        self.emitted = true;
        Ok(chunk)
    }
}

/// Packs element rows into centroid records, deduplicating property tuples
/// as it goes.
#[derive(Default)]
pub struct CentroidEncoder {
    indices: HashMap<String, i32>,
    pub props: Vec<Value>,
}

impl CentroidEncoder {
    pub fn pack(&mut self, row: &ElementRow) -> Option<[u8; CENTROID_RECORD_SIZE]> {
        let id = row.element.get("id").and_then(Value::as_str).unwrap_or(&row.id);
        let high = u64::from_str_radix(id.get(..16)?, 16).ok()?;
        let low = u32::from_str_radix(id.get(16..24)?, 16).ok()?;

        let prop: Vec<Value> = PROPS_KEYS
            .iter()
            .map(|key| row.element.get(*key).cloned().unwrap_or(Value::Null))
            .collect();
        let lookup = serde_json::to_string(&prop).ok()?;
        let next_index = self.props.len() as i32;
        let prop_index = *self.indices.entry(lookup).or_insert_with(|| {
            self.props.push(Value::Array(prop));
            next_index
        });

        let is_point = row.element.get("type").and_then(Value::as_str) == Some("point");
        let size = if is_point { 0.0 } else { row.size };

        let mut record = [0_u8; CENTROID_RECORD_SIZE];
        BigEndian::write_u64(&mut record[0..8], high);
        BigEndian::write_u32(&mut record[8..12], low);
        LittleEndian::write_f32(&mut record[12..16], ((row.lowx + row.highx) / 2.0) as f32);
        LittleEndian::write_f32(&mut record[16..20], ((row.lowy + row.highy) / 2.0) as f32);
        LittleEndian::write_f32(&mut record[20..24], size as f32);
        LittleEndian::write_i32(&mut record[24..28], prop_index);
        Some(record)
    }
}

/// Streams the annotation with its region-selected elements to `emit` as one
/// JSON document. In centroid mode the elements slot carries the framed
/// binary payload instead of JSON values.
pub fn stream_annotation(
    conn: &mut PgConnection,
    mut doc: AnnotationDocument,
    region: &RegionParams,
    emit: &mut dyn FnMut(Vec<u8>),
) -> ApiResult<()> {
    doc.annotation.elements = Vec::new();
    doc.element_query = None;

    let logical_id = doc.logical_id().cloned().unwrap_or_default();
    let plan = ElementQueryPlan::new(logical_id, doc.version, region);
    let centroids = plan.centroids;
    let mut cursor = ElementCursor::new(plan);
    let mut info = cursor.begin_info(conn)?;

    let root = match serde_json::to_value(&doc)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let envelope = build_envelope(&root)?;
    emit(envelope.prefix);

    if centroids {
        let mut encoder = CentroidEncoder::default();
        let mut chunk = Vec::with_capacity(BATCH_SIZE * CENTROID_RECORD_SIZE);
        emit(vec![0]);
        while let Some(row) = cursor.next(conn)? {
            if let Some(record) = encoder.pack(&row) {
                chunk.extend_from_slice(&record);
            }
            if chunk.len() >= BATCH_SIZE * CENTROID_RECORD_SIZE {
                emit(std::mem::take(&mut chunk));
            }
        }
        if !chunk.is_empty() {
            emit(chunk);
        }
        emit(vec![0]);
        info.props = Some(encoder.props);
        info.propskeys = Some(PROPS_KEYS.to_vec());
    } else {
        let mut batcher = JsonBatcher::default();
        while let Some(row) = cursor.next(conn)? {
            let mut payload = row.element;
            if let Some(map) = payload.as_object_mut() {
                map.entry("id").or_insert_with(|| Value::String(row.id.to_string()));
            }
            if let Some(chunk) = batcher.push(payload)? {
                emit(chunk);
            }
        }
        if let Some(chunk) = batcher.finish()? {
            emit(chunk);
        }
    }

    cursor.finish_info(&mut info);
    emit(envelope.suffix);
    let mut trailer = b",\"_elementQuery\":".to_vec();
    trailer.extend(serde_json::to_vec(&info)?);
    trailer.push(b'}');
    emit(trailer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::SmallString;
    use crate::time::DateTime;
    use serde_json::json;

    fn row(id: &str, element: Value, bbox: (f64, f64, f64, f64), size: f64) -> ElementRow {
        ElementRow {
            id: SmallString::new(id),
            annotation_id: SmallString::new("aaaabbbbccccddddeeeeffff"),
            version: 1,
            created: DateTime::now(),
            lowx: bbox.0,
            lowy: bbox.1,
            lowz: 0.0,
            highx: bbox.2,
            highy: bbox.3,
            highz: 0.0,
            size,
            details: 4,
            element_group: None,
            element,
        }
    }

    #[test]
    fn envelope_splits_inside_the_elements_slot() {
        let root: Map<String, Value> = serde_json::from_value(json!({
            "id": "aaaabbbbccccddddeeeeffff",
            "version": 12,
            "annotation": {"attributes": {"stain": "H&E"}, "elements": [], "name": "r"},
            "updated": "2024-03-9T00:00:00Z",
        }))
        .unwrap();
        let envelope = build_envelope(&root).unwrap();

        let prefix = String::from_utf8(envelope.prefix).unwrap();
        let suffix = String::from_utf8(envelope.suffix).unwrap();
        assert!(prefix.ends_with(r#""elements":["#));
        assert!(suffix.starts_with(']'));
        // Root object stays open for the _elementQuery trailer.
        assert!(!suffix.ends_with("}}"));

        let document: Value =
            serde_json::from_str(&format!("{prefix}{suffix},\"_elementQuery\":{{}}}}")).unwrap();
        assert_eq!(document["annotation"]["name"], "r");
        assert_eq!(document["version"], 12);
    }

    #[test]
    fn batches_strip_outer_brackets_and_join_with_commas() {
        let mut batcher = JsonBatcher::default();
        for index in 0..150 {
            let chunk = batcher.push(json!({"n": index})).unwrap();
            match index {
                99 => {
                    let text = String::from_utf8(chunk.unwrap()).unwrap();
                    assert!(text.starts_with(r#"{"n":0}"#));
                    assert!(!text.starts_with('['));
                    assert!(!text.ends_with(']'));
                }
                _ => assert!(chunk.is_none()),
            }
        }
        let tail = String::from_utf8(batcher.finish().unwrap().unwrap()).unwrap();
        assert!(tail.starts_with(r#",{"n":100}"#));

        let combined: Value = serde_json::from_str(&format!(
            "[{}{tail}]",
            r#"{"n":0}"#.to_string()
                + &(1..100).map(|n| format!(r#",{{"n":{n}}}"#)).collect::<String>()
        ))
        .unwrap();
        assert_eq!(combined.as_array().unwrap().len(), 150);
    }

    #[test]
    fn centroid_records_pack_id_center_size_and_props() {
        let mut encoder = CentroidEncoder::default();
        let record = encoder
            .pack(&row(
                "0123456789abcdef01234567",
                json!({"id": "0123456789abcdef01234567", "type": "rectangle", "lineColor": "#f00"}),
                (10.0, 20.0, 30.0, 60.0),
                44.72,
            ))
            .unwrap();

        assert_eq!(BigEndian::read_u64(&record[0..8]), 0x0123456789abcdef);
        assert_eq!(BigEndian::read_u32(&record[8..12]), 0x01234567);
        assert_eq!(LittleEndian::read_f32(&record[12..16]), 20.0);
        assert_eq!(LittleEndian::read_f32(&record[16..20]), 40.0);
        assert!((LittleEndian::read_f32(&record[20..24]) - 44.72).abs() < 1e-3);
        assert_eq!(LittleEndian::read_i32(&record[24..28]), 0);
        assert_eq!(encoder.props.len(), 1);
        assert_eq!(encoder.props[0][0], "rectangle");
        assert_eq!(encoder.props[0][2], "#f00");
    }

    #[test]
    fn property_tuples_deduplicate() {
        let mut encoder = CentroidEncoder::default();
        let shared = json!({"type": "rectangle", "lineColor": "#0f0"});
        let mut with_id = |id: &str, element: &Value| {
            let mut element = element.clone();
            element["id"] = json!(id);
            encoder.pack(&row(id, element, (0.0, 0.0, 1.0, 1.0), 1.0)).unwrap()
        };
        let first = with_id("0123456789abcdef01234567", &shared);
        let second = with_id("aaaabbbbccccddddeeeeffff", &shared);
        let third = with_id(
            "deadbeefdeadbeefdeadbeef",
            &json!({"type": "point", "lineColor": "#0f0"}),
        );

        assert_eq!(LittleEndian::read_i32(&first[24..28]), 0);
        assert_eq!(LittleEndian::read_i32(&second[24..28]), 0);
        assert_eq!(LittleEndian::read_i32(&third[24..28]), 1);
        assert_eq!(encoder.props.len(), 2);
        // Points report zero size in the compact form.
        assert_eq!(LittleEndian::read_f32(&third[20..24]), 0.0);
    }
}
