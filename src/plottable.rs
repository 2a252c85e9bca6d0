use crate::api::{ApiError, ApiResult};
use crate::auth::{Client, access};
use crate::model::annotation::HeaderRow;
use crate::model::enums::{AccessLevel, ResourceType};
use crate::model::item::{Folder, Item};
use crate::schema::{annotation, annotation_element, item};
use crate::store::annotation as annotation_store;
use crate::string::SmallString;
use diesel::prelude::*;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;
use tracing::info;

pub const MAX_ITEMS: usize = 1000;
pub const MAX_ANNOTATION_ELEMENTS: i64 = 10_000;
pub const MAX_DISTINCT: usize = 20;

/// Which other items contribute rows besides the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjacentSpec {
    None,
    /// Sibling items of the same folder.
    Siblings,
    /// Every readable item.
    All,
}

impl AdjacentSpec {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("__all__") => Self::All,
            Some("true") | Some("True") => Self::Siblings,
            _ => Self::None,
        }
    }
}

pub struct ItemSummary {
    pub id: SmallString,
    pub name: String,
    pub meta: Value,
}

pub struct AnnotationSummary {
    pub id: SmallString,
    pub name: SmallString,
    pub attributes: Value,
    /// `[lowx, lowy, highx, highy]` per element, capped at
    /// `MAX_ANNOTATION_ELEMENTS` rows.
    pub bboxes: Vec<[f64; 4]>,
}

/// Everything the aggregator scans, loaded up front: folder metadata, item
/// metadata, and (when requested) annotation attributes plus element bboxes.
/// `annotations[0]` holds the requested item's annotations; row `i > 0`
/// aligns item `i`'s annotations to them by name.
pub struct PlottableSource {
    pub folder_meta: Value,
    pub items: Vec<ItemSummary>,
    pub annotations: Option<Vec<Vec<Option<AnnotationSummary>>>>,
}

impl PlottableSource {
    pub fn gather(
        conn: &mut PgConnection,
        client: &Client,
        primary: &Item,
        annotations: Option<&str>,
        adjacent: AdjacentSpec,
    ) -> ApiResult<Self> {
        let parent = annotation_store::find_folder(conn, &primary.folder_id)?
            .ok_or(ApiError::NotFound(ResourceType::Folder))?;
        access::require_access(Some(&parent.access), parent.public, client, AccessLevel::Read)?;

        let items = gather_items(conn, client, primary, &parent, adjacent)?;
        let annotations = gather_annotations(conn, &items, annotations)?;
        Ok(Self {
            folder_meta: parent.meta,
            items,
            annotations,
        })
    }
}

fn gather_items(
    conn: &mut PgConnection,
    client: &Client,
    primary: &Item,
    parent: &Folder,
    adjacent: AdjacentSpec,
) -> ApiResult<Vec<ItemSummary>> {
    let summarize = |entry: &Item| ItemSummary {
        id: entry.id.clone(),
        name: entry.name.clone(),
        meta: entry.meta.clone(),
    };
    let mut items = vec![summarize(primary)];
    match adjacent {
        AdjacentSpec::None => {}
        AdjacentSpec::Siblings => {
            let siblings: Vec<Item> = item::table
                .select(Item::as_select())
                .filter(item::folder_id.eq(parent.id.as_ref()))
                .order(item::id.asc())
                .limit(MAX_ITEMS as i64)
                .load(conn)?;
            for entry in &siblings {
                if entry.id != primary.id && items.len() < MAX_ITEMS {
                    items.push(summarize(entry));
                }
            }
        }
        AdjacentSpec::All => {
            let mut readable_folders: HashMap<SmallString, bool> = HashMap::new();
            let everything: Vec<Item> = item::table.select(Item::as_select()).order(item::id.asc()).load(conn)?;
            for entry in &everything {
                if entry.id == primary.id || items.len() >= MAX_ITEMS {
                    continue;
                }
                let readable = match readable_folders.get(&entry.folder_id) {
                    Some(&readable) => readable,
                    None => {
                        let readable = annotation_store::find_folder(conn, &entry.folder_id)?
                            .map(|found| access::has_access(Some(&found.access), found.public, client, AccessLevel::Read))
                            .unwrap_or(false);
                        readable_folders.insert(entry.folder_id.clone(), readable);
                        readable
                    }
                };
                if readable {
                    items.push(summarize(entry));
                }
            }
        }
    }
    Ok(items)
}

fn gather_annotations(
    conn: &mut PgConnection,
    items: &[ItemSummary],
    requested: Option<&str>,
) -> ApiResult<Option<Vec<Vec<Option<AnnotationSummary>>>>> {
    let Some(requested) = requested.filter(|csv| !csv.is_empty()) else {
        return Ok(None);
    };
    let ids: Vec<&str> = requested.split(',').collect();
    let all = ids.first() == Some(&"__all__");

    let primary_rows = item_annotation_rows(conn, &items[0].id)?;
    let primary: Vec<AnnotationSummary> = primary_rows
        .into_iter()
        .filter(|row| all || ids.contains(&row.id.as_ref()))
        .map(|row| summarize_annotation(conn, row))
        .collect::<ApiResult<_>>()?;
    if primary.is_empty() {
        return Ok(None);
    }

    // The first annotation with each name claims the slot adjacent items
    // align to.
    let mut name_slots: HashMap<SmallString, usize> = HashMap::new();
    for (index, entry) in primary.iter().enumerate() {
        name_slots.entry(entry.name.clone()).or_insert(index);
    }

    let mut aligned: Vec<Vec<Option<AnnotationSummary>>> = vec![primary.into_iter().map(Some).collect()];
    for adjacent in &items[1..] {
        let mut slots: Vec<Option<AnnotationSummary>> = (0..aligned[0].len()).map(|_| None).collect();
        for row in item_annotation_rows(conn, &adjacent.id)? {
            let Some(&slot) = name_slots.get(row.name.as_str()) else {
                continue;
            };
            if slots[slot].is_none() {
                slots[slot] = Some(summarize_annotation(conn, row)?);
            }
        }
        aligned.push(slots);
    }
    Ok(Some(aligned))
}

fn item_annotation_rows(conn: &mut PgConnection, item_id: &str) -> ApiResult<Vec<HeaderRow>> {
    annotation::table
        .select(HeaderRow::as_select())
        .filter(annotation::item_id.eq(item_id))
        .filter(annotation::active.eq(true))
        .filter(annotation::annotation_id.is_null())
        .order(annotation::version.desc())
        .load(conn)
        .map_err(ApiError::from)
}

fn summarize_annotation(conn: &mut PgConnection, row: HeaderRow) -> ApiResult<AnnotationSummary> {
    let bboxes: Vec<(f64, f64, f64, f64)> = annotation_element::table
        .filter(annotation_element::annotation_id.eq(row.id.as_ref()))
        .filter(annotation_element::version.eq(row.version))
        .select((
            annotation_element::lowx,
            annotation_element::lowy,
            annotation_element::highx,
            annotation_element::highy,
        ))
        .order(annotation_element::id.asc())
        .limit(MAX_ANNOTATION_ELEMENTS)
        .load(conn)?;
    Ok(AnnotationSummary {
        id: row.id,
        name: SmallString::new(row.name),
        attributes: row.attributes.unwrap_or_else(|| Value::Object(Map::new())),
        bboxes: bboxes.into_iter().map(|(x0, y0, x1, y1)| [x0, y0, x1, y1]).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnSource {
    Base,
    Folder,
    Item,
    Annotation,
    #[serde(rename = "annotationelement")]
    AnnotationElement,
}

impl std::fmt::Display for ColumnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Base => "base",
            Self::Folder => "folder",
            Self::Item => "item",
            Self::Annotation => "annotation",
            Self::AnnotationElement => "annotationelement",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            Self::Text(_) => None,
        }
    }

    fn to_text(&self) -> String {
        match self {
            Self::Number(number) => number.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// A scalar from metadata, in the column's current type. Strings that parse
/// as numbers count as numbers until the column downgrades.
fn coerce(value: &Value, column_type: ColumnType) -> Option<CellValue> {
    if !is_allowed_scalar(value) {
        return None;
    }
    match column_type {
        ColumnType::Number => number_of(value).map(CellValue::Number),
        ColumnType::String => Some(CellValue::Text(text_of(value))),
    }
}

fn is_allowed_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Bool(_) | Value::Number(_))
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

type WhereEntry = (Option<String>, String, ColumnSource);

struct Column {
    key: String,
    column_type: ColumnType,
    title: String,
    wheres: Vec<WhereEntry>,
    count: i64,
    distinct: Vec<CellValue>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Serialize)]
pub struct ColumnOut {
    pub key: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub title: String,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct: Option<Vec<CellValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinctcount: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(rename = "where")]
    pub wheres: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Serialize)]
pub struct PlotData {
    pub columns: Vec<ColumnOut>,
    pub data: Vec<Vec<Option<CellValue>>>,
}

/// Row identity across heterogeneous scans:
/// `(where index, (item index, annotation index, record index))`.
type RowKey = (usize, (usize, usize, usize));

static KEYMAP: LazyLock<Vec<(Regex, &str, &str)>> = LazyLock::new(|| {
    [
        (r"(?i)^(item|image)_(id|name)$", "_0_item.name", "Item Name"),
        (r"(?i)^(low|min)(_|)x", "_bbox.x0", "Bounding Box Low X"),
        (r"(?i)^(low|min)(_|)y", "_bbox.y0", "Bounding Box Low Y"),
        (r"(?i)^(high|max)(_|)x", "_bbox.x1", "Bounding Box High X"),
        (r"(?i)^(high|max)(_|)y", "_bbox.y1", "Bounding Box High Y"),
    ]
    .into_iter()
    .map(|(pattern, key, title)| (Regex::new(pattern).expect("keymap pattern must parse"), key, title))
    .collect()
});

/// Canonical key and title for a scanned field. Well-known aliases (bbox
/// corners, item name) collapse onto shared columns.
fn column_key(source: ColumnSource, root: Option<&str>, field: &str) -> (String, String) {
    for (regex, key, title) in KEYMAP.iter() {
        if regex.is_match(field) {
            return (key.to_string(), title.to_string());
        }
    }
    let key = format!("{}.{field}.{source}", root.unwrap_or("None")).to_lowercase();
    let title = match root {
        Some(root) => format!("{root} {field}"),
        None => field.to_string(),
    };
    (key, title)
}

struct Aggregator<'a> {
    source: &'a PlottableSource,
    columns: BTreeMap<String, Column>,
    values: Option<HashMap<String, BTreeMap<RowKey, CellValue>>>,
}

impl<'a> Aggregator<'a> {
    fn new(source: &'a PlottableSource, collect: Option<&[String]>) -> Self {
        Self {
            source,
            columns: BTreeMap::new(),
            values: collect.map(|keys| keys.iter().map(|key| (key.clone(), BTreeMap::new())).collect()),
        }
    }

    fn add_column(&mut self, key: &str, title: &str, root: Option<&str>, field: &str, source: ColumnSource) -> usize {
        let entry: WhereEntry = (root.map(str::to_string), field.to_string(), source);
        let column = self.columns.entry(key.to_string()).or_insert_with(|| Column {
            key: key.to_string(),
            column_type: ColumnType::Number,
            title: title.to_string(),
            wheres: Vec::new(),
            count: 0,
            distinct: Vec::new(),
            min: None,
            max: None,
        });
        if let Some(position) = column.wheres.iter().position(|existing| *existing == entry) {
            return position;
        }
        column.wheres.push(entry);
        column.wheres.len() - 1
    }

    fn record(&mut self, column_key: &str, row: RowKey, value: &Value) {
        let Some(column) = self.columns.get_mut(column_key) else {
            return;
        };
        if column.column_type == ColumnType::Number && is_allowed_scalar(value) && number_of(value).is_none() {
            // A value that refuses numeric coercion downgrades the whole
            // column; already-seen distinct values restringify.
            column.column_type = ColumnType::String;
            column.distinct = column.distinct.iter().map(|seen| CellValue::Text(seen.to_text())).collect();
            column.min = None;
            column.max = None;
        }
        let Some(cell) = coerce(value, column.column_type) else {
            return;
        };
        column.count += 1;
        if column.distinct.len() <= MAX_DISTINCT && !column.distinct.contains(&cell) {
            column.distinct.push(cell.clone());
        }
        if let Some(number) = cell.as_number() {
            column.min = Some(column.min.map_or(number, |seen| seen.min(number)));
            column.max = Some(column.max.map_or(number, |seen| seen.max(number)));
        }
        self.store(column_key, row, cell);
    }

    /// Writes a value into the data table without touching column stats;
    /// used for the contextual base columns, whose stats are recomputed from
    /// the final table.
    fn store(&mut self, column_key: &str, row: RowKey, cell: CellValue) {
        if let Some(values) = self.values.as_mut()
            && let Some(slot) = values.get_mut(column_key)
        {
            slot.insert(row, cell);
        }
    }

    fn store_context(&mut self, row: RowKey, item: Option<&ItemSummary>, annotation: Option<&AnnotationSummary>) {
        if let Some(entry) = item {
            self.store("_0_item.name", row, CellValue::Text(entry.name.clone()));
            self.store("_2_item.id", row, CellValue::Text(entry.id.to_string()));
        }
        if let Some(entry) = annotation {
            self.store("_1_annotation.name", row, CellValue::Text(entry.name.to_string()));
            self.store("_3_annotation.id", row, CellValue::Text(entry.id.to_string()));
        }
    }

    /// Scans one metadata document: every top-level list of objects becomes
    /// a record array under its key, and the document's own scalar fields
    /// form a records-of-one pseudo root.
    fn scan_meta(
        &mut self,
        meta: &'a Value,
        source: ColumnSource,
        aux: &[(usize, &'a Value)],
        annotation_index: usize,
        annotation: Option<&AnnotationSummary>,
        with_items: bool,
    ) {
        let Some(meta) = meta.as_object() else {
            return;
        };
        let own = vec![meta];
        let mut roots: Vec<(Option<&str>, Vec<&Map<String, Value>>)> = meta
            .iter()
            .filter_map(|(root, entry)| {
                let records: Vec<&Map<String, Value>> =
                    entry.as_array()?.iter().filter_map(Value::as_object).collect();
                (!records.is_empty() && entry.as_array().is_some_and(|array| array.len() == records.len()))
                    .then_some((Some(root.as_str()), records))
            })
            .collect();
        roots.push((None, own));

        for (root, records) in roots {
            let Some(first) = records.first() else {
                continue;
            };
            for field in first.keys() {
                if !first.get(field).is_some_and(is_allowed_scalar) {
                    continue;
                }
                let (key, title) = column_key(source, root, field);
                let where_index = self.add_column(&key, &title, root, field, source);
                self.scan_records(&key, field, &records, where_index, 0, annotation_index, annotation, with_items);

                for &(aux_item, aux_meta) in aux {
                    let aux_records: Vec<&Map<String, Value>> = match root {
                        None => aux_meta.as_object().filter(|map| map.contains_key(field)).into_iter().collect(),
                        Some(root) => aux_meta
                            .get(root)
                            .and_then(Value::as_array)
                            .map(|array| array.iter().filter_map(Value::as_object).collect())
                            .filter(|records: &Vec<_>| {
                                records.first().is_some_and(|record: &&Map<String, Value>| record.contains_key(field))
                            })
                            .unwrap_or_default(),
                    };
                    if !aux_records.is_empty() {
                        self.scan_records(
                            &key,
                            field,
                            &aux_records,
                            where_index,
                            aux_item,
                            annotation_index,
                            annotation,
                            with_items,
                        );
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_records(
        &mut self,
        column_key: &str,
        field: &str,
        records: &[&Map<String, Value>],
        where_index: usize,
        item_index: usize,
        annotation_index: usize,
        annotation: Option<&AnnotationSummary>,
        with_items: bool,
    ) {
        let source = self.source;
        for (record_index, record) in records.iter().enumerate() {
            let Some(value) = record.get(field) else {
                continue;
            };
            if !is_allowed_scalar(value) {
                continue;
            }
            let row: RowKey = (where_index, (item_index, annotation_index, record_index));
            self.record(column_key, row, value);
            let item = with_items.then(|| source.items.get(item_index)).flatten();
            self.store_context(row, item, annotation);
        }
    }

    fn scan(&mut self) {
        let source = self.source;
        self.add_column("_0_item.name", "Item Name", Some("Item"), "name", ColumnSource::Base);
        self.add_column("_2_item.id", "Item ID", Some("Item"), "_id", ColumnSource::Base);

        self.scan_meta(&source.folder_meta, ColumnSource::Folder, &[], 0, None, false);

        let aux_items: Vec<(usize, &Value)> = source
            .items
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, entry)| (index, &entry.meta))
            .collect();
        self.scan_meta(&source.items[0].meta, ColumnSource::Item, &aux_items, 0, None, true);

        if let Some(annotations) = &source.annotations {
            for (annotation_index, primary) in annotations[0].iter().enumerate() {
                let Some(primary) = primary else {
                    continue;
                };
                let adjacent: Vec<(usize, &Value)> = annotations
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter_map(|(item_index, slots)| {
                        slots
                            .get(annotation_index)
                            .and_then(Option::as_ref)
                            .map(|entry| (item_index, &entry.attributes))
                    })
                    .collect();
                self.scan_meta(
                    &primary.attributes,
                    ColumnSource::Annotation,
                    &adjacent,
                    annotation_index,
                    Some(primary),
                    true,
                );
                if annotation_index == 0 {
                    self.add_column("_1_annotation.name", "Annotation Name", Some("Annotation"), "name", ColumnSource::Base);
                    self.add_column("_3_annotation.id", "Annotation ID", Some("Annotation"), "_id", ColumnSource::Base);
                    self.add_column("_bbox.x0", "Bounding Box Low X", Some("bbox"), "lowx", ColumnSource::AnnotationElement);
                    self.add_column("_bbox.y0", "Bounding Box Low Y", Some("bbox"), "lowy", ColumnSource::AnnotationElement);
                    self.add_column("_bbox.x1", "Bounding Box High X", Some("bbox"), "highx", ColumnSource::AnnotationElement);
                    self.add_column("_bbox.y1", "Bounding Box High Y", Some("bbox"), "highy", ColumnSource::AnnotationElement);
                }
            }
            self.scan_elements();
        }
    }

    fn scan_elements(&mut self) {
        let source = self.source;
        let Some(annotations) = &source.annotations else {
            return;
        };
        let columns = ["_bbox.x0", "_bbox.y0", "_bbox.x1", "_bbox.y1"];
        for (item_index, slots) in annotations.iter().enumerate() {
            for (annotation_index, slot) in slots.iter().enumerate() {
                let Some(entry) = slot else {
                    continue;
                };
                for (record_index, bbox) in entry.bboxes.iter().enumerate() {
                    let row: RowKey = (0, (item_index, annotation_index, record_index));
                    for (column, value) in columns.iter().zip(bbox) {
                        self.record(column, row, &Value::from(*value));
                    }
                    self.store_context(row, source.items.get(item_index), Some(entry));
                }
            }
        }
    }

    fn finalize(&self, requested: Option<&[String]>) -> Vec<ColumnOut> {
        self.columns
            .values()
            .filter(|column| requested.is_none_or(|keys| keys.contains(&column.key)))
            .map(|column| {
                let distinct = (column.distinct.len() <= MAX_DISTINCT).then(|| {
                    let mut sorted = column.distinct.clone();
                    sorted.sort_by(|a, b| a.to_text().cmp(&b.to_text()));
                    sorted
                });
                let numeric = column.column_type == ColumnType::Number && column.min.is_some();
                ColumnOut {
                    key: column.key.clone(),
                    column_type: column.column_type,
                    title: column.title.clone(),
                    count: column.count,
                    distinctcount: distinct.as_ref().map(Vec::len),
                    distinct,
                    min: numeric.then(|| column.min).flatten(),
                    max: numeric.then(|| column.max).flatten(),
                    wheres: column
                        .wheres
                        .iter()
                        .map(|(root, field, source)| {
                            serde_json::json!([root, field, source])
                        })
                        .collect(),
                    index: None,
                }
            })
            .collect()
    }
}

/// Discovers the plottable columns of the source, with per-column stats.
pub fn columns(source: &PlottableSource) -> Vec<ColumnOut> {
    let mut aggregator = Aggregator::new(source, None);
    aggregator.scan();
    aggregator.finalize(None)
}

/// Materializes a dense row-major table over the requested columns. Rows
/// missing any of `required` are dropped; column stats are recomputed from
/// the final table.
pub fn data(source: &PlottableSource, requested: &[String], required: &[String]) -> PlotData {
    let mut aggregator = Aggregator::new(source, Some(requested));
    aggregator.scan();

    let values = aggregator.values.take().unwrap_or_default();
    let mut rows: BTreeSet<RowKey> = BTreeSet::new();
    for column_values in values.values() {
        rows.extend(column_values.keys().copied());
    }
    let rows: Vec<RowKey> = rows.into_iter().collect();

    let mut columns = aggregator.finalize(Some(requested));
    for (index, column) in columns.iter_mut().enumerate() {
        column.index = Some(index);
    }
    info!("Gathering {} x {} data", columns.len(), rows.len());

    let mut table: Vec<Vec<Option<CellValue>>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| values.get(&column.key).and_then(|slot| slot.get(row)).cloned())
                .collect()
        })
        .collect();

    for (index, column) in columns.iter().enumerate() {
        if !required.contains(&column.key) {
            continue;
        }
        let before = table.len();
        table.retain(|row| row[index].is_some());
        if table.len() < before {
            info!(
                "Reduced row count from {before} to {} because of empty values in column {}",
                table.len(),
                column.key
            );
        }
    }

    for (index, column) in columns.iter_mut().enumerate() {
        let cells: Vec<&CellValue> = table.iter().filter_map(|row| row[index].as_ref()).collect();
        column.count = cells.len() as i64;
        let numbers: Vec<f64> = cells.iter().filter_map(|cell| cell.as_number()).collect();
        column.min = numbers.iter().copied().reduce(f64::min);
        column.max = numbers.iter().copied().reduce(f64::max);
        let mut distinct: Vec<String> = cells.iter().map(|cell| cell.to_text()).collect::<HashSet<_>>().into_iter().collect();
        if distinct.len() <= MAX_DISTINCT {
            distinct.sort();
            column.distinctcount = Some(distinct.len());
            column.distinct = Some(distinct.into_iter().map(CellValue::Text).collect());
        } else {
            column.distinct = None;
            column.distinctcount = None;
        }
    }

    PlotData { columns, data: table }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> PlottableSource {
        PlottableSource {
            folder_meta: json!({
                "cohort": [
                    {"case": "A", "grade": 2},
                    {"case": "B", "grade": 3},
                ],
                "protocol": "H&E",
            }),
            items: vec![
                ItemSummary {
                    id: SmallString::new("aaaaaaaaaaaaaaaaaaaaaaa1"),
                    name: String::from("slide-1.svs"),
                    meta: json!({"stain_quality": 0.9, "scanner": "aperio"}),
                },
                ItemSummary {
                    id: SmallString::new("aaaaaaaaaaaaaaaaaaaaaaa2"),
                    name: String::from("slide-2.svs"),
                    meta: json!({"stain_quality": 0.7, "scanner": "hamamatsu"}),
                },
            ],
            annotations: Some(vec![
                vec![Some(AnnotationSummary {
                    id: SmallString::new("bbbbbbbbbbbbbbbbbbbbbbb1"),
                    name: SmallString::new("tumor"),
                    attributes: json!({"cellularity": 0.5}),
                    bboxes: vec![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 25.0, 35.0]],
                })],
                vec![Some(AnnotationSummary {
                    id: SmallString::new("bbbbbbbbbbbbbbbbbbbbbbb2"),
                    name: SmallString::new("tumor"),
                    attributes: json!({"cellularity": 0.8}),
                    bboxes: vec![[1.0, 1.0, 2.0, 2.0]],
                })],
            ]),
        }
    }

    fn find<'a>(columns: &'a [ColumnOut], key: &str) -> &'a ColumnOut {
        columns.iter().find(|column| column.key == key).unwrap()
    }

    #[test]
    fn discovers_columns_across_scopes() {
        let columns = columns(&source());
        let keys: Vec<&str> = columns.iter().map(|column| column.key.as_str()).collect();
        assert!(keys.contains(&"_0_item.name"));
        assert!(keys.contains(&"_2_item.id"));
        assert!(keys.contains(&"_1_annotation.name"));
        assert!(keys.contains(&"_bbox.x0"));
        assert!(keys.contains(&"cohort.case.folder"));
        assert!(keys.contains(&"cohort.grade.folder"));
        assert!(keys.contains(&"none.protocol.folder"));
        assert!(keys.contains(&"none.stain_quality.item"));
        assert!(keys.contains(&"none.cellularity.annotation"));
        // Sorted by key.
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn numeric_columns_track_ranges_and_downgrade_on_text() {
        let columns = columns(&source());
        let quality = find(&columns, "none.stain_quality.item");
        assert_eq!(quality.column_type, ColumnType::Number);
        assert_eq!(quality.count, 2);
        assert_eq!(quality.min, Some(0.7));
        assert_eq!(quality.max, Some(0.9));

        let scanner = find(&columns, "none.scanner.item");
        assert_eq!(scanner.column_type, ColumnType::String);
        assert!(scanner.min.is_none());
        assert_eq!(scanner.distinctcount, Some(2));

        let cellularity = find(&columns, "none.cellularity.annotation");
        assert_eq!(cellularity.count, 2);
        assert_eq!(cellularity.max, Some(0.8));
    }

    #[test]
    fn bbox_aliases_collapse_onto_canonical_columns() {
        let (key, title) = column_key(ColumnSource::Item, None, "min_x");
        assert_eq!(key, "_bbox.x0");
        assert_eq!(title, "Bounding Box Low X");
        assert_eq!(column_key(ColumnSource::Item, None, "lowx").0, "_bbox.x0");
        assert_eq!(column_key(ColumnSource::Item, None, "maxY").0, "_bbox.y1");
        assert_eq!(column_key(ColumnSource::Item, None, "image_name").0, "_0_item.name");
        assert_eq!(
            column_key(ColumnSource::Folder, Some("cohort"), "case").0,
            "cohort.case.folder"
        );
    }

    #[test]
    fn materializes_dense_rows_with_context() {
        let requested = vec![
            String::from("_0_item.name"),
            String::from("_1_annotation.name"),
            String::from("_bbox.x0"),
            String::from("_bbox.y1"),
        ];
        let result = data(&source(), &requested, &[]);
        assert_eq!(result.columns.len(), 4);
        // Three element rows across the two items.
        assert_eq!(result.data.len(), 3);
        for row in &result.data {
            assert_eq!(row.len(), 4);
            assert!(row.iter().all(Option::is_some));
        }
        let bbox_x0 = find(&result.columns, "_bbox.x0");
        assert_eq!(bbox_x0.count, 3);
        assert_eq!(bbox_x0.min, Some(0.0));
        assert_eq!(bbox_x0.max, Some(5.0));
        let names = find(&result.columns, "_0_item.name");
        assert_eq!(names.distinctcount, Some(2));
    }

    #[test]
    fn required_columns_drop_incomplete_rows() {
        let requested = vec![String::from("none.cellularity.annotation"), String::from("_bbox.x0")];
        let everything = data(&source(), &requested, &[]);
        let complete = data(&source(), &requested, &[String::from("none.cellularity.annotation")]);
        assert!(complete.data.len() <= everything.data.len());
        let index = complete
            .columns
            .iter()
            .position(|column| column.key == "none.cellularity.annotation")
            .unwrap();
        assert!(complete.data.iter().all(|row| row[index].is_some()));
    }

    #[test]
    fn adjacent_spec_parses() {
        assert_eq!(AdjacentSpec::parse(None), AdjacentSpec::None);
        assert_eq!(AdjacentSpec::parse(Some("false")), AdjacentSpec::None);
        assert_eq!(AdjacentSpec::parse(Some("true")), AdjacentSpec::Siblings);
        assert_eq!(AdjacentSpec::parse(Some("__all__")), AdjacentSpec::All);
    }
}
