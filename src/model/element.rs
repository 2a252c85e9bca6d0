use crate::schema::annotation_element;
use crate::string::SmallString;
use crate::time::DateTime;
use diesel::pg::Pg;
use diesel::prelude::*;
use serde_json::Value;

/// One persisted element row. The `element` column holds the caller-supplied
/// tagged payload; the bbox columns are derived from it on insert and never
/// updated (element rows are immutable once written).
#[derive(Clone, Identifiable, Insertable, Queryable, Selectable)]
#[diesel(table_name = annotation_element)]
#[diesel(check_for_backend(Pg))]
pub struct ElementRow {
    pub id: SmallString,
    pub annotation_id: SmallString,
    pub version: i64,
    pub created: DateTime,
    pub lowx: f64,
    pub lowy: f64,
    pub lowz: f64,
    pub highx: f64,
    pub highy: f64,
    pub highz: f64,
    pub size: f64,
    pub details: i64,
    pub element_group: Option<SmallString>,
    pub element: Value,
}
