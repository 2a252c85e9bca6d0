use crate::api::{ApiError, ApiResult};
use crate::geometry::{self, Element};
use crate::model::element::ElementRow;
use crate::schema::annotation_element;
use crate::store::query::{ElementQueryPlan, QueryInfo, SortKey};
use crate::string::{self, SmallString};
use crate::time::{DateTime, ProgressTicker};
use diesel::dsl::{AsSelect, Select};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde_json::Value;
use tracing::info;

/// Rows inserted per statement. Keeps each statement's bind-parameter count
/// well under the protocol cap.
const INSERT_CHUNK: usize = 1000;

/// Rows fetched per cursor page.
const FETCH_BATCH: i64 = 1000;

type BoxedQuery<'a> = diesel::helper_types::IntoBoxed<'a, Select<annotation_element::table, AsSelect<ElementRow, Pg>>, Pg>;

/// Computes bboxes and bulk-inserts the given payloads as the element set of
/// `(logical_id, version)`. Payloads without an id get one assigned, written
/// back into the payload itself. A collision on an auto-assigned id is
/// regenerated and the chunk retried once.
pub fn insert_for_version(
    conn: &mut PgConnection,
    logical_id: &SmallString,
    version: i64,
    elements: &mut [Value],
) -> ApiResult<()> {
    let now = DateTime::now();
    let mut ticker = ProgressTicker::new();
    let total = elements.len();
    let mut inserted = 0;

    for chunk in elements.chunks_mut(INSERT_CHUNK) {
        let mut assigned = Vec::new();
        for (index, payload) in chunk.iter_mut().enumerate() {
            if payload.get("id").and_then(Value::as_str).is_none() {
                set_payload_id(payload, string::generate_object_id());
                assigned.push(index);
            }
        }
        let rows = build_rows(logical_id, version, now, chunk)?;

        let result = diesel::insert_into(annotation_element::table).values(&rows).execute(conn);
        match result {
            Ok(_) => {}
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) if !assigned.is_empty() => {
                for &index in &assigned {
                    set_payload_id(&mut chunk[index], string::generate_object_id());
                }
                let rows = build_rows(logical_id, version, now, chunk)?;
                diesel::insert_into(annotation_element::table).values(&rows).execute(conn)?;
            }
            Err(err) => return Err(err.into()),
        }

        inserted += chunk.len();
        if ticker.tick() {
            info!("Inserted {inserted} of {total} elements in {:.3?}", ticker.elapsed());
        }
    }
    Ok(())
}

fn set_payload_id(payload: &mut Value, id: SmallString) {
    if let Some(map) = payload.as_object_mut() {
        map.insert(String::from("id"), Value::String(id.to_string()));
    }
}

fn build_rows(
    logical_id: &SmallString,
    version: i64,
    now: DateTime,
    payloads: &[Value],
) -> ApiResult<Vec<ElementRow>> {
    payloads
        .iter()
        .map(|payload| {
            let element: Element = serde_json::from_value(payload.clone())
                .map_err(|err| ApiError::InvalidAnnotation(err.to_string()))?;
            let bbox = geometry::bounding_box(&element);
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .map(SmallString::new)
                .unwrap_or_else(string::generate_object_id);
            Ok(ElementRow {
                id,
                annotation_id: logical_id.clone(),
                version,
                created: now,
                lowx: bbox.lowx,
                lowy: bbox.lowy,
                lowz: bbox.lowz,
                highx: bbox.highx,
                highy: bbox.highy,
                highz: bbox.highz,
                size: bbox.size,
                details: bbox.details,
                element_group: element.base().group.clone(),
                element: payload.clone(),
            })
        })
        .collect()
}

fn filtered(plan: &ElementQueryPlan) -> BoxedQuery<'_> {
    let mut query = annotation_element::table
        .select(ElementRow::as_select())
        .into_boxed()
        .filter(annotation_element::annotation_id.eq(plan.logical_id.as_ref()))
        .filter(annotation_element::version.eq(plan.version));
    if let Some(bound) = plan.min_highx {
        query = query.filter(annotation_element::highx.ge(bound));
    }
    if let Some(bound) = plan.max_lowx {
        query = query.filter(annotation_element::lowx.lt(bound));
    }
    if let Some(bound) = plan.min_highy {
        query = query.filter(annotation_element::highy.ge(bound));
    }
    if let Some(bound) = plan.max_lowy {
        query = query.filter(annotation_element::lowy.lt(bound));
    }
    if let Some(bound) = plan.min_highz {
        query = query.filter(annotation_element::highz.ge(bound));
    }
    if let Some(bound) = plan.max_lowz {
        query = query.filter(annotation_element::lowz.lt(bound));
    }
    if let Some(bound) = plan.min_size {
        query = query.filter(annotation_element::size.ge(bound));
    }
    query
}

fn ordered(plan: &ElementQueryPlan) -> BoxedQuery<'_> {
    let query = filtered(plan);
    let query = match (plan.sort, plan.descending) {
        (SortKey::Id, false) => query.order_by(annotation_element::id.asc()),
        (SortKey::Id, true) => query.order_by(annotation_element::id.desc()),
        (SortKey::Created, false) => query.order_by(annotation_element::created.asc()),
        (SortKey::Created, true) => query.order_by(annotation_element::created.desc()),
        (SortKey::Size, false) => query.order_by(annotation_element::size.asc()),
        (SortKey::Size, true) => query.order_by(annotation_element::size.desc()),
        (SortKey::Details, false) => query.order_by(annotation_element::details.asc()),
        (SortKey::Details, true) => query.order_by(annotation_element::details.desc()),
    };
    // Stable under ties on the sort key.
    query.then_order_by(annotation_element::id.asc())
}

pub fn count_matching(conn: &mut PgConnection, plan: &ElementQueryPlan) -> QueryResult<i64> {
    filtered(plan).count().get_result(conn)
}

/// A paged cursor over the plan's ordered results. Tracks the returned-row
/// and cumulative-details budgets; the row that crosses the `maxDetails`
/// threshold is still returned, matching the "may exceed slightly" contract.
pub struct ElementCursor {
    plan: ElementQueryPlan,
    batch: std::vec::IntoIter<ElementRow>,
    next_offset: i64,
    fetched: i64,
    pub returned: i64,
    pub details: i64,
    done: bool,
}

impl ElementCursor {
    pub fn new(plan: ElementQueryPlan) -> Self {
        let next_offset = plan.offset;
        Self {
            plan,
            batch: Vec::new().into_iter(),
            next_offset,
            fetched: 0,
            returned: 0,
            details: 0,
            done: false,
        }
    }

    pub fn next(&mut self, conn: &mut PgConnection) -> QueryResult<Option<ElementRow>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some(row) = self.batch.next() {
                self.returned += 1;
                self.details += row.details;
                if self.plan.max_details.is_some_and(|budget| self.details >= budget) {
                    self.done = true;
                }
                if self.plan.limit.is_some_and(|limit| self.returned >= limit) {
                    self.done = true;
                }
                return Ok(Some(row));
            }

            let remaining = match self.plan.query_limit() {
                Some(cap) if cap <= self.fetched => {
                    self.done = true;
                    continue;
                }
                Some(cap) => FETCH_BATCH.min(cap - self.fetched),
                None => FETCH_BATCH,
            };
            let rows = ordered(&self.plan)
                .offset(self.next_offset)
                .limit(remaining)
                .load::<ElementRow>(conn)?;
            if rows.is_empty() {
                self.done = true;
                continue;
            }
            self.next_offset += rows.len() as i64;
            self.fetched += rows.len() as i64;
            self.batch = rows.into_iter();
        }
    }

    /// Initializes the info side channel for this cursor's plan, including
    /// the total match count.
    pub fn begin_info(&self, conn: &mut PgConnection) -> QueryResult<QueryInfo> {
        Ok(QueryInfo {
            count: count_matching(conn, &self.plan)?,
            offset: self.plan.offset,
            filter: self.plan.filter_description(),
            sort: self.plan.sort_description(),
            limit: self.plan.limit,
            max_details: self.plan.max_details,
            centroids: self.plan.centroids.then_some(true),
            ..QueryInfo::default()
        })
    }

    /// Folds the consumed totals into the info side channel.
    pub fn finish_info(&self, info: &mut QueryInfo) {
        info.returned = self.returned;
        info.details = self.details;
    }
}

/// Deletes every element version belonging to the annotation.
pub fn remove_for_annotation(conn: &mut PgConnection, logical_id: &str) -> QueryResult<usize> {
    diesel::delete(annotation_element::table.filter(annotation_element::annotation_id.eq(logical_id))).execute(conn)
}

/// Deletes all elements of one version, across annotations. Used when a
/// version is garbage-collected.
pub fn remove_version(conn: &mut PgConnection, version: i64) -> QueryResult<usize> {
    diesel::delete(annotation_element::table.filter(annotation_element::version.eq(version))).execute(conn)
}

/// Deletes superseded element versions of an annotation: strictly older than
/// `current_version`, or everything up to and including `old_version` when
/// one is explicitly known.
pub fn remove_older_than(
    conn: &mut PgConnection,
    logical_id: &str,
    current_version: i64,
    old_version: Option<i64>,
) -> QueryResult<usize> {
    let base = annotation_element::table.filter(annotation_element::annotation_id.eq(logical_id));
    match old_version.filter(|&old| old < current_version) {
        Some(old) => diesel::delete(base.filter(annotation_element::version.le(old))).execute(conn),
        None => diesel::delete(base.filter(annotation_element::version.lt(current_version))).execute(conn),
    }
}

/// The sorted distinct `group` values of one annotation version, with a null
/// sentinel appended when any element carries no group.
pub fn distinct_groups(
    conn: &mut PgConnection,
    logical_id: &str,
    version: i64,
) -> QueryResult<Vec<Option<SmallString>>> {
    let groups: Vec<Option<SmallString>> = annotation_element::table
        .filter(annotation_element::annotation_id.eq(logical_id))
        .filter(annotation_element::version.eq(version))
        .select(annotation_element::element_group)
        .distinct()
        .load(conn)?;

    let has_ungrouped = groups.iter().any(Option::is_none);
    let mut named: Vec<SmallString> = groups.into_iter().flatten().collect();
    named.sort();
    let mut result: Vec<Option<SmallString>> = named.into_iter().map(Some).collect();
    if has_ungrouped {
        result.push(None);
    }
    Ok(result)
}
