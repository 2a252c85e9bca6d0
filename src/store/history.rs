use crate::api::{ApiError, ApiResult};
use crate::auth::{Client, access};
use crate::config::Config;
use crate::model::annotation::{AnnotationDocument, HeaderRow};
use crate::model::enums::AccessLevel;
use crate::schema::{annotation, annotation_element};
use crate::store::{annotation as annotation_store, element};
use crate::string::SmallString;
use crate::time::{DateTime, ProgressTicker};
use diesel::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Lists the version history of an annotation, newest version first: one
/// entry per version across the live row and its archived rows. Entries the
/// client cannot read are omitted unless `force`.
pub fn version_list(
    conn: &mut PgConnection,
    client: &Client,
    id: &str,
    limit: i64,
    offset: i64,
    force: bool,
) -> ApiResult<Vec<AnnotationDocument>> {
    let rows: Vec<HeaderRow> = annotation::table
        .select(HeaderRow::as_select())
        .filter(annotation::id.eq(id).or(annotation::annotation_id.eq(id)))
        .order((annotation::version.desc(), annotation::id.asc()))
        .load(conn)?;

    let mut seen_versions = HashSet::new();
    let entries = rows
        .into_iter()
        .filter(|row| seen_versions.insert(row.version))
        .filter(|row| force || access::has_access(row.access.as_ref(), row.public, client, AccessLevel::Read))
        .skip(offset.max(0) as usize)
        .take(if limit > 0 { limit as usize } else { usize::MAX })
        .map(AnnotationDocument::from_row)
        .collect();
    Ok(entries)
}

/// Fetches one historical version with its elements materialized. The result
/// carries the live id as `id` and the physical row id in `_versionId`, so a
/// subsequent save rebinds onto the live annotation.
pub fn get_version(
    conn: &mut PgConnection,
    client: &Client,
    id: &str,
    version: i64,
    force: bool,
) -> ApiResult<Option<AnnotationDocument>> {
    let physical_id: Option<SmallString> = annotation::table
        .select(annotation::id)
        .filter(annotation::id.eq(id).or(annotation::annotation_id.eq(id)))
        .filter(annotation::version.eq(version))
        .first(conn)
        .optional()?;
    let Some(physical_id) = physical_id else {
        return Ok(None);
    };

    let acting = if force { Client::new(None, true) } else { client.clone() };
    let Some(mut doc) = annotation_store::load(conn, &physical_id, None, true, &acting, AccessLevel::Read)? else {
        return Ok(None);
    };
    doc.version_id = doc.id.clone();
    if let Some(live_id) = doc.annotation_id.take() {
        doc.id = Some(live_id);
    }
    Ok(Some(doc))
}

/// Reverts an annotation to a previous version by saving that snapshot as a
/// new version. With no version given, an inactive (deleted) annotation is
/// restored to its most recent version, an active one rolls back to the one
/// before it.
pub fn revert_version(
    conn: &mut PgConnection,
    config: &Config,
    client: &Client,
    id: &str,
    version: Option<i64>,
) -> ApiResult<Option<AnnotationDocument>> {
    let version = match version {
        Some(version) => version,
        None => {
            let recent = version_list(conn, client, id, 2, 0, true)?;
            if recent.first().is_some_and(|entry| !entry.active) {
                recent[0].version
            } else if recent.len() >= 2 {
                recent[1].version
            } else {
                return Ok(None);
            }
        }
    };

    let Some(mut doc) = get_version(conn, client, id, version, false)? else {
        return Ok(None);
    };
    // Fetching the live version is a no-op revert.
    if !doc.active {
        access::require_access(doc.access.as_ref(), doc.public, client, AccessLevel::Write)?;
        annotation_store::update_annotation(conn, config, &mut doc, client)?;
    }
    Ok(Some(doc))
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub from_deleted_items: i64,
    pub old_versions: i64,
    pub active: i64,
    pub recent_versions: i64,
    pub abandoned_versions: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_versions: Option<i64>,
}

const HEADER_SCAN_BATCH: i64 = 1000;

/// Reports on, and optionally removes, stale annotation snapshots: versions
/// belonging to deleted items, inactive versions past the retention window,
/// and element versions no header references anymore. With `remove` false
/// this only reports. Safe to abort between annotations.
pub fn remove_old_annotations(
    conn: &mut PgConnection,
    remove: bool,
    min_age_days: i64,
    keep_inactive_versions: i64,
) -> ApiResult<GcReport> {
    if min_age_days < 0 || (remove && min_age_days < 7) {
        return Err(ApiError::InvalidMinimumAge(if remove { 7 } else { 0 }));
    }
    if keep_inactive_versions < 0 {
        return Err(ApiError::InvalidKeepVersions);
    }

    let cutoff = DateTime::days_ago(min_age_days);
    let mut report = GcReport {
        removed_versions: remove.then_some(0),
        ..GcReport::default()
    };
    let mut item_exists: HashMap<SmallString, bool> = HashMap::new();
    let mut processed: HashSet<SmallString> = HashSet::new();
    let mut header_versions: HashSet<i64> = HashSet::new();
    let mut ticker = ProgressTicker::new();

    info!("Checking old annotations");
    let mut last_id = SmallString::default();
    loop {
        let rows: Vec<HeaderRow> = annotation::table
            .select(HeaderRow::as_select())
            .filter(annotation::id.gt(last_id.as_ref()))
            .order(annotation::id.asc())
            .limit(HEADER_SCAN_BATCH)
            .load(conn)?;
        let Some(tail) = rows.last() else {
            break;
        };
        last_id = tail.id.clone();

        for row in rows {
            if ticker.tick() {
                info!(
                    "Still checking old annotations, checked {} with {} versions, {:?}",
                    processed.len(),
                    header_versions.len(),
                    report
                );
            }
            header_versions.insert(row.version);
            let logical_id = row.annotation_id.clone().unwrap_or_else(|| row.id.clone());
            if !processed.contains(&logical_id) {
                if item_exists.len() > 10_000 {
                    item_exists.clear();
                }
                let exists = match item_exists.get(&row.item_id) {
                    Some(&exists) => exists,
                    None => {
                        let exists = annotation_store::find_item(conn, &row.item_id)?.is_some();
                        item_exists.insert(row.item_id.clone(), exists);
                        exists
                    }
                };
                sweep_annotation(conn, remove, &logical_id, exists, keep_inactive_versions, cutoff, &mut report)?;
                processed.insert(logical_id);
            }
        }
    }

    info!("Getting distinct element versions");
    let element_versions: Vec<i64> = annotation_element::table
        .filter(annotation_element::created.lt(cutoff))
        .select(annotation_element::version)
        .distinct()
        .load(conn)?;
    info!("Got {} distinct element versions", element_versions.len());

    let abandoned: Vec<i64> = element_versions
        .into_iter()
        .filter(|version| !header_versions.contains(version))
        .collect();
    report.abandoned_versions = abandoned.len() as i64;
    if remove {
        for version in abandoned {
            if ticker.tick() {
                info!("Removing abandoned versions, {report:?}");
            }
            element::remove_version(conn, version)?;
            if let Some(removed) = report.removed_versions.as_mut() {
                *removed += 1;
            }
        }
        info!("Compacting annotation tables");
        diesel::sql_query("VACUUM ANALYZE annotation, annotation_element").execute(conn)?;
    }
    info!("Finished checking old annotations, {report:?}");
    Ok(report)
}

fn sweep_annotation(
    conn: &mut PgConnection,
    remove: bool,
    logical_id: &SmallString,
    item_exists: bool,
    keep_inactive_versions: i64,
    cutoff: DateTime,
    report: &mut GcReport,
) -> ApiResult<()> {
    let admin = Client::new(None, true);
    let mut keep = if item_exists { keep_inactive_versions } else { 0 };
    let history = version_list(conn, &admin, logical_id, 0, 0, true)?;
    for record in history {
        if record.active && item_exists {
            report.active += 1;
            continue;
        }
        if keep > 0 {
            keep -= 1;
            report.recent_versions += 1;
            continue;
        }
        if record.created.max(record.updated) < cutoff {
            if remove {
                if let Some(physical_id) = record.id.as_deref() {
                    diesel::delete(annotation::table.find(physical_id)).execute(conn)?;
                }
                element::remove_version(conn, record.version)?;
                if let Some(removed) = report.removed_versions.as_mut() {
                    *removed += 1;
                }
            }
            if item_exists {
                report.old_versions += 1;
            } else {
                report.from_deleted_items += 1;
            }
        } else {
            report.recent_versions += 1;
        }
    }
    Ok(())
}
