use crate::api::{ApiError, ApiResult};
use crate::auth::{Client, access};
use crate::config::Config;
use crate::model::annotation::{AnnotationData, AnnotationDocument, HeaderRow};
use crate::model::enums::{AccessLevel, ResourceType};
use crate::model::item::{Folder, Item, UserAccount};
use crate::schema::{annotation, folder, item, user_account};
use crate::store::element::ElementCursor;
use crate::store::query::{ElementQueryPlan, RegionParams};
use crate::store::{element, version};
use crate::string::{self, SmallString};
use crate::time::DateTime;
use crate::validate;
use diesel::prelude::*;
use regex::Regex;
use serde_json::Value;
use std::sync::{LazyLock, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Serializes writers so `(id, version)` commit order matches the version
/// sequence. Readers never take this lock; they rely on elements being
/// written before the header row advances.
static WRITE_COORDINATOR: Mutex<()> = Mutex::new(());

fn write_lock() -> MutexGuard<'static, ()> {
    match WRITE_COORDINATOR.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn find_header(conn: &mut PgConnection, id: &str) -> QueryResult<Option<HeaderRow>> {
    annotation::table
        .find(id)
        .select(HeaderRow::as_select())
        .first(conn)
        .optional()
}

pub fn find_item(conn: &mut PgConnection, id: &str) -> QueryResult<Option<Item>> {
    item::table.find(id).select(Item::as_select()).first(conn).optional()
}

pub fn find_folder(conn: &mut PgConnection, id: &str) -> QueryResult<Option<Folder>> {
    folder::table.find(id).select(Folder::as_select()).first(conn).optional()
}

/// Creates a new annotation under `item`, copying the parent folder's access
/// control, granting the creator admin, and inheriting the folder's public
/// flag unless overridden.
pub fn create(
    conn: &mut PgConnection,
    config: &Config,
    item: &Item,
    creator_id: &SmallString,
    data: AnnotationData,
    public: Option<bool>,
) -> ApiResult<AnnotationDocument> {
    let parent = find_folder(conn, &item.folder_id)?.ok_or(ApiError::NotFound(ResourceType::Folder))?;
    let mut access = access::copy_from_folder(&parent);
    access::grant_admin(&mut access, creator_id);

    let now = DateTime::now();
    let mut doc = AnnotationDocument {
        id: None,
        annotation_id: None,
        item_id: item.id.clone(),
        creator_id: creator_id.clone(),
        updated_by_id: creator_id.clone(),
        created: now,
        updated: now,
        version: 0,
        active: true,
        access: Some(access),
        public: public.unwrap_or(parent.public),
        public_flags: None,
        annotation: data,
        groups: None,
        version_id: None,
        element_query: None,
    };
    save(conn, config, &mut doc)?;
    Ok(doc)
}

/// Persists the document as a new version.
///
/// The elements for the new version are inserted before the header row flips
/// to it, so a reader that observes a header version always finds either the
/// complete element set or (when history is off and the set was collected)
/// nothing, never a partial one. The write lock is held across the whole
/// sequence; validation runs before taking it.
pub fn save(conn: &mut PgConnection, config: &Config, doc: &mut AnnotationDocument) -> ApiResult<()> {
    let timer = std::time::Instant::now();
    validate::validate_annotation(&doc.annotation).map_err(|err| ApiError::InvalidAnnotation(err.to_string()))?;

    {
        let _guard = write_lock();
        let new_version = version::next(conn)?;

        // Saving a fetched history snapshot rebinds it to the live id.
        if let Some(live_id) = doc.annotation_id.take() {
            doc.id = Some(live_id);
        }
        // The old version comes from the persisted row; the input's version
        // field is not trusted.
        let old_row = match doc.id.as_deref() {
            Some(id) => find_header(conn, id)?,
            None => None,
        };
        let old_version = old_row.as_ref().map(|row| row.version);

        let live_id = doc.id.clone().unwrap_or_else(string::generate_object_id);
        doc.id = Some(live_id.clone());
        doc.version = new_version;
        doc.active = true;
        doc.version_id = None;
        doc.element_query = None;

        element::insert_for_version(conn, &live_id, new_version, &mut doc.annotation.elements)?;

        if config.annotation_history {
            if let Some(old) = old_row {
                let archived = HeaderRow {
                    id: string::generate_object_id(),
                    annotation_id: Some(live_id.clone()),
                    active: false,
                    ..old
                };
                diesel::insert_into(annotation::table).values(&archived).execute(conn)?;
            }
            replace_header(conn, doc, &live_id)?;
        } else {
            replace_header(conn, doc, &live_id)?;
            element::remove_older_than(conn, &live_id, new_version, old_version)?;
        }
    }

    let live_id = doc.id.clone().unwrap_or_default();
    let groups = element::distinct_groups(conn, &live_id, doc.version)?;
    doc.groups = Some(groups.clone());
    diesel::update(annotation::table.find(live_id.as_ref()))
        .set(annotation::groups.eq(Some(groups)))
        .execute(conn)?;

    debug!("Saved annotation {live_id} in {:.3?}", timer.elapsed());
    emit_save_history(config, doc);
    Ok(())
}

fn replace_header(conn: &mut PgConnection, doc: &AnnotationDocument, live_id: &SmallString) -> QueryResult<()> {
    let row = doc.to_row(live_id);
    diesel::insert_into(annotation::table)
        .values(&row)
        .on_conflict(annotation::id)
        .do_update()
        .set(&row)
        .execute(conn)
        .map(|_| ())
}

/// Loads an annotation by physical id, materializing all or a region of its
/// elements.
///
/// A concurrent writer may advance the version between the header fetch and
/// the element fetch, and when history is off the old elements may already
/// be gone. An empty element batch therefore re-reads the header: a changed
/// version retries (up to 3 attempts), an unchanged one means the set really
/// is empty.
pub fn load(
    conn: &mut PgConnection,
    id: &str,
    region: Option<&RegionParams>,
    get_elements: bool,
    client: &Client,
    level: AccessLevel,
) -> ApiResult<Option<AnnotationDocument>> {
    const MAX_RETRIES: usize = 3;

    let Some(row) = find_header(conn, id)? else {
        return Ok(None);
    };
    let mut doc = AnnotationDocument::from_row(row);
    access::require_access(doc.access.as_ref(), doc.public, client, level)?;

    if get_elements {
        let default_region = RegionParams::default();
        let region = region.unwrap_or(&default_region);
        for retry in 0..MAX_RETRIES {
            fetch_elements(conn, &mut doc, region)?;
            if !doc.annotation.elements.is_empty() || retry + 1 == MAX_RETRIES {
                break;
            }
            let recheck = find_header(conn, id)?;
            match recheck {
                Some(newer) if newer.version != doc.version => doc = AnnotationDocument::from_row(newer),
                _ => break,
            }
        }
    }

    inject_group_set(conn, &mut doc)?;
    Ok(Some(doc))
}

fn fetch_elements(conn: &mut PgConnection, doc: &mut AnnotationDocument, region: &RegionParams) -> ApiResult<()> {
    let logical_id = doc.logical_id().cloned().unwrap_or_default();
    let plan = ElementQueryPlan::new(logical_id, doc.version, region);
    let mut cursor = ElementCursor::new(plan);
    let mut info = cursor.begin_info(conn)?;

    let mut elements = Vec::new();
    while let Some(row) = cursor.next(conn)? {
        let mut payload = row.element;
        if let Some(map) = payload.as_object_mut() {
            map.entry("id").or_insert_with(|| Value::String(row.id.to_string()));
        }
        elements.push(payload);
    }
    cursor.finish_info(&mut info);

    doc.annotation.elements = elements;
    doc.element_query = Some(serde_json::to_value(info)?);
    Ok(())
}

/// Ensures the header carries the distinct group set of its current version,
/// computing and persisting it when absent.
pub fn inject_group_set(conn: &mut PgConnection, doc: &mut AnnotationDocument) -> ApiResult<()> {
    if doc.groups.is_some() {
        return Ok(());
    }
    let logical_id = doc.logical_id().cloned().unwrap_or_default();
    let groups = element::distinct_groups(conn, &logical_id, doc.version)?;
    doc.groups = Some(groups.clone());
    if let Some(id) = doc.id.as_deref() {
        diesel::update(annotation::table.find(id))
            .set(annotation::groups.eq(Some(groups)))
            .execute(conn)?;
    }
    Ok(())
}

/// Removes an annotation: history keeps the header around inactive, otherwise
/// the header and all its elements are deleted under the write lock.
pub fn remove(conn: &mut PgConnection, config: &Config, doc: &AnnotationDocument) -> ApiResult<()> {
    let Some(id) = doc.id.as_deref() else {
        return Ok(());
    };
    if config.annotation_history {
        diesel::update(annotation::table.find(id))
            .set(annotation::active.eq(false))
            .execute(conn)?;
    } else {
        let _guard = write_lock();
        diesel::delete(annotation::table.find(id)).execute(conn)?;
        element::remove_for_annotation(conn, id)?;
    }
    Ok(())
}

/// Stamps the update metadata and saves.
pub fn update_annotation(
    conn: &mut PgConnection,
    config: &Config,
    doc: &mut AnnotationDocument,
    updater: &Client,
) -> ApiResult<()> {
    doc.updated = DateTime::now();
    doc.updated_by_id = updater.id.clone().unwrap_or_default();
    save(conn, config, doc)
}

/// Patches only the access fields of the header row. Going through `save`
/// here would re-validate and re-version an annotation whose elements were
/// never loaded; access is not version-tracked state, so a direct update is
/// safe.
pub fn set_access_list(
    conn: &mut PgConnection,
    id: &str,
    access: Value,
    public: bool,
    public_flags: Option<Value>,
) -> ApiResult<()> {
    diesel::update(annotation::table.find(id))
        .set((
            annotation::access.eq(Some(access)),
            annotation::public.eq(public),
            annotation::public_flags.eq(public_flags),
        ))
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct AnnotationFilters {
    pub item_id: Option<SmallString>,
    pub creator_id: Option<SmallString>,
    pub name: Option<String>,
    pub text: Option<String>,
}

/// Lists live, active headers matching the filters, permission-filtered for
/// `client`. Returns the filtered total plus the requested page.
pub fn find(
    conn: &mut PgConnection,
    client: &Client,
    filters: &AnnotationFilters,
    offset: i64,
    limit: i64,
) -> ApiResult<(i64, Vec<AnnotationDocument>)> {
    let mut query = annotation::table
        .select(HeaderRow::as_select())
        .into_boxed()
        .filter(annotation::active.eq(true))
        .filter(annotation::annotation_id.is_null());
    if let Some(item_id) = &filters.item_id {
        query = query.filter(annotation::item_id.eq(item_id.as_ref()));
    }
    if let Some(creator_id) = &filters.creator_id {
        query = query.filter(annotation::creator_id.eq(creator_id.as_ref()));
    }
    if let Some(name) = &filters.name {
        query = query.filter(annotation::name.eq(name.as_str()));
    }
    if let Some(text) = &filters.text {
        let pattern = format!("%{text}%");
        query = query.filter(
            annotation::name
                .ilike(pattern.clone())
                .or(annotation::description.ilike(pattern)),
        );
    }
    let rows = query
        .order_by(annotation::name.asc())
        .then_order_by(annotation::id.asc())
        .load::<HeaderRow>(conn)?;

    let readable: Vec<HeaderRow> = rows
        .into_iter()
        .filter(|row| access::has_access(row.access.as_ref(), row.public, client, AccessLevel::Read))
        .collect();
    let total = readable.len() as i64;
    let page = readable
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(if limit > 0 { limit as usize } else { usize::MAX })
        .map(AnnotationDocument::from_row)
        .collect();
    Ok((total, page))
}

/// Items that carry at least one active annotation, most recently updated
/// first, restricted to items the client can read and optionally filtered by
/// annotation creator and image name.
pub fn find_annotated_images(
    conn: &mut PgConnection,
    client: &Client,
    creator_id: Option<&str>,
    image_name: Option<&str>,
    offset: i64,
    limit: i64,
) -> ApiResult<Vec<Item>> {
    let mut query = annotation::table
        .select(HeaderRow::as_select())
        .into_boxed()
        .filter(annotation::active.eq(true))
        .filter(annotation::annotation_id.is_null());
    if let Some(creator_id) = creator_id {
        query = query.filter(annotation::creator_id.eq(creator_id));
    }
    let rows = query
        .order_by(annotation::updated.desc())
        .then_order_by(annotation::id.asc())
        .load::<HeaderRow>(conn)?;

    let mut seen = std::collections::HashSet::new();
    let mut skipped = 0;
    let mut images = Vec::new();
    for row in rows {
        if !seen.insert(row.item_id.clone()) {
            continue;
        }
        let Some(found) = find_item(conn, &row.item_id)? else {
            continue;
        };
        let Some(parent) = find_folder(conn, &found.folder_id)? else {
            continue;
        };
        if !access::has_access(Some(&parent.access), parent.public, client, AccessLevel::Read) {
            continue;
        }
        if !matches_image_name(&found.name, image_name.unwrap_or("")) {
            continue;
        }
        if skipped < offset {
            skipped += 1;
            continue;
        }
        images.push(found);
        if limit > 0 && images.len() as i64 >= limit {
            break;
        }
    }
    Ok(images)
}

static NAME_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\W_]+").expect("token pattern must parse"));

/// An image name matches if it, or any token of it, begins with the filter
/// string. Tokens split on runs of non-word characters and underscores; the
/// comparison is case-insensitive.
pub fn matches_image_name(image_name: &str, filter: &str) -> bool {
    let image_name = image_name.to_lowercase();
    let filter = filter.to_lowercase();
    if image_name.starts_with(&filter) {
        return true;
    }
    NAME_TOKEN_REGEX
        .split(&image_name)
        .any(|token| token.starts_with(&filter))
}

/// Counts active annotations per item, permission-filtered.
pub fn annotation_counts(
    conn: &mut PgConnection,
    client: &Client,
    item_ids: &[&str],
) -> ApiResult<serde_json::Map<String, Value>> {
    let mut results = serde_json::Map::new();
    for &item_id in item_ids {
        let found = find_item(conn, item_id)?.ok_or(ApiError::NotFound(ResourceType::Item))?;
        let parent = find_folder(conn, &found.folder_id)?.ok_or(ApiError::NotFound(ResourceType::Folder))?;
        access::require_access(Some(&parent.access), parent.public, client, AccessLevel::Read)?;

        let filters = AnnotationFilters {
            item_id: Some(found.id.clone()),
            ..AnnotationFilters::default()
        };
        let (total, _) = find(conn, client, &filters, 0, 1)?;
        results.insert(item_id.to_string(), Value::from(total));
    }
    Ok(results)
}

/// One-shot startup migration: headers that predate access control get the
/// parent folder's ACL plus creator admin; headers that predate group
/// tracking get their group set computed. Rows whose item, folder or creator
/// has gone missing are logged and skipped.
pub fn migrate_database(conn: &mut PgConnection) -> ApiResult<()> {
    let missing_access: Vec<HeaderRow> = annotation::table
        .select(HeaderRow::as_select())
        .filter(annotation::access.is_null())
        .load(conn)?;
    for row in missing_access {
        match build_migrated_access(conn, &row)? {
            Some((acl, public)) => {
                diesel::update(annotation::table.find(row.id.as_ref()))
                    .set((annotation::access.eq(Some(acl)), annotation::public.eq(public)))
                    .execute(conn)?;
                info!("Generated annotation ACL for {}", row.id);
            }
            None => continue,
        }
    }

    let missing_groups: Vec<HeaderRow> = annotation::table
        .select(HeaderRow::as_select())
        .filter(annotation::groups.is_null())
        .load(conn)?;
    for row in missing_groups {
        let mut doc = AnnotationDocument::from_row(row);
        inject_group_set(conn, &mut doc)?;
    }
    Ok(())
}

fn build_migrated_access(conn: &mut PgConnection, row: &HeaderRow) -> ApiResult<Option<(Value, bool)>> {
    let Some(found) = find_item(conn, &row.item_id)? else {
        warn!("Could not generate annotation ACL due to missing item {}", row.id);
        return Ok(None);
    };
    let Some(parent) = find_folder(conn, &found.folder_id)? else {
        warn!("Could not generate annotation ACL due to missing folder {}", row.id);
        return Ok(None);
    };
    let creator: Option<UserAccount> = user_account::table
        .find(row.creator_id.as_ref())
        .select(UserAccount::as_select())
        .first(conn)
        .optional()?;
    let Some(creator) = creator else {
        warn!("Could not generate annotation ACL {} due to missing user {}", row.id, row.creator_id);
        return Ok(None);
    };

    let mut acl = access::copy_from_folder(&parent);
    access::grant_admin(&mut acl, &creator.id);
    Ok(Some((acl, parent.public)))
}

/// Announces a completed save. The event is observable through tracing and,
/// when webhooks are configured, as an asynchronous POST of the header JSON;
/// webhook failures are logged and never affect the save.
fn emit_save_history(config: &Config, doc: &AnnotationDocument) {
    info!(
        target: "annotations.save_history",
        id = %doc.id.as_deref().unwrap_or(""),
        version = doc.version,
        "saved annotation"
    );
    if config.webhooks.is_empty() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("No async runtime; skipping save-history webhooks");
        return;
    };
    let Ok(body) = serde_json::to_value(doc) else {
        return;
    };
    let body = std::sync::Arc::new(body);
    for url in &config.webhooks {
        handle.spawn(post_to_webhook(url.clone(), body.clone()));
    }
}

async fn post_to_webhook(url: url::Url, body: std::sync::Arc<Value>) {
    let post = async {
        let response = reqwest::Client::new().post(url.clone()).json(&*body).send().await?;
        response.error_for_status().map(|_| ()).map_err(ApiError::from)
    };
    if let Err(err) = post.await {
        warn!("Could not post save history to {url}. Details:\n{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_matches_on_token_prefixes() {
        assert!(matches_image_name("Sample_Slide-04.svs", "sam"));
        assert!(matches_image_name("Sample_Slide-04.svs", "slide"));
        assert!(matches_image_name("Sample_Slide-04.svs", "04"));
        assert!(matches_image_name("Sample_Slide-04.svs", "SLIDE"));
        assert!(matches_image_name("Sample_Slide-04.svs", ""));
        assert!(!matches_image_name("Sample_Slide-04.svs", "lide"));
        assert!(!matches_image_name("Sample_Slide-04.svs", "5"));
    }
}
