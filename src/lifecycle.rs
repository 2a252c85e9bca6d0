use crate::api::ApiResult;
use crate::auth::Client;
use crate::config::Config;
use crate::model::annotation::HeaderRow;
use crate::model::enums::AccessLevel;
use crate::model::item::Item;
use crate::schema::annotation;
use crate::store::{annotation as annotation_store, element};
use crate::string::SmallString;
use diesel::prelude::*;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Remembers recently seen reference identifiers so that related events
/// arriving asynchronously (an item copy preparing and completing, payloads
/// landing in separate requests) can be correlated in-process.
pub struct ReferenceCache {
    entries: LruCache<SmallString, (Instant, SmallString)>,
    ttl: Duration,
}

impl ReferenceCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn remember(&mut self, key: SmallString, value: SmallString) {
        self.remember_at(Instant::now(), key, value);
    }

    pub fn recall(&mut self, key: &SmallString) -> Option<SmallString> {
        self.recall_at(Instant::now(), key)
    }

    fn remember_at(&mut self, now: Instant, key: SmallString, value: SmallString) {
        self.entries.put(key, (now, value));
    }

    fn recall_at(&mut self, now: Instant, key: &SmallString) -> Option<SmallString> {
        match self.entries.pop(key) {
            Some((inserted, value)) if now.duration_since(inserted) < self.ttl => Some(value),
            _ => None,
        }
    }
}

static RECENT_REFERENCES: LazyLock<Mutex<ReferenceCache>> = LazyLock::new(|| {
    const CAPACITY: usize = 100;
    const TTL: Duration = Duration::from_secs(86_400);
    Mutex::new(ReferenceCache::new(CAPACITY, TTL))
});

fn references() -> std::sync::MutexGuard<'static, ReferenceCache> {
    match RECENT_REFERENCES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// When an item is removed, its annotations go with it: marked inactive when
/// history is kept, deleted outright otherwise.
pub fn on_item_remove(conn: &mut PgConnection, config: &Config, item: &Item) -> ApiResult<usize> {
    if config.annotation_history {
        let marked = diesel::update(annotation::table.filter(annotation::item_id.eq(item.id.as_ref())))
            .set(annotation::active.eq(false))
            .execute(conn)?;
        return Ok(marked);
    }

    let rows: Vec<HeaderRow> = annotation::table
        .select(HeaderRow::as_select())
        .filter(annotation::item_id.eq(item.id.as_ref()))
        .load(conn)?;
    let count = rows.len();
    for row in rows {
        let logical_id = row.annotation_id.clone().unwrap_or_else(|| row.id.clone());
        diesel::delete(annotation::table.find(row.id.as_ref())).execute(conn)?;
        element::remove_for_annotation(conn, &logical_id)?;
    }
    Ok(count)
}

/// Before an item copy completes, note whether the source has any active
/// annotations worth copying. The destination id keys the stashed source id
/// until the copy-after stage picks it up.
pub fn prepare_copy_item(
    conn: &mut PgConnection,
    source: &Item,
    destination_id: &SmallString,
    copy_annotations: bool,
) -> ApiResult<()> {
    if !copy_annotations {
        return Ok(());
    }
    let has_active: Option<SmallString> = annotation::table
        .select(annotation::id)
        .filter(annotation::item_id.eq(source.id.as_ref()))
        .filter(annotation::active.eq(true))
        .filter(annotation::annotation_id.is_null())
        .first(conn)
        .optional()?;
    if has_active.is_some() {
        references().remember(destination_id.clone(), source.id.clone());
    }
    Ok(())
}

/// After an item copy, clone the source's active annotations under the new
/// item. Clones get fresh ids and the destination folder's access and public
/// flag.
pub fn after_copy_item(conn: &mut PgConnection, config: &Config, destination: &Item) -> ApiResult<usize> {
    let Some(source_id) = references().recall(&destination.id) else {
        return Ok(0);
    };
    copy_annotations_from_other_item(conn, config, &source_id, destination)
}

fn copy_annotations_from_other_item(
    conn: &mut PgConnection,
    config: &Config,
    source_id: &SmallString,
    destination: &Item,
) -> ApiResult<usize> {
    let parent = annotation_store::find_folder(conn, &destination.folder_id)?;
    let ids: Vec<SmallString> = annotation::table
        .select(annotation::id)
        .filter(annotation::item_id.eq(source_id.as_ref()))
        .filter(annotation::active.eq(true))
        .filter(annotation::annotation_id.is_null())
        .order(annotation::id.asc())
        .load(conn)?;
    let total = ids.len();

    let reader = Client::new(None, true);
    let mut count = 0;
    for id in ids {
        info!("Copying annotation {} of {total} from {source_id} to {}", count + 1, destination.id);
        // The annotation may have been deleted while earlier ones copied.
        let Some(mut doc) = annotation_store::load(conn, &id, None, true, &reader, AccessLevel::Read)? else {
            continue;
        };
        doc.id = None;
        doc.item_id = destination.id.clone();
        if let Some(parent) = &parent {
            doc.access = Some(parent.access.clone());
            doc.public = parent.public;
        }
        annotation_store::save(conn, config, &mut doc)?;
        count += 1;
    }
    info!("Copied {count} annotations from {source_id} to {}", destination.id);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_expire_and_consume() {
        let mut cache = ReferenceCache::new(100, Duration::from_secs(60));
        let now = Instant::now();
        let key = SmallString::new("aaaabbbbccccddddeeeeffff");
        let value = SmallString::new("0123456789abcdef01234567");

        cache.remember_at(now, key.clone(), value.clone());
        assert_eq!(cache.recall_at(now + Duration::from_secs(1), &key), Some(value.clone()));
        // Recall consumes the entry.
        assert_eq!(cache.recall_at(now + Duration::from_secs(2), &key), None);

        cache.remember_at(now, key.clone(), value);
        assert_eq!(cache.recall_at(now + Duration::from_secs(61), &key), None);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = ReferenceCache::new(2, Duration::from_secs(60));
        let now = Instant::now();
        let key = |text: &str| SmallString::new(text);

        cache.remember_at(now, key("first"), key("a"));
        cache.remember_at(now, key("second"), key("b"));
        cache.remember_at(now, key("third"), key("c"));
        assert_eq!(cache.recall_at(now, &key("first")), None);
        assert_eq!(cache.recall_at(now, &key("third")), Some(key("c")));
    }
}
