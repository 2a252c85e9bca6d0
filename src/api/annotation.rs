use crate::api::doc::ANNOTATION_TAG;
use crate::api::extract::{Json, Path, Query};
use crate::api::{self, ApiError, ApiResult, PageParams, PagedResponse};
use crate::app::AppState;
use crate::auth::{Client, access};
use crate::encode::{geojson, stream};
use crate::model::annotation::{AnnotationData, AnnotationDocument};
use crate::model::enums::{AccessLevel, ResourceType};
use crate::model::item::Item;
use crate::store::query::RegionParams;
use crate::store::{annotation as annotation_store, history};
use crate::validate;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::HeaderValue;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

pub fn routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(find, create))
        .routes(routes!(annotation_schema))
        .routes(routes!(find_annotated_images))
        .routes(routes!(annotation_counts))
        .routes(routes!(report_old, delete_old))
        .routes(routes!(get, update, delete))
        .routes(routes!(copy))
        .routes(routes!(get_access, update_access))
        .routes(routes!(history_list))
        .routes(routes!(history_get))
        .routes(routes!(history_revert))
        .routes(routes!(get_geojson))
}

const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct FindParams {
    /// List all annotations in this item.
    item_id: Option<String>,
    /// List all annotations created by this user.
    user_id: Option<String>,
    /// Case-insensitive match on annotation names and descriptions.
    text: Option<String>,
    /// Exact name match.
    name: Option<String>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct ItemIdParams {
    /// The ID of the associated item.
    item_id: String,
}

/// Looks up an item and checks the client holds `level` on its folder.
pub fn require_item(conn: &mut diesel::PgConnection, client: &Client, id: &str, level: AccessLevel) -> ApiResult<Item> {
    let found = annotation_store::find_item(conn, id)?.ok_or(ApiError::NotFound(ResourceType::Item))?;
    let parent =
        annotation_store::find_folder(conn, &found.folder_id)?.ok_or(ApiError::NotFound(ResourceType::Folder))?;
    access::require_access(Some(&parent.access), parent.public, client, level)?;
    Ok(found)
}

fn load_or_not_found(
    conn: &mut diesel::PgConnection,
    id: &str,
    region: Option<&RegionParams>,
    get_elements: bool,
    client: &Client,
    level: AccessLevel,
) -> ApiResult<AnnotationDocument> {
    annotation_store::load(conn, id, region, get_elements, client, level)?
        .ok_or(ApiError::NotFound(ResourceType::Annotation))
}

/// Searches for annotations.
#[utoipa::path(
    get,
    path = "/annotation",
    tag = ANNOTATION_TAG,
    params(FindParams, PageParams),
    responses(
        (status = 200, description = "A paged list of matching annotation headers"),
        (status = 403, description = "Read access was denied on the parent item"),
    ),
)]
async fn find(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<FindParams>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<PagedResponse<AnnotationDocument>>> {
    let mut conn = state.get_connection()?;
    let mut filters = annotation_store::AnnotationFilters {
        name: params.name,
        text: params.text,
        ..annotation_store::AnnotationFilters::default()
    };
    if let Some(item_id) = &params.item_id {
        let found = require_item(&mut conn, &client, item_id, AccessLevel::Read)?;
        filters.item_id = Some(found.id);
    }
    if let Some(user_id) = &params.user_id {
        filters.creator_id = Some(user_id.as_str().into());
    }

    let offset = page.offset();
    let limit = page.limit_or(DEFAULT_PAGE_LIMIT);
    let (total, results) = annotation_store::find(&mut conn, &client, &filters, offset, limit)?;
    Ok(Json(PagedResponse {
        offset,
        limit,
        total,
        results,
    }))
}

/// Returns the official annotation schema. In addition to the schema, if IDs
/// are specified on elements, all IDs must be unique.
#[utoipa::path(
    get,
    path = "/annotation/schema",
    tag = ANNOTATION_TAG,
    responses((status = 200, description = "The annotation JSON schema")),
)]
async fn annotation_schema() -> Json<Value> {
    Json(validate::annotation_schema())
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct AnnotatedImagesParams {
    /// Limit to annotations created by this user.
    creator_id: Option<String>,
    /// Filter results by image name (case-insensitive, prefix on tokens).
    image_name: Option<String>,
}

/// Searches for images with annotations.
#[utoipa::path(
    get,
    path = "/annotation/images",
    tag = ANNOTATION_TAG,
    params(AnnotatedImagesParams, PageParams),
    responses((status = 200, description = "Recently annotated items the client can read")),
)]
async fn find_annotated_images(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<AnnotatedImagesParams>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Vec<Item>>> {
    let mut conn = state.get_connection()?;
    let images = annotation_store::find_annotated_images(
        &mut conn,
        &client,
        params.creator_id.as_deref(),
        params.image_name.as_deref(),
        page.offset(),
        page.limit_or(DEFAULT_PAGE_LIMIT),
    )?;
    Ok(Json(images))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct CountParams {
    /// A comma-separated list of item ids.
    items: String,
}

/// Gets annotation counts for a list of items.
#[utoipa::path(
    get,
    path = "/annotation/counts",
    tag = ANNOTATION_TAG,
    params(CountParams),
    responses((status = 200, description = "Active annotation counts keyed by item id")),
)]
async fn annotation_counts(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.get_connection()?;
    let ids: Vec<&str> = params.items.split(',').filter(|id| !id.is_empty()).collect();
    let counts = annotation_store::annotation_counts(&mut conn, &client, &ids)?;
    Ok(Json(Value::Object(counts)))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct GcParams {
    /// The minimum age in days.
    age: Option<i64>,
    /// Keep at least this many history entries for each annotation.
    versions: Option<i64>,
}

/// Reports on old annotations.
#[utoipa::path(
    get,
    path = "/annotation/old",
    tag = ANNOTATION_TAG,
    params(GcParams),
    responses((status = 200, description = "A report of what a removal run would do")),
)]
async fn report_old(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<GcParams>,
) -> ApiResult<Json<history::GcReport>> {
    api::verify_admin(&client)?;
    let mut conn = state.get_connection()?;
    let report = history::remove_old_annotations(&mut conn, false, params.age.unwrap_or(30), params.versions.unwrap_or(10))?;
    Ok(Json(report))
}

/// Deletes old annotations.
#[utoipa::path(
    delete,
    path = "/annotation/old",
    tag = ANNOTATION_TAG,
    params(GcParams),
    responses((status = 200, description = "A report of the removal run")),
)]
async fn delete_old(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<GcParams>,
) -> ApiResult<Json<history::GcReport>> {
    api::verify_admin(&client)?;
    let mut conn = state.get_connection()?;
    let report = history::remove_old_annotations(&mut conn, true, params.age.unwrap_or(30), params.versions.unwrap_or(10))?;
    Ok(Json(report))
}

/// Gets an annotation by id, streaming its elements.
///
/// Use `left`, `right`, `top`, `bottom`, `low`, `high`, `minimumSize` and
/// `maxDetails` to fetch only the elements visible at a given zoom;
/// `centroids` returns the compact binary listing instead of full elements.
#[utoipa::path(
    get,
    path = "/annotation/{id}",
    tag = ANNOTATION_TAG,
    params(RegionParams),
    responses(
        (status = 200, description = "The annotation, elements streamed"),
        (status = 403, description = "Read access was denied for the annotation"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn get(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(region): Query<RegionParams>,
) -> ApiResult<Response> {
    let mut conn = state.get_connection()?;
    let doc = load_or_not_found(&mut conn, &id, None, false, &client, AccessLevel::Read)?;
    drop(conn);
    Ok(stream_response(state, doc, region))
}

/// Spawns the blocking element walk and returns a response that streams its
/// chunks.
fn stream_response(state: AppState, doc: AnnotationDocument, region: RegionParams) -> Response {
    let centroids = region.centroids.unwrap_or(false);
    let (sender, receiver) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
    tokio::task::spawn_blocking(move || {
        let result = (|| -> ApiResult<()> {
            let mut conn = state.get_connection()?;
            stream::stream_annotation(&mut conn, doc, &region, &mut |chunk| {
                let _ = sender.unbounded_send(Ok(Bytes::from(chunk)));
            })
        })();
        if let Err(err) = result {
            tracing::warn!("Failed to stream annotation. Details:\n{err}");
        }
    });

    let mut response = Body::from_stream(receiver).into_response();
    let content_type = if centroids {
        HeaderValue::from_static("application/octet-stream")
    } else {
        HeaderValue::from_static("application/json")
    };
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

/// Creates an annotation.
#[utoipa::path(
    post,
    path = "/annotation",
    tag = ANNOTATION_TAG,
    params(ItemIdParams),
    responses(
        (status = 200, description = "The created annotation"),
        (status = 400, description = "Validation error: the body doesn't follow the schema"),
        (status = 403, description = "Write access was denied for the item"),
    ),
)]
async fn create(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Query(params): Query<ItemIdParams>,
    Json(data): Json<AnnotationData>,
) -> ApiResult<Json<AnnotationDocument>> {
    let creator = api::verify_logged_in(&client)?.clone();
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &params.item_id, AccessLevel::Write)?;
    let doc = annotation_store::create(&mut conn, &state.config, &found, &creator, data, None)?;
    Ok(Json(doc))
}

/// Copies an annotation from one item to another.
#[utoipa::path(
    post,
    path = "/annotation/{id}/copy",
    tag = ANNOTATION_TAG,
    params(ItemIdParams),
    responses(
        (status = 200, description = "The copy, attached to the destination item"),
        (status = 403, description = "Write access was denied for the destination item"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn copy(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(params): Query<ItemIdParams>,
) -> ApiResult<Json<AnnotationDocument>> {
    let creator = api::verify_logged_in(&client)?.clone();
    let mut conn = state.get_connection()?;
    let source = load_or_not_found(&mut conn, &id, None, true, &client, AccessLevel::Read)?;
    let destination = require_item(&mut conn, &client, &params.item_id, AccessLevel::Write)?;
    let doc = annotation_store::create(&mut conn, &state.config, &destination, &creator, source.annotation, None)?;
    Ok(Json(doc))
}

/// The update body; when `elements` is omitted the persisted elements are
/// preserved.
#[derive(Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct AnnotationUpdate {
    name: crate::string::SmallString,
    description: Option<String>,
    attributes: Option<Value>,
    elements: Option<Vec<Value>>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    /// Pass this to move the annotation to a new item.
    item_id: Option<String>,
}

/// Updates an annotation or moves it to a different item.
#[utoipa::path(
    put,
    path = "/annotation/{id}",
    tag = ANNOTATION_TAG,
    params(MoveParams),
    responses(
        (status = 200, description = "The updated annotation"),
        (status = 400, description = "Validation error: the body doesn't follow the schema"),
        (status = 403, description = "Write access was denied for the annotation"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn update(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(params): Query<MoveParams>,
    body: Option<Json<AnnotationUpdate>>,
) -> ApiResult<Json<AnnotationDocument>> {
    let mut conn = state.get_connection()?;
    let mut doc = load_or_not_found(&mut conn, &id, None, true, &client, AccessLevel::Write)?;

    let mut return_elements = true;
    if let Some(Json(replacement)) = body {
        let old_elements = std::mem::take(&mut doc.annotation.elements);
        doc.annotation = AnnotationData {
            name: replacement.name,
            description: replacement.description,
            attributes: replacement.attributes,
            elements: Vec::new(),
        };
        match replacement.elements {
            Some(elements) => doc.annotation.elements = elements,
            None if !old_elements.is_empty() => {
                doc.annotation.elements = old_elements;
                return_elements = false;
            }
            None => {}
        }
    }
    if let Some(item_id) = &params.item_id {
        let destination = require_item(&mut conn, &client, item_id, AccessLevel::Write)?;
        doc.item_id = destination.id;
    }

    annotation_store::update_annotation(&mut conn, &state.config, &mut doc, &client)?;
    if !return_elements {
        doc.annotation.elements = Vec::new();
    }
    Ok(Json(doc))
}

/// Deletes an annotation. With history enabled the annotation is marked
/// inactive and can be restored through a revert.
#[utoipa::path(
    delete,
    path = "/annotation/{id}",
    tag = ANNOTATION_TAG,
    responses(
        (status = 200, description = "The annotation was removed"),
        (status = 403, description = "Write access was denied for the annotation"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn delete(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let mut conn = state.get_connection()?;
    let doc = load_or_not_found(&mut conn, &id, None, false, &client, AccessLevel::Write)?;
    annotation_store::remove(&mut conn, &state.config, &doc)
}

/// Gets the access control list for an annotation.
#[utoipa::path(
    get,
    path = "/annotation/{id}/access",
    tag = ANNOTATION_TAG,
    responses(
        (status = 200, description = "The access control record"),
        (status = 403, description = "Admin access was denied for the annotation"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn get_access(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.get_connection()?;
    let doc = load_or_not_found(&mut conn, &id, None, false, &client, AccessLevel::Admin)?;
    Ok(Json(doc.access.unwrap_or_else(|| serde_json::json!({"users": [], "groups": []}))))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AccessUpdate {
    access: Value,
    #[serde(default)]
    public: Option<bool>,
    #[serde(default)]
    public_flags: Option<Value>,
}

/// Updates the access control list for an annotation.
#[utoipa::path(
    put,
    path = "/annotation/{id}/access",
    tag = ANNOTATION_TAG,
    responses(
        (status = 200, description = "The annotation with its new access applied"),
        (status = 403, description = "Admin access was denied for the annotation"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn update_access(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Json(update): Json<AccessUpdate>,
) -> ApiResult<Json<AnnotationDocument>> {
    let mut conn = state.get_connection()?;
    let mut doc = load_or_not_found(&mut conn, &id, None, false, &client, AccessLevel::Admin)?;
    let public = update.public.unwrap_or(doc.public);
    annotation_store::set_access_list(&mut conn, &id, update.access.clone(), public, update.public_flags.clone())?;
    doc.access = Some(update.access);
    doc.public = public;
    doc.public_flags = update.public_flags;
    Ok(Json(doc))
}

/// Gets a list of an annotation's history.
#[utoipa::path(
    get,
    path = "/annotation/{id}/history",
    tag = ANNOTATION_TAG,
    params(PageParams),
    responses(
        (status = 200, description = "One header per version, newest first"),
        (status = 403, description = "Read access was denied for the annotation"),
    ),
)]
async fn history_list(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Vec<AnnotationDocument>>> {
    let mut conn = state.get_connection()?;
    let entries = history::version_list(&mut conn, &client, &id, page.limit_or(0), page.offset(), false)?;
    Ok(Json(entries))
}

/// Gets a specific version of an annotation's history.
#[utoipa::path(
    get,
    path = "/annotation/{id}/history/{version}",
    tag = ANNOTATION_TAG,
    responses(
        (status = 200, description = "The annotation as of that version"),
        (status = 404, description = "Annotation history version not found"),
    ),
)]
async fn history_get(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path((id, version)): Path<(String, i64)>,
) -> ApiResult<Json<AnnotationDocument>> {
    let mut conn = state.get_connection()?;
    let entry = history::get_version(&mut conn, &client, &id, version, false)?
        .ok_or(ApiError::NotFound(ResourceType::AnnotationVersion))?;
    Ok(Json(entry))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct RevertParams {
    /// The version to revert to. If not specified, a deleted annotation is
    /// undeleted, anything else reverts to the previous version.
    version: Option<i64>,
}

/// Reverts an annotation to a specific version. This can be used to undelete
/// an annotation by reverting to the most recent version.
#[utoipa::path(
    put,
    path = "/annotation/{id}/history/revert",
    tag = ANNOTATION_TAG,
    params(RevertParams),
    responses(
        (status = 200, description = "The annotation after the revert"),
        (status = 404, description = "Annotation history version not found"),
    ),
)]
async fn history_revert(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(params): Query<RevertParams>,
) -> ApiResult<Json<AnnotationDocument>> {
    let mut conn = state.get_connection()?;
    let mut doc = history::revert_version(&mut conn, &state.config, &client, &id, params.version)?
        .ok_or(ApiError::NotFound(ResourceType::AnnotationVersion))?;
    // The element list can be enormous; leave it to targeted fetches.
    doc.annotation.elements = Vec::new();
    Ok(Json(doc))
}

/// Gets an annotation as a GeoJSON FeatureCollection. Shapes with no GeoJSON
/// rendering (heatmap, griddata, arrow, rectanglegrid) are skipped.
#[utoipa::path(
    get,
    path = "/annotation/{id}/geojson",
    tag = ANNOTATION_TAG,
    responses(
        (status = 200, description = "The annotation as GeoJSON"),
        (status = 404, description = "Annotation not found"),
    ),
)]
async fn get_geojson(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.get_connection()?;
    let mut doc = load_or_not_found(&mut conn, &id, None, true, &client, AccessLevel::Read)?;
    let elements = std::mem::take(&mut doc.annotation.elements);
    doc.element_query = None;
    let header = serde_json::to_value(&doc.annotation)?;
    let collection = geojson::feature_collection(&elements, &header, false)?;
    Ok(Json(collection))
}
