use crate::api::annotation::require_item;
use crate::api::doc::ITEM_TAG;
use crate::api::extract::{Json, Path, Query};
use crate::api::{self, ApiError, ApiResult};
use crate::app::AppState;
use crate::auth::Client;
use crate::encode::{geojson, stream};
use crate::lifecycle;
use crate::model::annotation::AnnotationData;
use crate::model::enums::AccessLevel;
use crate::model::item::Item;
use crate::plottable::{self, AdjacentSpec, PlottableSource};
use crate::schema::item;
use crate::store::annotation as annotation_store;
use crate::store::query::RegionParams;
use crate::string::{self, SmallString};
use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::HeaderValue;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

pub fn routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_item_annotations, create_item_annotations, delete_item_annotations))
        .routes(routes!(plot_list))
        .routes(routes!(plot_data))
        .routes(routes!(copy_item))
        .routes(routes!(delete_item))
}

/// Gets all annotations for an item as a streamed JSON array of complete
/// annotations. Annotations the client cannot read are omitted.
#[utoipa::path(
    get,
    path = "/annotation/item/{id}",
    tag = ITEM_TAG,
    responses(
        (status = 200, description = "Every readable annotation of the item, with elements"),
        (status = 403, description = "Read access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn get_item_annotations(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Read)?;
    let filters = annotation_store::AnnotationFilters {
        item_id: Some(found.id),
        ..annotation_store::AnnotationFilters::default()
    };
    let (_, headers) = annotation_store::find(&mut conn, &client, &filters, 0, 0)?;
    drop(conn);

    let (sender, receiver) = futures::channel::mpsc::unbounded::<Result<Bytes, Infallible>>();
    tokio::task::spawn_blocking(move || {
        let emit = |chunk: Vec<u8>| {
            let _ = sender.unbounded_send(Ok(Bytes::from(chunk)));
        };
        let result = (|| -> ApiResult<()> {
            let mut conn = state.get_connection()?;
            emit(b"[".to_vec());
            let mut first = true;
            for doc in headers {
                if !first {
                    emit(b",\n".to_vec());
                }
                first = false;
                stream::stream_annotation(&mut conn, doc, &RegionParams::default(), &mut |chunk| emit(chunk))?;
            }
            emit(b"]".to_vec());
            Ok(())
        })();
        if let Err(err) = result {
            tracing::warn!("Failed to stream item annotations. Details:\n{err}");
        }
    });

    let mut response = Body::from_stream(receiver).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// Creates multiple annotations on an item. The body may be a single
/// annotation, a list of annotations or annotation model records, or a
/// GeoJSON FeatureCollection.
#[utoipa::path(
    post,
    path = "/annotation/item/{id}",
    tag = ITEM_TAG,
    responses(
        (status = 200, description = "The number of annotations created"),
        (status = 400, description = "Validation error: an entry doesn't follow the schema"),
        (status = 403, description = "Write access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn create_item_annotations(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<usize>> {
    let creator = api::verify_logged_in(&client)?.clone();
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Write)?;

    let entries: Vec<Value> = if geojson::is_geojson(&body) {
        let parsed = geojson::GeoJsonAnnotation::parse(&body);
        if parsed.elements.is_empty() {
            return Err(ApiError::InvalidGeoJson(String::from("no convertible features")));
        }
        vec![parsed.into_annotation()]
    } else {
        match body {
            Value::Array(list) => list,
            single => vec![single],
        }
    };

    let mut created = 0;
    for entry in entries {
        if !entry.is_object() {
            return Err(ApiError::MalformedBulkEntry);
        }
        // Complete model records contribute their payload; everything else
        // about them (original creator, version) is ignored.
        let payload = entry.get("annotation").cloned().unwrap_or(entry);
        let data: AnnotationData =
            serde_json::from_value(payload).map_err(|err| ApiError::InvalidAnnotation(err.to_string()))?;
        annotation_store::create(&mut conn, &state.config, &found, &creator, data, None)?;
        created += 1;
    }
    Ok(Json(created))
}

/// Deletes all annotations of an item.
#[utoipa::path(
    delete,
    path = "/annotation/item/{id}",
    tag = ITEM_TAG,
    responses(
        (status = 200, description = "The number of annotations removed"),
        (status = 403, description = "Write access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn delete_item_annotations(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<Json<usize>> {
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Write)?;
    let filters = annotation_store::AnnotationFilters {
        item_id: Some(found.id),
        ..annotation_store::AnnotationFilters::default()
    };
    let (_, headers) = annotation_store::find(&mut conn, &client, &filters, 0, 0)?;
    let mut removed = 0;
    for doc in headers {
        annotation_store::remove(&mut conn, &state.config, &doc)?;
        removed += 1;
    }
    Ok(Json(removed))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct PlotListParams {
    /// A comma-separated list of annotation ids, or `__all__`.
    annotations: Option<String>,
    /// `false`, `true` (siblings of the same folder) or `__all__`.
    adjacent_items: Option<String>,
}

/// Lists the plottable columns discovered across folder, item, annotation
/// and element scopes.
#[utoipa::path(
    get,
    path = "/annotation/item/{id}/plot/list",
    tag = ITEM_TAG,
    params(PlotListParams),
    responses(
        (status = 200, description = "The discovered columns with per-column stats"),
        (status = 403, description = "Read access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn plot_list(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(params): Query<PlotListParams>,
) -> ApiResult<Json<Vec<plottable::ColumnOut>>> {
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Read)?;
    let source = PlottableSource::gather(
        &mut conn,
        &client,
        &found,
        params.annotations.as_deref(),
        AdjacentSpec::parse(params.adjacent_items.as_deref()),
    )?;
    Ok(Json(plottable::columns(&source)))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct PlotDataBody {
    /// The columns to return: a list of keys or a comma-delimited string.
    columns: Value,
    /// Only rows where all of these columns are non-null are returned.
    #[serde(default)]
    required_columns: Option<Value>,
    #[serde(default)]
    annotations: Option<String>,
    #[serde(default)]
    adjacent_items: Option<String>,
}

fn column_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(csv)) => csv.split(',').filter(|key| !key.is_empty()).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Materializes plottable data as a dense row-major table.
#[utoipa::path(
    post,
    path = "/annotation/item/{id}/plot/data",
    tag = ITEM_TAG,
    responses(
        (status = 200, description = "The requested columns and data rows"),
        (status = 403, description = "Read access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn plot_data(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Json(body): Json<PlotDataBody>,
) -> ApiResult<Json<plottable::PlotData>> {
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Read)?;
    let source = PlottableSource::gather(
        &mut conn,
        &client,
        &found,
        body.annotations.as_deref(),
        AdjacentSpec::parse(body.adjacent_items.as_deref()),
    )?;
    let requested = column_list(Some(&body.columns));
    let required = column_list(body.required_columns.as_ref());
    Ok(Json(plottable::data(&source, &requested, &required)))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase")]
struct CopyItemParams {
    /// Destination folder; defaults to the source item's folder.
    folder_id: Option<String>,
    /// Unless set to false, active annotations are copied with the item.
    copy_annotations: Option<bool>,
}

/// Copies an item, including (by default) its active annotations. This is
/// collaborator glue: item management proper lives outside this service, but
/// copies have to run through it so the annotation lifecycle hooks fire.
#[utoipa::path(
    post,
    path = "/item/{id}/copy",
    tag = ITEM_TAG,
    params(CopyItemParams),
    responses(
        (status = 200, description = "The new item"),
        (status = 403, description = "Write access was denied for the destination folder"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn copy_item(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
    Query(params): Query<CopyItemParams>,
) -> ApiResult<Json<Item>> {
    api::verify_logged_in(&client)?;
    let mut conn = state.get_connection()?;
    let source = require_item(&mut conn, &client, &id, AccessLevel::Read)?;

    let destination_folder = params.folder_id.as_deref().unwrap_or(&source.folder_id);
    let parent = annotation_store::find_folder(&mut conn, destination_folder)?
        .ok_or(ApiError::NotFound(crate::model::enums::ResourceType::Folder))?;
    crate::auth::access::require_access(Some(&parent.access), parent.public, &client, AccessLevel::Write)?;

    let copy = Item {
        id: string::generate_object_id(),
        folder_id: SmallString::new(destination_folder),
        name: source.name.clone(),
        meta: source.meta.clone(),
    };
    lifecycle::prepare_copy_item(&mut conn, &source, &copy.id, params.copy_annotations.unwrap_or(true))?;
    diesel::insert_into(item::table).values(&copy).execute(&mut conn)?;
    lifecycle::after_copy_item(&mut conn, &state.config, &copy)?;
    Ok(Json(copy))
}

/// Deletes an item and its annotations. Collaborator glue, as with copy.
#[utoipa::path(
    delete,
    path = "/item/{id}",
    tag = ITEM_TAG,
    responses(
        (status = 200, description = "The number of annotations the removal touched"),
        (status = 403, description = "Write access was denied for the item"),
        (status = 404, description = "Item not found"),
    ),
)]
async fn delete_item(
    State(state): State<AppState>,
    Extension(client): Extension<Client>,
    Path(id): Path<String>,
) -> ApiResult<Json<usize>> {
    let mut conn = state.get_connection()?;
    let found = require_item(&mut conn, &client, &id, AccessLevel::Write)?;
    let touched = lifecycle::on_item_remove(&mut conn, &state.config, &found)?;
    diesel::delete(item::table.find(found.id.as_ref())).execute(&mut conn)?;
    Ok(Json(touched))
}
