use utoipa::OpenApi;

pub const ANNOTATION_TAG: &str = "annotations";
pub const ITEM_TAG: &str = "items";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Slidemark",
        description = "Annotation store for whole-slide microscopy images.",
    ),
    tags(
        (name = ANNOTATION_TAG, description = "Geometric annotations attached to image items"),
        (name = ITEM_TAG, description = "Per-item annotation operations and collaborator glue"),
    )
)]
pub struct ApiDoc;
