use crate::schema::annotation;
use crate::string::SmallString;
use crate::time::DateTime;
use diesel::pg::Pg;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A persisted annotation header. The live row for a logical annotation has
/// `annotation_id = None` and its `id` is the stable identity; archived rows
/// have a physical id of their own and point back via `annotation_id`.
#[derive(Clone, AsChangeset, Identifiable, Insertable, Queryable, Selectable)]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = annotation)]
#[diesel(check_for_backend(Pg))]
pub struct HeaderRow {
    pub id: SmallString,
    pub annotation_id: Option<SmallString>,
    pub item_id: SmallString,
    pub creator_id: SmallString,
    pub updated_by_id: SmallString,
    pub created: DateTime,
    pub updated: DateTime,
    pub version: i64,
    pub active: bool,
    pub access: Option<Value>,
    pub public: bool,
    pub public_flags: Option<Value>,
    pub name: String,
    pub description: Option<String>,
    pub attributes: Option<Value>,
    pub groups: Option<Vec<Option<SmallString>>>,
}

/// The caller-facing annotation container: a name with optional description
/// and free-form attributes, plus the element payloads. Elements stay as raw
/// JSON here; the validator produces the typed form.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AnnotationData {
    pub name: SmallString,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    #[serde(default)]
    pub elements: Vec<Value>,
}

/// An annotation header with its payload, in the shape the API works with.
/// `access` never serializes with the rest of the document; the ACL has its
/// own endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<SmallString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_id: Option<SmallString>,
    pub item_id: SmallString,
    pub creator_id: SmallString,
    pub updated_by_id: SmallString,
    pub created: DateTime,
    pub updated: DateTime,
    pub version: i64,
    pub active: bool,
    #[serde(skip)]
    pub access: Option<Value>,
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_flags: Option<Value>,
    pub annotation: AnnotationData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Option<SmallString>>>,
    #[serde(rename = "_versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<SmallString>,
    #[serde(rename = "_elementQuery", skip_serializing_if = "Option::is_none")]
    pub element_query: Option<Value>,
}

impl AnnotationDocument {
    pub fn from_row(row: HeaderRow) -> Self {
        Self {
            id: Some(row.id),
            annotation_id: row.annotation_id,
            item_id: row.item_id,
            creator_id: row.creator_id,
            updated_by_id: row.updated_by_id,
            created: row.created,
            updated: row.updated,
            version: row.version,
            active: row.active,
            access: row.access,
            public: row.public,
            public_flags: row.public_flags,
            annotation: AnnotationData {
                name: SmallString::new(row.name),
                description: row.description,
                attributes: row.attributes,
                elements: Vec::new(),
            },
            groups: row.groups,
            version_id: None,
            element_query: None,
        }
    }

    /// Flattens the document back into a header row under the given physical
    /// id. Elements are not part of the row.
    pub fn to_row(&self, id: &SmallString) -> HeaderRow {
        HeaderRow {
            id: id.clone(),
            annotation_id: self.annotation_id.clone(),
            item_id: self.item_id.clone(),
            creator_id: self.creator_id.clone(),
            updated_by_id: self.updated_by_id.clone(),
            created: self.created,
            updated: self.updated,
            version: self.version,
            active: self.active,
            access: self.access.clone(),
            public: self.public,
            public_flags: self.public_flags.clone(),
            name: self.annotation.name.to_string(),
            description: self.annotation.description.clone(),
            attributes: self.annotation.attributes.clone(),
            groups: self.groups.clone(),
        }
    }

    /// The id elements of this snapshot are stored under: the live header id
    /// for archived rows, the row's own id otherwise.
    pub fn logical_id(&self) -> Option<&SmallString> {
        self.annotation_id.as_ref().or(self.id.as_ref())
    }
}
