use serde_repr::{Deserialize_repr, Serialize_repr};
use strum::Display;

/// Access levels an ACL entry can grant. Serialized numerically, matching
/// the access records stored on folders.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(i8)]
pub enum AccessLevel {
    Read = 0,
    Write = 1,
    Admin = 2,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Annotation,
    #[strum(serialize = "annotation version")]
    AnnotationVersion,
    Item,
    Folder,
    User,
}
