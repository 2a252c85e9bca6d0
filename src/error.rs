pub trait ErrorKind {
    fn kind(&self) -> &'static str;
}

impl ErrorKind for axum::extract::path::ErrorKind {
    fn kind(&self) -> &'static str {
        match self {
            Self::WrongNumberOfParameters { .. } => "WrongNumberOfPathParameters",
            Self::ParseErrorAtKey { .. } => "PathParseErrorAtKey",
            Self::ParseErrorAtIndex { .. } => "PathParseErrorAtIndex",
            Self::ParseError { .. } => "PathParseError",
            Self::InvalidUtf8InPathParam { .. } => "InvalidUtf8InPathParam",
            Self::UnsupportedType { .. } => "UnsupportedPathType",
            Self::DeserializeError { .. } => "PathDeserializeError",
            Self::Message(_) => "OtherPathError",
            _ => "UnknownPathDeserializeError",
        }
    }
}

impl ErrorKind for axum::extract::rejection::JsonRejection {
    fn kind(&self) -> &'static str {
        match self {
            Self::JsonDataError(_) => "JsonDataError",
            Self::JsonSyntaxError(_) => "JsonSyntaxError",
            Self::MissingJsonContentType(_) => "MissingJsonContentType",
            Self::BytesRejection(_) => "BytesRejection",
            _ => "UnknownJsonRejectionError",
        }
    }
}

impl ErrorKind for axum::extract::rejection::PathRejection {
    fn kind(&self) -> &'static str {
        match self {
            Self::FailedToDeserializePathParams(err) => err.kind().kind(),
            Self::MissingPathParams(_) => "MissingPathParams",
            _ => "UnknownPathRejectionError",
        }
    }
}

impl ErrorKind for axum::extract::rejection::QueryRejection {
    fn kind(&self) -> &'static str {
        match self {
            Self::FailedToDeserializeQueryString(_) => "FailedToDeserializeQueryString",
            _ => "UnknownQueryRejectionError",
        }
    }
}

impl ErrorKind for crate::model::enums::ResourceType {
    fn kind(&self) -> &'static str {
        match self {
            Self::Annotation => "AnnotationNotFound",
            Self::AnnotationVersion => "AnnotationVersionNotFound",
            Self::Item => "ItemNotFound",
            Self::Folder => "FolderNotFound",
            Self::User => "UserNotFound",
        }
    }
}

impl ErrorKind for diesel::result::DatabaseErrorKind {
    fn kind(&self) -> &'static str {
        match self {
            Self::CheckViolation => "CheckViolation",
            Self::ClosedConnection => "ClosedConnection",
            Self::ForeignKeyViolation => "ForeignKeyViolation",
            Self::NotNullViolation => "NotNullViolation",
            Self::ReadOnlyTransaction => "ReadOnlyTransaction",
            Self::SerializationFailure => "SerializationFailure",
            Self::UnableToSendCommand => "UnableToSendCommand",
            Self::UniqueViolation => "UniqueViolation",
            _ => "UnknownDatabaseError",
        }
    }
}

impl ErrorKind for diesel::result::Error {
    fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyInTransaction => "AlreadyInTransaction",
            Self::BrokenTransactionManager => "BrokenTransactionManager",
            Self::DatabaseError(err, _) => err.kind(),
            Self::DeserializationError(_) => "DeserializationError",
            Self::InvalidCString(_) => "InvalidCString",
            Self::NotFound => "RowNotFound",
            Self::NotInTransaction => "NotInTransaction",
            Self::QueryBuilderError(_) => "QueryBuilderError",
            Self::RollbackErrorOnCommit { rollback_error, .. } => rollback_error.kind(),
            Self::RollbackTransaction => "RollbackTransaction",
            Self::SerializationError(_) => "SerializationError",
            _ => "UnknownQueryError",
        }
    }
}

impl ErrorKind for serde_json::error::Category {
    fn kind(&self) -> &'static str {
        match self {
            Self::Io => "JsonIoError",
            Self::Syntax => "JsonInvalidSyntax",
            Self::Data => "JsonInvalidData",
            Self::Eof => "JsonUnexpectedEOF",
        }
    }
}

impl ErrorKind for crate::api::ApiError {
    fn kind(&self) -> &'static str {
        use crate::api::ApiError;
        match self {
            ApiError::FailedConnection(_) => "FailedConnection",
            ApiError::FailedQuery(err) => err.kind(),
            ApiError::InsufficientPrivileges => "InsufficientPrivileges",
            ApiError::InvalidAnnotation(_) => "InvalidAnnotation",
            ApiError::InvalidGeoJson(_) => "InvalidGeoJson",
            ApiError::InvalidMinimumAge(_) => "InvalidMinimumAge",
            ApiError::InvalidKeepVersions => "InvalidKeepVersions",
            ApiError::JsonRejection(err) => err.kind(),
            ApiError::JsonSerialization(err) => err.classify().kind(),
            ApiError::MalformedBulkEntry => "MalformedBulkEntry",
            ApiError::NotFound(err) => err.kind(),
            ApiError::NotLoggedIn => "NotLoggedIn",
            ApiError::PathRejection(err) => err.kind(),
            ApiError::QueryRejection(err) => err.kind(),
            ApiError::Request(_) => "RequestError",
            ApiError::UnrepresentableElement(_) => "UnrepresentableElement",
        }
    }
}
