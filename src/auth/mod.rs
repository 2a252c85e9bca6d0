pub mod access;

use crate::string::SmallString;

/// The acting principal for a request. Authentication itself happens outside
/// the core; the middleware only resolves the caller into an optional user id
/// plus a site-admin flag.
#[derive(Debug, Default, Clone)]
pub struct Client {
    pub id: Option<SmallString>,
    pub admin: bool,
}

impl Client {
    pub fn new(id: Option<SmallString>, admin: bool) -> Self {
        Self { id, admin }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}
