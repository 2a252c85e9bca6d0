use crate::schema::{folder, item, user_account};
use crate::string::SmallString;
use diesel::pg::Pg;
use diesel::prelude::*;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Identifiable, Insertable, Queryable, Selectable)]
#[diesel(table_name = folder)]
#[diesel(check_for_backend(Pg))]
pub struct Folder {
    pub id: SmallString,
    pub name: String,
    pub meta: Value,
    pub access: Value,
    pub public: bool,
}

#[derive(Clone, Serialize, Identifiable, Insertable, Queryable, Selectable)]
#[serde(rename_all = "camelCase")]
#[diesel(belongs_to(Folder))]
#[diesel(table_name = item)]
#[diesel(check_for_backend(Pg))]
pub struct Item {
    pub id: SmallString,
    pub folder_id: SmallString,
    pub name: String,
    pub meta: Value,
}

#[derive(Clone, Identifiable, Insertable, Queryable, Selectable)]
#[diesel(table_name = user_account)]
#[diesel(check_for_backend(Pg))]
pub struct UserAccount {
    pub id: SmallString,
    pub name: String,
    pub admin: bool,
}
