use crate::api::{ApiError, ApiResult};
use crate::auth::Client;
use crate::model::enums::AccessLevel;
use crate::model::item::Folder;
use crate::string::SmallString;
use serde_json::{Value, json};

/// Resolves the highest access level `client` holds on a resource with the
/// given ACL document and public flag. Site admins hold admin on everything;
/// the public flag grants read to anyone.
pub fn access_level(access: Option<&Value>, public: bool, client: &Client) -> Option<AccessLevel> {
    if client.admin {
        return Some(AccessLevel::Admin);
    }

    let granted = client.id.as_ref().and_then(|user_id| {
        access?
            .get("users")?
            .as_array()?
            .iter()
            .filter(|entry| entry.get("id").and_then(Value::as_str) == Some(user_id))
            .filter_map(|entry| entry.get("level").and_then(Value::as_i64))
            .filter_map(|level| match level {
                0 => Some(AccessLevel::Read),
                1 => Some(AccessLevel::Write),
                2 => Some(AccessLevel::Admin),
                _ => None,
            })
            .max()
    });

    match granted {
        Some(level) => Some(level),
        None => public.then_some(AccessLevel::Read),
    }
}

pub fn has_access(access: Option<&Value>, public: bool, client: &Client, needed: AccessLevel) -> bool {
    access_level(access, public, client).is_some_and(|level| level >= needed)
}

/// Checks that `client` holds at least `needed` on the resource.
/// Returns an error otherwise.
pub fn require_access(access: Option<&Value>, public: bool, client: &Client, needed: AccessLevel) -> ApiResult<()> {
    if has_access(access, public, client, needed) {
        Ok(())
    } else if client.id.is_none() {
        Err(ApiError::NotLoggedIn)
    } else {
        Err(ApiError::InsufficientPrivileges)
    }
}

/// The ACL a new annotation starts with: a copy of the parent folder's.
pub fn copy_from_folder(folder: &Folder) -> Value {
    folder.access.clone()
}

/// Grants `user_id` admin on the ACL document, replacing any prior entry for
/// that user.
pub fn grant_admin(access: &mut Value, user_id: &SmallString) {
    let entry = json!({"id": user_id.as_ref(), "level": AccessLevel::Admin as i8});
    if let Some(users) = access.get_mut("users").and_then(Value::as_array_mut) {
        users.retain(|existing| existing.get("id").and_then(Value::as_str) != Some(user_id));
        users.push(entry);
    } else if let Some(map) = access.as_object_mut() {
        map.insert(String::from("users"), Value::Array(vec![entry]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(user_id: &str, level: i8) -> Value {
        json!({"users": [{"id": user_id, "level": level}], "groups": []})
    }

    fn user(id: &str) -> Client {
        Client::new(Some(SmallString::new(id)), false)
    }

    #[test]
    fn acl_grants() {
        let access = acl("a1b2c3d4e5f6a1b2c3d4e5f6", 1);
        let owner = user("a1b2c3d4e5f6a1b2c3d4e5f6");
        let stranger = user("ffffffffffffffffffffffff");

        assert_eq!(access_level(Some(&access), false, &owner), Some(AccessLevel::Write));
        assert_eq!(access_level(Some(&access), false, &stranger), None);
        assert_eq!(access_level(Some(&access), true, &stranger), Some(AccessLevel::Read));
        assert_eq!(access_level(None, false, &Client::anonymous()), None);
    }

    #[test]
    fn admins_hold_admin_everywhere() {
        let admin = Client::new(Some(SmallString::new("a1b2c3d4e5f6a1b2c3d4e5f6")), true);
        assert_eq!(access_level(None, false, &admin), Some(AccessLevel::Admin));
    }

    #[test]
    fn grant_admin_replaces_existing_entry() {
        let user_id = SmallString::new("a1b2c3d4e5f6a1b2c3d4e5f6");
        let mut access = acl(&user_id, 0);
        grant_admin(&mut access, &user_id);

        let users = access["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["level"], 2);
        assert!(has_access(Some(&access), false, &user(&user_id), AccessLevel::Admin));
    }
}
