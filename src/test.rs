use crate::app::AppState;
use crate::config::Config;
use crate::db;
use crate::model::item::{Folder, Item, UserAccount};
use crate::schema::{folder, item, user_account};
use crate::string::{self, SmallString};
use axum_test::TestServer;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use serde_json::{Value, json};
use std::sync::OnceLock;

/// Returns the shared test state. The database named by `POSTGRES_DB` is
/// migrated on first use; tests that talk to it are `#[ignore]`d so the
/// suite passes without one.
pub fn get_state() -> AppState {
    static STATE: OnceLock<AppState> = OnceLock::new();
    STATE
        .get_or_init(|| {
            let manager = ConnectionManager::new(db::create_url(None));
            let pool = Pool::builder()
                .max_size(2)
                .build(manager)
                .expect("Test database must be reachable");
            let state = AppState::new(pool, Config::default());
            let mut conn = state.get_connection().expect("Test database must be reachable");
            db::run_migrations(&mut conn);
            crate::store::version::initialize(&mut conn).expect("Version sequence must initialize");
            state
        })
        .clone()
}

pub fn test_server(state: &AppState) -> TestServer {
    let (router, _api) = crate::api::routes(state.clone()).split_for_parts();
    TestServer::new(router).expect("Test server must be constructible")
}

pub struct Fixture {
    pub folder_id: SmallString,
    pub item_id: SmallString,
    pub user_id: SmallString,
}

/// Seeds a fresh folder/item/user triple. The user holds admin on the folder
/// through its ACL rather than site-wide.
pub fn seed(state: &AppState) -> Fixture {
    let mut conn = state.get_connection().expect("Test database must be reachable");
    let user_id = string::generate_object_id();
    let folder_id = string::generate_object_id();
    let item_id = string::generate_object_id();

    diesel::insert_into(user_account::table)
        .values(&UserAccount {
            id: user_id.clone(),
            name: String::from("annotator"),
            admin: false,
        })
        .execute(&mut conn)
        .unwrap();
    diesel::insert_into(folder::table)
        .values(&Folder {
            id: folder_id.clone(),
            name: String::from("cohort"),
            meta: json!({}),
            access: json!({"users": [{"id": user_id.as_ref(), "level": 2}], "groups": []}),
            public: false,
        })
        .execute(&mut conn)
        .unwrap();
    diesel::insert_into(item::table)
        .values(&Item {
            id: item_id.clone(),
            folder_id: folder_id.clone(),
            name: String::from("slide-1.svs"),
            meta: json!({}),
        })
        .execute(&mut conn)
        .unwrap();

    Fixture {
        folder_id,
        item_id,
        user_id,
    }
}

#[cfg(test)]
mod api_tests {
    use super::*;
    use serial_test::serial;

    fn rectangle_body() -> Value {
        json!({
            "name": "r",
            "elements": [{"type": "rectangle", "center": [20, 25, 0], "width": 14, "height": 15}],
        })
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a PostgreSQL database"]
    async fn create_then_load_returns_elements_in_order() {
        let state = get_state();
        let fixture = seed(&state);
        let server = test_server(&state);

        let created = server
            .post("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .json(&rectangle_body())
            .await;
        created.assert_status_ok();
        let created: Value = created.json();
        let id = created["id"].as_str().unwrap().to_string();
        assert!(created["version"].as_i64().unwrap() > 0);

        let fetched = server
            .get(&format!("/annotation/{id}"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await;
        fetched.assert_status_ok();
        let fetched: Value = fetched.json();
        let elements = fetched["annotation"]["elements"].as_array().unwrap();
        assert_eq!(elements.len(), 1);
        // Ids are populated on load.
        assert!(elements[0]["id"].as_str().is_some());
        assert_eq!(fetched["_elementQuery"]["count"], 1);
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a PostgreSQL database"]
    async fn each_save_records_a_version() {
        let state = get_state();
        let fixture = seed(&state);
        let server = test_server(&state);

        let created: Value = server
            .post("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .json(&rectangle_body())
            .await
            .json();
        let id = created["id"].as_str().unwrap().to_string();
        let first_version = created["version"].as_i64().unwrap();

        let mut elements = rectangle_body()["elements"].as_array().unwrap().clone();
        for x in [1, 2, 3] {
            elements.push(json!({"type": "point", "center": [x, 0, 0]}));
        }
        let updated = server
            .put(&format!("/annotation/{id}"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .json(&json!({"name": "r", "elements": elements}))
            .await;
        updated.assert_status_ok();
        let second_version = updated.json::<Value>()["version"].as_i64().unwrap();
        assert!(second_version > first_version);

        let history: Value = server
            .get(&format!("/annotation/{id}/history"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(history.as_array().unwrap().len(), 2);

        let old: Value = server
            .get(&format!("/annotation/{id}/history/{first_version}"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(old["annotation"]["elements"].as_array().unwrap().len(), 1);

        let new: Value = server
            .get(&format!("/annotation/{id}/history/{second_version}"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(new["annotation"]["elements"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a PostgreSQL database"]
    async fn item_copies_carry_active_annotations_unless_disabled() {
        let state = get_state();
        let fixture = seed(&state);
        let server = test_server(&state);

        server
            .post("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .json(&rectangle_body())
            .await
            .assert_status_ok();

        let bare: Value = server
            .post(&format!("/item/{}/copy", fixture.item_id))
            .add_query_param("copyAnnotations", "false")
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        let annotations: Value = server
            .get("/annotation")
            .add_query_param("itemId", bare["id"].as_str().unwrap())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(annotations["total"], 0);

        let full: Value = server
            .post(&format!("/item/{}/copy", fixture.item_id))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        let annotations: Value = server
            .get("/annotation")
            .add_query_param("itemId", full["id"].as_str().unwrap())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(annotations["total"], 1);
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a PostgreSQL database"]
    async fn revert_after_delete_restores_the_annotation() {
        let state = get_state();
        let fixture = seed(&state);
        let server = test_server(&state);

        let created: Value = server
            .post("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .json(&rectangle_body())
            .await
            .json();
        let id = created["id"].as_str().unwrap().to_string();

        server
            .delete(&format!("/annotation/{id}"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .assert_status_ok();
        let listed: Value = server
            .get("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(listed["total"], 0);

        let reverted = server
            .put(&format!("/annotation/{id}/history/revert"))
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await;
        reverted.assert_status_ok();
        assert_eq!(reverted.json::<Value>()["active"], true);

        let listed: Value = server
            .get("/annotation")
            .add_query_param("itemId", fixture.item_id.as_ref())
            .add_header("x-user-id", fixture.user_id.as_ref())
            .await
            .json();
        assert_eq!(listed["total"], 1);
    }
}
