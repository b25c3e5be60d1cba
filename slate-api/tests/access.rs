mod support;

use crate::support::test_app::{TestApp, spawn_test_app};

async fn cluster_with_tenant(app: &TestApp) -> String {
    app.create_group(&app.admin.token, "atlas").await;
    app.create_group(&app.admin.token, "cms").await;
    let response = app
        .create_cluster(&app.admin.token, "test-cluster", "atlas")
        .await;
    assert!(response.status().is_success(), "failed to register cluster");
    let created: serde_json::Value = response.json().await.unwrap();

    created["metadata"]["id"].as_str().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn owning_group_is_always_listed() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    let listed: serde_json::Value = app
        .list_allowed_groups(&app.admin.token, &cluster_id)
        .await
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "atlas");
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_grant_and_revoke_round_trip() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    let response = app.grant_access(&app.admin.token, &cluster_id, "*").await;
    assert!(response.status().is_success());

    let listed: serde_json::Value = app
        .list_allowed_groups(&app.admin.token, &cluster_id)
        .await
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["id"], "*");
    assert_eq!(items[0]["metadata"]["name"], "<all>");

    let response = app.revoke_access(&app.admin.token, &cluster_id, "*").await;
    assert!(response.status().is_success());

    let listed: serde_json::Value = app
        .list_allowed_groups(&app.admin.token, &cluster_id)
        .await
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "atlas");
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_grant_is_listed_next_to_the_owner() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    app.grant_access(&app.admin.token, &cluster_id, "cms").await;

    let listed: serde_json::Value = app
        .list_allowed_groups(&app.admin.token, &cluster_id)
        .await
        .json()
        .await
        .unwrap();
    let mut names: Vec<&str> = listed["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["metadata"]["name"].as_str().unwrap())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["atlas", "cms"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn granting_twice_is_idempotent() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    app.grant_access(&app.admin.token, &cluster_id, "cms").await;
    app.grant_access(&app.admin.token, &cluster_id, "cms").await;

    let listed: serde_json::Value = app
        .list_allowed_groups(&app.admin.token, &cluster_id)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["items"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn revoking_the_owning_group_is_rejected() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    let response = app
        .revoke_access(&app.admin.token, &cluster_id, "atlas")
        .await;
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "Error");
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_access_blocks_future_installs() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;
    let member = app.seed_user(false).await;
    app.add_user_to_group(&app.admin.token, &member.id, "cms")
        .await;

    app.grant_access(&app.admin.token, &cluster_id, "cms").await;
    app.allow_app(&app.admin.token, &cluster_id, "cms", "nginx")
        .await;

    // While access holds, installs succeed.
    let response = app
        .install_app(&member.token, "nginx", "cms", &cluster_id)
        .await;
    assert!(response.status().is_success());
    let created: serde_json::Value = response.json().await.unwrap();
    let instance_id = created["metadata"]["id"].as_str().unwrap().to_string();

    app.revoke_access(&app.admin.token, &cluster_id, "cms")
        .await;

    // The surviving instance remains, but new installs are refused.
    let response = app.get_instance(&member.token, &instance_id, false).await;
    assert!(response.status().is_success());

    let response = app
        .install_app(&member.token, "nginx", "cms", &cluster_id)
        .await;
    assert_eq!(response.status().as_u16(), 403);

    let listed: serde_json::Value = app
        .list_instances(&app.admin.token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn allow_list_gates_non_owner_installs() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;
    let member = app.seed_user(false).await;
    app.add_user_to_group(&app.admin.token, &member.id, "cms")
        .await;
    app.grant_access(&app.admin.token, &cluster_id, "cms").await;

    // Access alone is not enough; the application must be allow-listed.
    let response = app
        .install_app(&member.token, "nginx", "cms", &cluster_id)
        .await;
    assert_eq!(response.status().as_u16(), 403);

    app.allow_app(&app.admin.token, &cluster_id, "cms", "nginx")
        .await;
    let response = app
        .install_app(&member.token, "nginx", "cms", &cluster_id)
        .await;
    assert!(response.status().is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_application_grant_permits_any_application() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;
    let member = app.seed_user(false).await;
    app.add_user_to_group(&app.admin.token, &member.id, "cms")
        .await;
    app.grant_access(&app.admin.token, &cluster_id, "cms").await;
    app.allow_app(&app.admin.token, &cluster_id, "cms", "*").await;

    let response = app
        .install_app(&member.token, "nginx", "cms", &cluster_id)
        .await;
    assert!(response.status().is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn deny_app_round_trip() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;

    app.allow_app(&app.admin.token, &cluster_id, "cms", "nginx")
        .await;
    let listed: serde_json::Value = app
        .list_allowed_apps(&app.admin.token, &cluster_id, "cms")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["items"], serde_json::json!(["nginx"]));

    app.deny_app(&app.admin.token, &cluster_id, "cms", "nginx")
        .await;
    let listed: serde_json::Value = app
        .list_allowed_apps(&app.admin.token, &cluster_id, "cms")
        .await
        .json()
        .await
        .unwrap();
    assert!(listed["items"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn only_owners_and_admins_manage_access() {
    let app = spawn_test_app().await;
    let cluster_id = cluster_with_tenant(&app).await;
    let outsider = app.seed_user(false).await;

    let response = app.grant_access(&outsider.token, &cluster_id, "cms").await;
    assert_eq!(response.status().as_u16(), 403);

    let response = app
        .allow_app(&outsider.token, &cluster_id, "cms", "nginx")
        .await;
    assert_eq!(response.status().as_u16(), 403);
}
