mod support;

use crate::support::test_app::spawn_test_app;

#[tokio::test(flavor = "multi_thread")]
async fn group_create_and_read_round_trip() {
    let app = spawn_test_app().await;

    let response = app.create_group(&app.admin.token, "atlas").await;
    assert!(response.status().is_success());
    let created: serde_json::Value = response.json().await.unwrap();
    let id = created["metadata"]["id"].as_str().unwrap();
    assert!(id.starts_with("group_"));

    let fetched: serde_json::Value = app
        .get_group(&app.admin.token, "atlas")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["apiVersion"], "v1alpha3");
    assert_eq!(fetched["kind"], "Group");
    assert_eq!(fetched["metadata"]["id"], id);
    assert_eq!(fetched["metadata"]["name"], "atlas");
    assert_eq!(fetched["metadata"]["scienceField"], "Physics");

    // Lookup by id resolves to the same group.
    let by_id: serde_json::Value = app
        .get_group(&app.admin.token, id)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_id["metadata"]["name"], "atlas");
}

#[tokio::test(flavor = "multi_thread")]
async fn group_creator_becomes_a_member() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;

    app.create_group(&member.token, "atlas").await;

    let listed: serde_json::Value = app
        .list_user_groups(&member.token, &member.id)
        .await
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "atlas");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_group_name_conflicts() {
    let app = spawn_test_app().await;

    assert!(app
        .create_group(&app.admin.token, "atlas")
        .await
        .status()
        .is_success());
    let response = app.create_group(&app.admin.token, "atlas").await;
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_name_with_slash_is_rejected() {
    let app = spawn_test_app().await;

    let response = app.create_group(&app.admin.token, "bad/name").await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_name_with_reserved_prefix_is_rejected() {
    let app = spawn_test_app().await;

    let response = app.create_group(&app.admin.token, "group_sneaky").await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_group_can_be_deleted() {
    let app = spawn_test_app().await;

    app.create_group(&app.admin.token, "atlas").await;
    let response = app.delete_group(&app.admin.token, "atlas").await;
    assert!(response.status().is_success());

    let response = app.get_group(&app.admin.token, "atlas").await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_owning_a_cluster_cannot_be_deleted() {
    let app = spawn_test_app().await;

    app.create_group(&app.admin.token, "atlas").await;
    let response = app
        .create_cluster(&app.admin.token, "test-cluster", "atlas")
        .await;
    assert!(response.status().is_success());

    let response = app.delete_group(&app.admin.token, "atlas").await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_member_cannot_delete_a_group() {
    let app = spawn_test_app().await;
    let outsider = app.seed_user(false).await;

    app.create_group(&app.admin.token, "atlas").await;
    let response = app.delete_group(&outsider.token, "atlas").await;
    assert_eq!(response.status().as_u16(), 403);
}
