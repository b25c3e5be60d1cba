mod support;

use serde_json::json;

use crate::support::test_app::spawn_test_app;

fn new_user_body() -> serde_json::Value {
    json!({
        "metadata": {
            "name": "Jane Doe",
            "email": "jane@example.edu",
            "phone": "555-0100",
            "institution": "Example University",
            "admin": false,
            "globusId": "globus-jane",
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_can_create_and_read_a_user() {
    let app = spawn_test_app().await;

    let response = app.create_user(&app.admin.token, &new_user_body()).await;
    assert!(response.status().is_success());
    let created: serde_json::Value = response.json().await.unwrap();

    let id = created["metadata"]["id"].as_str().unwrap();
    assert!(id.starts_with("user_"));
    assert_eq!(id.len(), "user_".len() + 11);
    let token = created["metadata"]["token"].as_str().unwrap();
    assert!(!token.is_empty());

    let response = app.get_user(&app.admin.token, id).await;
    assert!(response.status().is_success());
    let fetched: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fetched["apiVersion"], "v1alpha3");
    assert_eq!(fetched["kind"], "User");
    assert_eq!(fetched["metadata"]["name"], "Jane Doe");
    assert_eq!(fetched["metadata"]["email"], "jane@example.edu");
    assert_eq!(fetched["metadata"]["institution"], "Example University");
    assert_eq!(fetched["metadata"]["globusId"], "globus-jane");
    assert_eq!(fetched["metadata"]["token"], token);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_admin_cannot_create_users() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;

    let response = app.create_user(&member.token, &new_user_body()).await;

    assert_eq!(response.status().as_u16(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "Error");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_or_unknown_token_is_unauthenticated() {
    let app = spawn_test_app().await;

    let response = app
        .client
        .get(format!("{}/v1alpha3/users", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    let response = app.list_users("not-a-real-token").await;
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn user_can_update_self_but_not_others() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;
    let other = app.seed_user(false).await;

    let update = json!({"metadata": {"email": "new@example.edu"}});
    let response = app.update_user(&member.token, &member.id, &update).await;
    assert!(response.status().is_success());

    let fetched: serde_json::Value = app
        .get_user(&member.token, &member.id)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["metadata"]["email"], "new@example.edu");

    let response = app.update_user(&member.token, &other.id, &update).await;
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_flag_cannot_be_self_granted() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;

    let update = json!({"metadata": {"admin": true}});
    let response = app.update_user(&member.token, &member.id, &update).await;
    assert!(response.status().is_success());

    let fetched: serde_json::Value = app
        .get_user(&member.token, &member.id)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["metadata"]["admin"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_round_trip() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;

    let response = app.create_group(&app.admin.token, "atlas").await;
    assert!(response.status().is_success());

    let response = app
        .add_user_to_group(&app.admin.token, &member.id, "atlas")
        .await;
    assert!(response.status().is_success());

    let listed: serde_json::Value = app
        .list_user_groups(&member.token, &member.id)
        .await
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "atlas");

    let response = app
        .remove_user_from_group(&member.token, &member.id, "atlas")
        .await;
    assert!(response.status().is_success());

    let listed: serde_json::Value = app
        .list_user_groups(&member.token, &member.id)
        .await
        .json()
        .await
        .unwrap();
    assert!(listed["items"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_user_removes_their_memberships() {
    let app = spawn_test_app().await;
    let member = app.seed_user(false).await;

    app.create_group(&app.admin.token, "atlas").await;
    app.add_user_to_group(&app.admin.token, &member.id, "atlas")
        .await;

    let response = app.delete_user(&app.admin.token, &member.id).await;
    assert!(response.status().is_success());

    let response = app.get_user(&app.admin.token, &member.id).await;
    assert_eq!(response.status().as_u16(), 404);

    // The deleted user's token no longer authenticates.
    let response = app.list_user_groups(&member.token, &member.id).await;
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn find_user_by_globus_id() {
    let app = spawn_test_app().await;

    let created: serde_json::Value = app
        .create_user(&app.admin.token, &new_user_body())
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .client
        .get(format!(
            "{}/v1alpha3/find_user?token={}&globus_id=globus-jane",
            app.address, app.admin.token
        ))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let found: serde_json::Value = response.json().await.unwrap();
    assert_eq!(found["metadata"]["id"], created["metadata"]["id"]);
}
