use axum::http::{header, Method, StatusCode};
use serde_json::Value;
use time::macros::date;
use tower::ServiceExt;
use uuid::Uuid;

use super::sanitize_filename;
use crate::db::types::CertificateStatus;
use crate::services::access_control::Permission;
use crate::services::lifecycle::{self, NewStudent};
use crate::test_support::{self, TestContext};

async fn issue(ctx: &TestContext, name: &str, course_id: i64) -> i64 {
    let admin =
        test_support::insert_admin(ctx.state.db(), &format!("{}@test.dev", Uuid::new_v4())).await;
    let grant = test_support::grant(&ctx.state, &admin, Permission::CreateStudents).await;
    let record = lifecycle::create_student(
        &ctx.state,
        &grant,
        NewStudent {
            name: name.to_string(),
            course_id,
            certificate_date: Some(date!(2024 - 01 - 15)),
            hour: Some("72".into()),
            ..NewStudent::default()
        },
    )
    .await
    .expect("issue certificate");
    record.student.id
}

async fn get(ctx: &TestContext, uri: &str) -> axum::response::Response {
    ctx.app
        .clone()
        .oneshot(test_support::json_request(Method::GET, uri, None, None))
        .await
        .expect("request")
}

async fn get_json(ctx: &TestContext, uri: &str) -> (StatusCode, Value) {
    let response = get(ctx, uri).await;
    let status = response.status();
    (status, test_support::read_json(response).await)
}

#[test]
fn download_names_keep_only_safe_characters() {
    assert_eq!(sanitize_filename("2024-17"), "2024-17");
    assert_eq!(sanitize_filename("A/B \"x\""), "A_B__x_");
}

#[tokio::test]
async fn public_listing_shows_issued_certificates_only() {
    let ctx = test_support::setup_test_context().await;
    let construction = test_support::insert_course(ctx.state.db(), "Construction").await;
    let welding = test_support::insert_course(ctx.state.db(), "Welding").await;
    issue(&ctx, "Aliyev Kamran", construction.id).await;
    issue(&ctx, "Mammadov Rauf", welding.id).await;

    sqlx::query(
        "INSERT INTO students (name, course_id, verification_token, status, artifact_state,
                               created_at, updated_at)
         VALUES ('Pending Person', $1, $2, 'active', 'pending', NOW(), NOW())",
    )
    .bind(construction.id)
    .bind(Uuid::new_v4())
    .execute(ctx.state.db())
    .await
    .expect("pending row");

    let (status, body) = get_json(&ctx, "/api/certificates").await;
    assert_eq!(status, StatusCode::OK, "response: {body}");
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["meta"]["current_page"], 1);
    let names: Vec<&str> = body["data"]
        .as_array()
        .expect("data")
        .iter()
        .filter_map(|item| item["student"]["name"].as_str())
        .collect();
    assert!(!names.contains(&"Pending Person"));

    let (_, filtered) =
        get_json(&ctx, &format!("/api/certificates?category={}", welding.id)).await;
    assert_eq!(filtered["meta"]["total"], 1, "response: {filtered}");
    assert_eq!(filtered["data"][0]["student"]["name"], "Mammadov Rauf");
    assert_eq!(filtered["data"][0]["course"]["name"], "Welding");

    let (_, all) = get_json(&ctx, "/api/certificates?category=0&search=aliyev").await;
    assert_eq!(all["meta"]["total"], 1, "response: {all}");
    assert_eq!(all["data"][0]["expiry_date_display"], "15/01/2027");
}

#[tokio::test]
async fn verification_reports_standing_by_number_and_token() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Construction").await;
    let student_id = issue(&ctx, "Aliyev Kamran", course.id).await;

    let (status, body) = get_json(&ctx, "/api/certificates/verify/1").await;
    assert_eq!(status, StatusCode::OK, "response: {body}");
    assert_eq!(body["valid"], true);
    assert_eq!(body["status"], "valid");
    assert_eq!(body["data"]["certificate_number"], "1");
    assert_eq!(body["data"]["student"]["name"], "Aliyev Kamran");

    let token =
        sqlx::query_scalar::<_, Uuid>("SELECT verification_token FROM students WHERE id = $1")
            .bind(student_id)
            .fetch_one(ctx.state.db())
            .await
            .expect("token");
    let (status, by_token) = get_json(&ctx, &format!("/api/certificates/token/{token}")).await;
    assert_eq!(status, StatusCode::OK, "response: {by_token}");
    assert_eq!(by_token["data"]["id"], student_id);

    let admin = test_support::insert_admin(ctx.state.db(), "revoker@test.dev").await;
    let grant = test_support::grant(&ctx.state, &admin, Permission::RevokeCertificates).await;
    lifecycle::set_status(&ctx.state, &grant, student_id, CertificateStatus::Revoked)
        .await
        .expect("revoke");

    let (status, revoked) = get_json(&ctx, "/api/certificates/verify/1").await;
    assert_eq!(status, StatusCode::OK, "response: {revoked}");
    assert_eq!(revoked["valid"], false);
    assert_eq!(revoked["status"], "revoked");

    let (status, _) = get_json(&ctx, "/api/certificates/verify/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(&ctx, "/api/certificates/token/not-a-token").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn download_streams_the_stored_document() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Construction").await;
    let student_id = issue(&ctx, "Aliyev Kamran", course.id).await;

    let response = get(&ctx, &format!("/api/certificates/{student_id}/download")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"certificate-1.pdf\""
    );
    let body = test_support::read_body(response).await;
    assert_eq!(body, b"%PDF-1.4 certificate 1".to_vec());

    let response = get(&ctx, "/certificate/1/download").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&ctx, "/api/certificates/424242/download").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn certificate_page_renders_for_issued_numbers() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Construction").await;
    let student_id = issue(&ctx, "Aliyev Kamran", course.id).await;

    let response = get(&ctx, "/certificate/1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = String::from_utf8(test_support::read_body(response).await).expect("utf8");
    assert!(page.contains("ALIYEV KAMRAN"));
    assert!(page.contains("Construction"));
    assert!(page.contains("15/01/2027"));
    assert!(page.contains(&format!("https://cdn.test/certificates/{student_id}/r1/qr.svg")));
    assert!(page.contains("status-valid"));

    let response = get(&ctx, "/certificate/404").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
