use std::collections::BTreeSet;
use std::time::Duration;

use time::macros::date;
use uuid::Uuid;

use super::*;
use crate::db::types::{ArtifactState, LifecycleState, Standing};
use crate::repositories::{artifact_cleanup, sequences};
use crate::services::allocator::STUDENT_SEQUENCE;
use crate::test_support::{self, eventually, TestContext};

fn new_student(name: &str, course_id: i64) -> NewStudent {
    NewStudent {
        name: name.to_string(),
        course_id,
        certificate_date: Some(date!(2024 - 01 - 15)),
        hour: Some("72".into()),
        ..NewStudent::default()
    }
}

async fn admin_grant(ctx: &TestContext, permission: Permission) -> Grant {
    let admin = test_support::insert_admin(ctx.state.db(), &format!("{}@test.dev", Uuid::new_v4()))
        .await;
    test_support::grant(&ctx.state, &admin, permission).await
}

#[tokio::test]
async fn first_student_gets_number_one_and_issued_artifacts() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Construction").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let record = create_student(&ctx.state, &grant, new_student("Aliyev Kamran", course.id))
        .await
        .expect("create student");
    let student = &record.student;

    assert_eq!(student.certificate_number.as_deref(), Some("1"));
    assert_eq!(student.artifact_state, ArtifactState::Issued);
    assert_eq!(student.artifact_revision, 1);
    assert_eq!(student.lifecycle_state(), LifecycleState::Issued);
    assert_eq!(record.course_name, "Construction");
    assert_eq!(
        student.certificate_url.as_deref(),
        Some("https://certs.test/certificate/1")
    );

    let prefix = format!("certificates/{}/r1/", student.id);
    assert_eq!(
        ctx.storage.keys_with_prefix(&prefix),
        vec![format!("{prefix}certificate.pdf"), format!("{prefix}qr.svg")]
    );
    assert_eq!(student.qr_code.as_deref(), Some(format!("{prefix}qr.svg").as_str()));
    assert_eq!(student.document_sha256.as_deref().map(str::len), Some(64));
}

#[tokio::test]
async fn printed_expiry_is_three_years_after_issue() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Construction").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let record = create_student(&ctx.state, &grant, new_student("Aliyev Kamran", course.id))
        .await
        .expect("create student");

    let (fields, qr_payload) = ctx.renderer.last();
    assert_eq!(fields.issue_date, "15/01/2024");
    assert_eq!(fields.expiry_date, "15/01/2027");
    assert_eq!(fields.student_name, "ALIYEV KAMRAN");
    assert_eq!(fields.hours.as_deref(), Some("72"));
    assert_eq!(qr_payload, "https://certs.test/certificate/1");
    assert_eq!(record.student.expiry_date(), Some(date!(2027 - 01 - 15)));
}

#[tokio::test]
async fn concurrent_creates_receive_distinct_sequential_numbers() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let mut handles = Vec::new();
    for index in 0..50 {
        let state = ctx.state.clone();
        let grant = grant.clone();
        let input = new_student(&format!("Student {index}"), course.id);
        handles.push(tokio::spawn(async move { create_student(&state, &grant, input).await }));
    }

    let mut numbers = BTreeSet::new();
    for handle in handles {
        let record = handle.await.expect("join").expect("create student");
        let number: i64 =
            record.student.certificate_number.expect("number").parse().expect("numeric");
        assert!(numbers.insert(number), "duplicate certificate number {number}");
    }

    assert_eq!(numbers, (1..=50).collect::<BTreeSet<i64>>());
    assert_eq!(sequences::current(ctx.state.db(), STUDENT_SEQUENCE).await.expect("counter"), 50);
}

#[tokio::test]
async fn duplicate_explicit_number_is_a_field_error() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let first =
        NewStudent { certificate_number: Some("A-17".into()), ..new_student("One", course.id) };
    create_student(&ctx.state, &grant, first).await.expect("first");

    let second =
        NewStudent { certificate_number: Some("A-17".into()), ..new_student("Two", course.id) };
    match create_student(&ctx.state, &grant, second).await {
        Err(LifecycleError::Validation(errors)) => {
            assert!(errors.contains_key("certificate_number"), "errors: {errors:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn explicit_numeric_number_moves_the_counter_past_it() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let explicit =
        NewStudent { certificate_number: Some("100".into()), ..new_student("One", course.id) };
    create_student(&ctx.state, &grant, explicit).await.expect("explicit");

    let next =
        create_student(&ctx.state, &grant, new_student("Two", course.id)).await.expect("auto");
    assert_eq!(next.student.certificate_number.as_deref(), Some("101"));
}

#[tokio::test]
async fn zero_padded_explicit_number_is_refused() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    let padded =
        NewStudent { certificate_number: Some("0042".into()), ..new_student("One", course.id) };
    match create_student(&ctx.state, &grant, padded).await {
        Err(LifecycleError::Validation(errors)) => {
            assert!(errors.contains_key("certificate_number"), "errors: {errors:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(sequences::current(ctx.state.db(), STUDENT_SEQUENCE).await.expect("counter"), 0);

    let next =
        create_student(&ctx.state, &grant, new_student("Two", course.id)).await.expect("auto");
    assert_eq!(next.student.certificate_number.as_deref(), Some("1"));
}

#[tokio::test]
async fn counter_recovers_from_numbers_written_behind_its_back() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    sqlx::query(
        "INSERT INTO students (name, course_id, certificate_number, certificate_date,
                               verification_token, status, artifact_state, created_at, updated_at)
         VALUES ('Imported', $1, '1', '2023-05-01', $2, 'active', 'pending', NOW(), NOW())",
    )
    .bind(course.id)
    .bind(Uuid::new_v4())
    .execute(ctx.state.db())
    .await
    .expect("import row");

    let record = create_student(&ctx.state, &grant, new_student("Fresh", course.id))
        .await
        .expect("create after import");
    assert_eq!(record.student.certificate_number.as_deref(), Some("2"));
}

#[tokio::test]
async fn failed_issuance_removes_the_row_and_returns_the_number() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    ctx.storage.fail_puts(true);
    let err = create_student(&ctx.state, &grant, new_student("Unlucky", course.id))
        .await
        .expect_err("storage is down");
    assert!(matches!(err, LifecycleError::Artifact(_)), "got {err:?}");

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM students")
        .fetch_one(ctx.state.db())
        .await
        .expect("count");
    assert_eq!(rows, 0);
    assert_eq!(sequences::current(ctx.state.db(), STUDENT_SEQUENCE).await.expect("counter"), 0);
    assert!(ctx.storage.keys().is_empty());

    ctx.storage.fail_puts(false);
    let record = create_student(&ctx.state, &grant, new_student("Lucky", course.id))
        .await
        .expect("create");
    assert_eq!(record.student.certificate_number.as_deref(), Some("1"));
}

#[tokio::test]
async fn unknown_course_is_a_field_error() {
    let ctx = test_support::setup_test_context().await;
    let grant = admin_grant(&ctx, Permission::CreateStudents).await;

    match create_student(&ctx.state, &grant, new_student("Nobody", 9_999)).await {
        Err(LifecycleError::Validation(errors)) => assert!(errors.contains_key("course_id")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn grant_for_another_permission_is_refused() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let view_only = admin_grant(&ctx, Permission::ViewStudents).await;

    let err = create_student(&ctx.state, &view_only, new_student("Nobody", course.id))
        .await
        .expect_err("wrong grant");
    assert!(matches!(
        err,
        LifecycleError::Access(AccessError::Denied(Permission::CreateStudents))
    ));

    let moderator =
        test_support::insert_user_with_role(ctx.state.db(), "mod@test.dev", "moderator").await;
    let denied = crate::services::access_control::authorize(
        ctx.state.access(),
        &moderator.id,
        Permission::CreateStudents,
    )
    .await;
    assert!(matches!(denied, Err(AccessError::Denied(Permission::CreateStudents))));
}

#[tokio::test]
async fn reissuing_twice_leaves_one_live_artifact_pair() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    let created = create_student(&ctx.state, &create, new_student("Aliyev Kamran", course.id))
        .await
        .expect("create");
    let id = created.student.id;

    reissue_student(&ctx.state, &edit, id).await.expect("first reissue");
    let record = reissue_student(&ctx.state, &edit, id).await.expect("second reissue");

    assert_eq!(record.student.artifact_revision, 3);
    assert_eq!(record.student.reissue_count, 2);
    assert_eq!(record.student.lifecycle_state(), LifecycleState::Reissued);
    assert_eq!(record.student.certificate_number.as_deref(), Some("1"));
    assert_eq!(record.student.verification_token, created.student.verification_token);

    let live = ctx.storage.keys_with_prefix(&format!("certificates/{id}/"));
    assert_eq!(
        live,
        vec![
            format!("certificates/{id}/r3/certificate.pdf"),
            format!("certificates/{id}/r3/qr.svg"),
        ]
    );
}

#[tokio::test]
async fn old_artifacts_are_queued_when_deletion_fails() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    let created = create_student(&ctx.state, &create, new_student("Queued", course.id))
        .await
        .expect("create");
    let old_keys = created.student.artifact_keys();

    ctx.storage.fail_deletes(true);
    reissue_student(&ctx.state, &edit, created.student.id).await.expect("reissue");

    let queued: Vec<String> = artifact_cleanup::list_pending(ctx.state.db())
        .await
        .expect("queue")
        .into_iter()
        .map(|job| job.blob_key)
        .collect();
    for key in &old_keys {
        assert!(queued.contains(key), "{key} not queued: {queued:?}");
    }
}

#[tokio::test]
async fn editing_unprinted_fields_keeps_the_artifacts() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    let created = create_student(&ctx.state, &create, new_student("Passport Holder", course.id))
        .await
        .expect("create");
    let renders = ctx.renderer.rendered().len();

    let changes =
        StudentChanges { passport: Some("AB1234567".into()), ..StudentChanges::default() };
    let updated = update_student(&ctx.state, &edit, created.student.id, changes)
        .await
        .expect("update");

    assert_eq!(updated.student.passport.as_deref(), Some("AB1234567"));
    assert_eq!(updated.student.artifact_revision, 1);
    assert_eq!(updated.student.qr_code, created.student.qr_code);
    assert_eq!(ctx.renderer.rendered().len(), renders);
}

#[tokio::test]
async fn renaming_reissues_with_the_new_name() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    let created = create_student(&ctx.state, &create, new_student("Old Name", course.id))
        .await
        .expect("create");
    let changes = StudentChanges { name: Some("New Name".into()), ..StudentChanges::default() };
    let updated = update_student(&ctx.state, &edit, created.student.id, changes)
        .await
        .expect("update");

    assert_eq!(updated.student.artifact_revision, 2);
    assert_eq!(ctx.renderer.last().0.student_name, "NEW NAME");
    for key in created.student.artifact_keys() {
        assert!(!ctx.storage.contains(&key), "{key} should be retired");
    }
}

#[tokio::test]
async fn reissue_from_a_stale_read_does_not_revert_a_committed_edit() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    let input = NewStudent { passport: Some("AA1".into()), ..new_student("Slow", course.id) };
    let created = create_student(&ctx.state, &create, input).await.expect("create");
    let id = created.student.id;

    let stale = students::find(ctx.state.db(), id).await.expect("find").expect("row").student;
    let draft = draft_from_stored(&stale).expect("draft");
    let artifacts =
        generate_next(&ctx.state, id, &draft.subject(&created.course_name)).await.expect("render");
    let abandoned = artifacts.keys();

    let changes = StudentChanges { passport: Some("BB2".into()), ..StudentChanges::default() };
    update_student(&ctx.state, &edit, id, changes).await.expect("passport edit");

    let outcome =
        swap_artifacts(&ctx.state, &stale, &draft, Some(artifacts), &created.course_name).await;
    assert!(matches!(outcome, Err(LifecycleError::ConcurrentModification)), "{outcome:?}");

    let stored = students::find(ctx.state.db(), id).await.expect("find").expect("row").student;
    assert_eq!(stored.passport.as_deref(), Some("BB2"));
    assert_eq!(stored.artifact_revision, 1);
    assert_eq!(stored.row_version, created.student.row_version + 1);
    assert!(eventually(|| abandoned.iter().all(|key| !ctx.storage.contains(key))).await);
    for key in stored.artifact_keys() {
        assert!(ctx.storage.contains(&key), "{key} should stay live");
    }
}

#[tokio::test]
async fn status_changes_invalidate_earlier_reads() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let revoke = admin_grant(&ctx, Permission::RevokeCertificates).await;

    let created = create_student(&ctx.state, &create, new_student("Revoked Later", course.id))
        .await
        .expect("create");
    let stale = created.student.clone();
    let draft = draft_from_stored(&stale).expect("draft");

    set_status(&ctx.state, &revoke, stale.id, CertificateStatus::Revoked).await.expect("revoke");

    let outcome = swap_artifacts(&ctx.state, &stale, &draft, None, &created.course_name).await;
    assert!(matches!(outcome, Err(LifecycleError::ConcurrentModification)), "{outcome:?}");
}

#[tokio::test]
async fn renumbering_to_a_taken_number_is_refused() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let edit = admin_grant(&ctx, Permission::EditStudents).await;

    create_student(&ctx.state, &create, new_student("First", course.id)).await.expect("first");
    let second = create_student(&ctx.state, &create, new_student("Second", course.id))
        .await
        .expect("second");

    let changes =
        StudentChanges { certificate_number: Some("1".into()), ..StudentChanges::default() };
    match update_student(&ctx.state, &edit, second.student.id, changes).await {
        Err(LifecycleError::Validation(errors)) => {
            assert!(errors.contains_key("certificate_number"))
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn revocation_changes_the_standing() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let revoke = admin_grant(&ctx, Permission::RevokeCertificates).await;

    let created = create_student(&ctx.state, &create, new_student("Revoked", course.id))
        .await
        .expect("create");
    let revoked = set_status(&ctx.state, &revoke, created.student.id, CertificateStatus::Revoked)
        .await
        .expect("revoke");

    assert_eq!(revoked.student.standing(date!(2024 - 02 - 01)), Standing::Revoked);
    assert!(!revoked.student.standing(date!(2024 - 02 - 01)).is_valid());
}

#[tokio::test]
async fn deleting_a_course_removes_student_artifacts_and_images() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let delete = admin_grant(&ctx, Permission::DeleteCourses).await;

    let image = format!("courses/{}/cover.png", course.id);
    ctx.state.storage().put(&image, "image/png", vec![1, 2, 3]).await.expect("image");
    repositories::courses::append_images(
        ctx.state.db(),
        course.id,
        std::slice::from_ref(&image),
        primitive_now_utc(),
    )
    .await
    .expect("append image");
    let created = create_student(&ctx.state, &create, new_student("Cascade", course.id))
        .await
        .expect("create");

    delete_course(&ctx.state, &delete, course.id).await.expect("delete course");

    assert!(students::find(ctx.state.db(), created.student.id).await.expect("find").is_none());
    let storage = ctx.storage.clone();
    assert!(eventually(|| storage.keys().is_empty()).await, "left: {:?}", storage.keys());
}

#[tokio::test]
async fn failed_course_cleanup_stays_queued() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;
    let create = admin_grant(&ctx, Permission::CreateStudents).await;
    let delete = admin_grant(&ctx, Permission::DeleteCourses).await;

    let created = create_student(&ctx.state, &create, new_student("Cascade", course.id))
        .await
        .expect("create");
    ctx.storage.fail_deletes(true);
    delete_course(&ctx.state, &delete, course.id).await.expect("delete course");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let queued: BTreeSet<String> = artifact_cleanup::list_pending(ctx.state.db())
        .await
        .expect("queue")
        .into_iter()
        .map(|job| job.blob_key)
        .collect();
    assert_eq!(queued, created.student.artifact_keys().into_iter().collect());
}

#[tokio::test]
async fn pending_rows_are_completed_by_recovery() {
    let ctx = test_support::setup_test_context().await;
    let course = test_support::insert_course(ctx.state.db(), "Safety").await;

    let mut tx = ctx.state.db().begin().await.expect("tx");
    let pending = students::insert_pending(
        &mut tx,
        &StudentFields {
            name: "Interrupted",
            course_id: course.id,
            certificate_number: "77",
            certificate_date: date!(2024 - 03 - 01),
            hour: None,
            level: None,
            control: None,
            passport: None,
        },
        Uuid::new_v4(),
        primitive_now_utc(),
    )
    .await
    .expect("pending row");
    tx.commit().await.expect("commit");

    let record = students::find(ctx.state.db(), pending.id).await.expect("find").expect("row");
    let issued = complete_pending(&ctx.state, &record).await.expect("complete").expect("issued");

    assert_eq!(issued.artifact_state, ArtifactState::Issued);
    assert_eq!(issued.artifact_revision, 2);
    assert!(ctx.storage.contains(&format!("certificates/{}/r2/certificate.pdf", pending.id)));

    assert!(complete_pending(&ctx.state, &record).await.expect("second pass").is_none());
}
