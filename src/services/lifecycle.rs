use std::collections::BTreeMap;

use thiserror::Error;
use time::Date;
use uuid::Uuid;

use crate::core::metrics as names;
use crate::core::state::AppState;
use crate::core::time::{primitive_now_utc, today_utc};
use crate::db;
use crate::db::models::{Course, Student, StudentRecord};
use crate::db::types::CertificateStatus;
use crate::repositories::{self, artifact_cleanup, students, students::StudentFields};
use crate::services::access_control::{AccessError, Grant, Permission};
use crate::services::allocator::{self, CertificateNumber};
use crate::services::artifacts::{ArtifactError, CertificateSubject, IssuedArtifacts};

pub(crate) type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub(crate) enum LifecycleError {
    #[error("validation failed")]
    Validation(FieldErrors),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("no free certificate number after {attempts} attempts")]
    AllocationConflict { attempts: u32 },
    #[error("certificate was changed by a concurrent request")]
    ConcurrentModification,
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl LifecycleError {
    pub(crate) fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        LifecycleError::Validation(errors)
    }
}

/// Input for a new student. Text fields are taken as entered; blank
/// optional values are stored as absent.
#[derive(Debug, Clone, Default)]
pub(crate) struct NewStudent {
    pub(crate) name: String,
    pub(crate) course_id: i64,
    pub(crate) certificate_number: Option<String>,
    pub(crate) certificate_date: Option<Date>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) passport: Option<String>,
}

/// Partial update. `None` keeps the stored value; an empty string clears an
/// optional text field.
#[derive(Debug, Clone, Default)]
pub(crate) struct StudentChanges {
    pub(crate) name: Option<String>,
    pub(crate) course_id: Option<i64>,
    pub(crate) certificate_number: Option<String>,
    pub(crate) certificate_date: Option<Date>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) passport: Option<String>,
}

/// Fully resolved editable state of a student row.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Draft {
    name: String,
    course_id: i64,
    certificate_number: String,
    certificate_date: Date,
    hour: Option<String>,
    level: Option<String>,
    control: Option<String>,
    passport: Option<String>,
}

impl Draft {
    fn fields(&self) -> StudentFields<'_> {
        StudentFields {
            name: &self.name,
            course_id: self.course_id,
            certificate_number: &self.certificate_number,
            certificate_date: self.certificate_date,
            hour: self.hour.as_deref(),
            level: self.level.as_deref(),
            control: self.control.as_deref(),
            passport: self.passport.as_deref(),
        }
    }

    fn subject(&self, course_name: &str) -> CertificateSubject {
        CertificateSubject {
            certificate_number: self.certificate_number.clone(),
            student_name: self.name.clone(),
            course_name: course_name.to_string(),
            issue_date: Some(self.certificate_date),
            hour: self.hour.clone(),
            level: self.level.clone(),
            control: self.control.clone(),
        }
    }

    /// Whether switching from `self` to `next` changes what the document prints.
    fn differs_on_document(&self, next: &Draft) -> bool {
        self.name != next.name
            || self.course_id != next.course_id
            || self.certificate_number != next.certificate_number
            || self.certificate_date != next.certificate_date
            || self.hour != next.hour
            || self.level != next.level
            || self.control != next.control
    }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn check_explicit_number(raw: &str, errors: &mut FieldErrors) {
    let message = if !allocator::is_valid_explicit(raw) {
        "The certificate number may contain only letters, digits, '.', '_' and '-'."
    } else if allocator::is_zero_padded(raw) {
        "A numeric certificate number may not start with 0."
    } else {
        return;
    };
    errors.entry("certificate_number".to_string()).or_default().push(message.into());
}

fn number_taken_error() -> LifecycleError {
    LifecycleError::field("certificate_number", "The certificate number has already been taken.")
}

fn draft_from_stored(student: &Student) -> Option<Draft> {
    Some(Draft {
        name: student.name.clone(),
        course_id: student.course_id,
        certificate_number: student.certificate_number.clone()?,
        certificate_date: student.certificate_date?,
        hour: student.hour.clone(),
        level: student.level.clone(),
        control: student.control.clone(),
        passport: student.passport.clone(),
    })
}

async fn course_for(state: &AppState, course_id: i64) -> Result<Course, LifecycleError> {
    repositories::courses::find(state.db(), course_id)
        .await?
        .ok_or_else(|| LifecycleError::field("course_id", "The selected course does not exist."))
}

/// Creates a student, assigns a certificate number and issues the first
/// artifacts. On failure after the row was written the row is removed again
/// and a counter-drawn number handed back.
pub(crate) async fn create_student(
    state: &AppState,
    grant: &Grant,
    input: NewStudent,
) -> Result<StudentRecord, LifecycleError> {
    grant.require(Permission::CreateStudents)?;

    let name = input.name.trim().to_string();
    let explicit_number = blank_to_none(input.certificate_number);
    let mut errors = FieldErrors::new();
    if name.is_empty() {
        errors.entry("name".into()).or_default().push("The name field is required.".into());
    }
    if let Some(raw) = &explicit_number {
        check_explicit_number(raw, &mut errors);
    }
    if !errors.is_empty() {
        return Err(LifecycleError::Validation(errors));
    }

    let course = course_for(state, input.course_id).await?;
    if let Some(raw) = &explicit_number {
        if students::number_taken(state.db(), raw, None).await? {
            return Err(number_taken_error());
        }
    }

    let mut draft = Draft {
        name,
        course_id: course.id,
        certificate_number: explicit_number.clone().unwrap_or_default(),
        certificate_date: input.certificate_date.unwrap_or_else(today_utc),
        hour: blank_to_none(input.hour),
        level: blank_to_none(input.level),
        control: blank_to_none(input.control),
        passport: blank_to_none(input.passport),
    };

    let (student, number) = insert_with_number(state, &mut draft, explicit_number.is_some()).await?;
    tracing::info!(
        admin_id = grant.user_id(),
        student_id = student.id,
        certificate_number = %number,
        action = "student.create",
        "Student created, issuing certificate"
    );

    let student_id = student.id;
    let record = StudentRecord { student, course_name: course.name };
    match issue_first(state, &record).await {
        Ok(record) => {
            metrics::counter!(names::CERTIFICATES_ISSUED).increment(1);
            Ok(record)
        }
        Err(err) => {
            metrics::counter!(names::ISSUANCE_FAILURES).increment(1);
            tracing::error!(
                student_id,
                certificate_number = %number,
                error = %err,
                operation = "student.create",
                "Certificate issuance failed, rolling back"
            );
            roll_back_creation(state, student_id, &number).await;
            Err(err)
        }
    }
}

/// Inserts the pending row. Automatic numbers retry against the unique
/// constraint after resynchronising the counter.
async fn insert_with_number(
    state: &AppState,
    draft: &mut Draft,
    explicit: bool,
) -> Result<(Student, CertificateNumber), LifecycleError> {
    let max_attempts = state.settings().certificate().allocation_max_retries.max(1);

    for attempt in 1..=max_attempts {
        let mut tx = state.db().begin().await?;
        let number = if explicit {
            allocator::accept_explicit(&mut tx, &draft.certificate_number).await?
        } else {
            allocator::allocate(&mut tx).await?
        };
        draft.certificate_number = number.as_str().to_string();

        let inserted =
            students::insert_pending(&mut tx, &draft.fields(), Uuid::new_v4(), primitive_now_utc())
                .await;
        match inserted {
            Ok(student) => {
                tx.commit().await?;
                return Ok((student, number));
            }
            Err(err) if db::is_unique_violation(&err, students::NUMBER_CONSTRAINT) => {
                tx.rollback().await?;
                if explicit {
                    return Err(number_taken_error());
                }
                metrics::counter!(names::ALLOCATION_RETRIES).increment(1);
                tracing::warn!(
                    attempt,
                    certificate_number = %number,
                    "Allocated certificate number already in use, resynchronising counter"
                );
                allocator::resync(state.db()).await?;
            }
            Err(err) if db::is_foreign_key_violation(&err) => {
                return Err(LifecycleError::field(
                    "course_id",
                    "The selected course does not exist.",
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(LifecycleError::AllocationConflict { attempts: max_attempts })
}

/// Generates revision 1 for a freshly inserted row and attaches it.
async fn issue_first(
    state: &AppState,
    record: &StudentRecord,
) -> Result<StudentRecord, LifecycleError> {
    let student = &record.student;
    let artifacts = state
        .artifacts()
        .generate(student.id, &CertificateSubject::from_record(record), student.last_revision)
        .await?;

    let attached = match students::attach_artifacts(
        state.db(),
        student.id,
        &artifacts.refs(),
        0,
        primitive_now_utc(),
    )
    .await
    {
        Ok(attached) => attached,
        Err(err) => {
            retire_blobs(state, artifacts.keys(), "issuance rollback").await;
            return Err(err.into());
        }
    };

    match attached {
        Some(student) => Ok(StudentRecord { student, course_name: record.course_name.clone() }),
        None => {
            // a concurrent writer attached artifacts first; keep theirs
            discard_unreferenced(state, artifacts.keys(), "superseded issuance").await;
            students::find(state.db(), student.id).await?.ok_or(LifecycleError::NotFound("student"))
        }
    }
}

async fn roll_back_creation(state: &AppState, student_id: i64, number: &CertificateNumber) {
    match students::delete_pending(state.db(), student_id).await {
        Ok(true) => match allocator::release(state.db(), number).await {
            Ok(true) => tracing::info!(certificate_number = %number, "Released certificate number"),
            Ok(false) => {}
            Err(err) => tracing::warn!(
                certificate_number = %number,
                error = %err,
                "Failed to release certificate number"
            ),
        },
        Ok(false) => tracing::warn!(
            student_id,
            "Student was no longer pending during rollback; leaving it in place"
        ),
        Err(err) => tracing::error!(
            student_id,
            error = %err,
            "Rollback failed; pending student left for background recovery"
        ),
    }
}

/// Finishes issuance for a row left pending by an interrupted create.
pub(crate) async fn complete_pending(
    state: &AppState,
    record: &StudentRecord,
) -> Result<Option<Student>, LifecycleError> {
    let student_id = record.student.id;
    let Some(revision) = students::reserve_revision(state.db(), student_id).await? else {
        return Ok(None);
    };

    let artifacts = state
        .artifacts()
        .generate(student_id, &CertificateSubject::from_record(record), revision)
        .await?;

    match students::attach_artifacts(
        state.db(),
        student_id,
        &artifacts.refs(),
        0,
        primitive_now_utc(),
    )
    .await
    {
        Ok(Some(student)) => {
            metrics::counter!(names::CERTIFICATES_ISSUED).increment(1);
            tracing::info!(student_id, revision, "Completed pending certificate issuance");
            Ok(Some(student))
        }
        Ok(None) => {
            discard_unreferenced(state, artifacts.keys(), "superseded issuance").await;
            Ok(None)
        }
        Err(err) => {
            retire_blobs(state, artifacts.keys(), "issuance rollback").await;
            Err(err.into())
        }
    }
}

/// Applies changes to a student. Changes to printed fields reissue the
/// certificate: new artifacts are generated first, swapped in under a row
/// lock, and the previous ones retired only after the swap committed.
pub(crate) async fn update_student(
    state: &AppState,
    grant: &Grant,
    student_id: i64,
    changes: StudentChanges,
) -> Result<StudentRecord, LifecycleError> {
    grant.require(Permission::EditStudents)?;

    let current =
        students::find(state.db(), student_id).await?.ok_or(LifecycleError::NotFound("student"))?;
    let stored = &current.student;

    let mut errors = FieldErrors::new();
    let name = match changes.name {
        Some(name) if name.trim().is_empty() => {
            errors.entry("name".into()).or_default().push("The name field is required.".into());
            stored.name.clone()
        }
        Some(name) => name.trim().to_string(),
        None => stored.name.clone(),
    };
    let certificate_number = match blank_to_none(changes.certificate_number) {
        Some(raw) => {
            if stored.certificate_number.as_deref() != Some(raw.as_str()) {
                check_explicit_number(&raw, &mut errors);
            }
            raw
        }
        None => stored.certificate_number.clone().unwrap_or_default(),
    };
    if !errors.is_empty() {
        return Err(LifecycleError::Validation(errors));
    }

    let course_name = match changes.course_id {
        Some(course_id) if course_id != stored.course_id => {
            course_for(state, course_id).await?.name
        }
        _ => current.course_name.clone(),
    };
    if stored.certificate_number.as_deref() != Some(certificate_number.as_str())
        && students::number_taken(state.db(), &certificate_number, Some(student_id)).await?
    {
        return Err(number_taken_error());
    }

    let keep = |next: Option<String>, previous: &Option<String>| match next {
        Some(value) => blank_to_none(Some(value)),
        None => previous.clone(),
    };
    let next = Draft {
        name,
        course_id: changes.course_id.unwrap_or(stored.course_id),
        certificate_number,
        certificate_date: changes
            .certificate_date
            .or(stored.certificate_date)
            .unwrap_or_else(today_utc),
        hour: keep(changes.hour, &stored.hour),
        level: keep(changes.level, &stored.level),
        control: keep(changes.control, &stored.control),
        passport: keep(changes.passport, &stored.passport),
    };

    let reissue = match draft_from_stored(stored) {
        Some(previous) => previous.differs_on_document(&next),
        None => true,
    };
    let action = if reissue { "student.reissue" } else { "student.update" };

    let record = if reissue {
        let artifacts = generate_next(state, student_id, &next.subject(&course_name)).await?;
        swap_artifacts(state, stored, &next, Some(artifacts), &course_name).await?
    } else {
        swap_artifacts(state, stored, &next, None, &course_name).await?
    };

    tracing::info!(
        admin_id = grant.user_id(),
        student_id,
        revision = record.student.artifact_revision,
        action,
        "Student updated"
    );
    Ok(record)
}

/// Regenerates a student's artifacts without changing any field.
pub(crate) async fn reissue_student(
    state: &AppState,
    grant: &Grant,
    student_id: i64,
) -> Result<StudentRecord, LifecycleError> {
    grant.require(Permission::EditStudents)?;

    let current =
        students::find(state.db(), student_id).await?.ok_or(LifecycleError::NotFound("student"))?;
    let draft = draft_from_stored(&current.student).ok_or_else(|| {
        LifecycleError::field("certificate_number", "The student has no certificate number yet.")
    })?;

    let artifacts = generate_next(state, student_id, &draft.subject(&current.course_name)).await?;
    let record =
        swap_artifacts(state, &current.student, &draft, Some(artifacts), &current.course_name)
            .await?;

    tracing::info!(
        admin_id = grant.user_id(),
        student_id,
        revision = record.student.artifact_revision,
        action = "student.reissue",
        "Certificate reissued"
    );
    Ok(record)
}

async fn generate_next(
    state: &AppState,
    student_id: i64,
    subject: &CertificateSubject,
) -> Result<IssuedArtifacts, LifecycleError> {
    let revision = students::reserve_revision(state.db(), student_id)
        .await?
        .ok_or(LifecycleError::NotFound("student"))?;
    state.artifacts().generate(student_id, subject, revision).await.map_err(|err| {
        metrics::counter!(names::ISSUANCE_FAILURES).increment(1);
        tracing::error!(student_id, revision, error = %err, "Certificate reissue failed");
        LifecycleError::from(err)
    })
}

/// Writes `next` (and the new artifacts, if any) when the row is still at
/// the version `previous` was read at. Any write in between, including one
/// that leaves the artifacts alone, makes this a concurrent modification.
async fn swap_artifacts(
    state: &AppState,
    previous: &Student,
    next: &Draft,
    artifacts: Option<IssuedArtifacts>,
    course_name: &str,
) -> Result<StudentRecord, LifecycleError> {
    let new_keys = artifacts.as_ref().map(IssuedArtifacts::keys).unwrap_or_default();

    let outcome = async {
        let mut tx = state.db().begin().await?;
        let locked = students::find_for_update(&mut tx, previous.id)
            .await?
            .ok_or(LifecycleError::NotFound("student"))?;
        if locked.row_version != previous.row_version {
            return Err(LifecycleError::ConcurrentModification);
        }

        if locked.certificate_number.as_deref() != Some(next.certificate_number.as_str()) {
            allocator::accept_explicit(&mut tx, &next.certificate_number).await?;
        }

        let refs = artifacts.as_ref().map(IssuedArtifacts::refs);
        let updated = students::replace(
            &mut tx,
            previous.id,
            &next.fields(),
            refs.as_ref(),
            previous.row_version,
            primitive_now_utc(),
        )
        .await
        .map_err(|err| {
            if db::is_unique_violation(&err, students::NUMBER_CONSTRAINT) {
                number_taken_error()
            } else {
                LifecycleError::from(err)
            }
        })?
        .ok_or(LifecycleError::ConcurrentModification)?;

        tx.commit().await?;
        Ok::<_, LifecycleError>((locked, updated))
    }
    .await;

    let (locked, updated) = match outcome {
        Ok(pair) => pair,
        Err(err) => {
            if !new_keys.is_empty() {
                discard_unreferenced(state, new_keys, "abandoned reissue").await;
            }
            return Err(err);
        }
    };

    if artifacts.is_some() {
        if locked.is_issued() {
            metrics::counter!(names::CERTIFICATES_REISSUED).increment(1);
        } else {
            metrics::counter!(names::CERTIFICATES_ISSUED).increment(1);
        }
        retire_blobs(state, locked.artifact_keys(), "reissue").await;
    }

    Ok(StudentRecord { student: updated, course_name: course_name.to_string() })
}

/// Deletes a student. Its artifacts are queued for removal in the same
/// transaction and then removed in the background.
pub(crate) async fn delete_student(
    state: &AppState,
    grant: &Grant,
    student_id: i64,
) -> Result<(), LifecycleError> {
    grant.require(Permission::DeleteStudents)?;

    let mut tx = state.db().begin().await?;
    let student = students::find_for_update(&mut tx, student_id)
        .await?
        .ok_or(LifecycleError::NotFound("student"))?;
    let keys = student.artifact_keys();
    artifact_cleanup::enqueue(&mut *tx, &keys, "student deleted", primitive_now_utc()).await?;
    students::delete(&mut tx, student_id).await?;
    tx.commit().await?;

    tracing::info!(
        admin_id = grant.user_id(),
        student_id,
        certificate_number = student.certificate_number.as_deref().unwrap_or("-"),
        action = "student.delete",
        "Student deleted"
    );
    spawn_queued_cleanup(state, keys);
    Ok(())
}

/// Deletes a course and, through the cascade, its students. Every artifact
/// and course image is queued for removal before the rows disappear.
pub(crate) async fn delete_course(
    state: &AppState,
    grant: &Grant,
    course_id: i64,
) -> Result<(), LifecycleError> {
    grant.require(Permission::DeleteCourses)?;

    let mut tx = state.db().begin().await?;
    let course = repositories::courses::find_for_update(&mut tx, course_id)
        .await?
        .ok_or(LifecycleError::NotFound("course"))?;
    let mut keys = students::artifact_keys_for_course(&mut tx, course_id).await?;
    keys.extend(course.images.0.iter().cloned());
    artifact_cleanup::enqueue(&mut *tx, &keys, "course deleted", primitive_now_utc()).await?;
    repositories::courses::delete(&mut tx, course_id).await?;
    tx.commit().await?;

    tracing::info!(
        admin_id = grant.user_id(),
        course_id,
        queued_blobs = keys.len(),
        action = "course.delete",
        "Course deleted with its students"
    );
    spawn_queued_cleanup(state, keys);
    Ok(())
}

/// Replaces a course's image list with `images`, which must be a subset of
/// the stored keys. Dropped images are queued for removal with the update.
pub(crate) async fn replace_course_images(
    state: &AppState,
    grant: &Grant,
    course_id: i64,
    images: Vec<String>,
) -> Result<Course, LifecycleError> {
    grant.require(Permission::EditCourses)?;

    let mut tx = state.db().begin().await?;
    let course = repositories::courses::find_for_update(&mut tx, course_id)
        .await?
        .ok_or(LifecycleError::NotFound("course"))?;

    let mut kept: Vec<String> = Vec::with_capacity(images.len());
    for key in images {
        if !course.images.0.contains(&key) {
            return Err(LifecycleError::field("images", format!("Unknown image: {key}")));
        }
        if !kept.contains(&key) {
            kept.push(key);
        }
    }
    let removed: Vec<String> =
        course.images.0.iter().filter(|key| !kept.contains(key)).cloned().collect();

    let now = primitive_now_utc();
    artifact_cleanup::enqueue(&mut *tx, &removed, "course image removed", now).await?;
    let updated = repositories::courses::set_images(&mut tx, course_id, &kept, now)
        .await?
        .ok_or(LifecycleError::NotFound("course"))?;
    tx.commit().await?;

    if !removed.is_empty() {
        tracing::info!(
            admin_id = grant.user_id(),
            course_id,
            removed = removed.len(),
            action = "course.images",
            "Course images removed"
        );
        spawn_queued_cleanup(state, removed);
    }
    Ok(updated)
}

pub(crate) async fn set_status(
    state: &AppState,
    grant: &Grant,
    student_id: i64,
    status: CertificateStatus,
) -> Result<StudentRecord, LifecycleError> {
    grant.require(Permission::RevokeCertificates)?;

    if !students::set_status(state.db(), student_id, status, primitive_now_utc()).await? {
        return Err(LifecycleError::NotFound("student"));
    }
    tracing::info!(
        admin_id = grant.user_id(),
        student_id,
        status = ?status,
        action = "certificate.status",
        "Certificate status changed"
    );
    students::find(state.db(), student_id).await?.ok_or(LifecycleError::NotFound("student"))
}

/// Deletes blobs now; whatever fails goes to the cleanup queue.
pub(crate) async fn retire_blobs(state: &AppState, keys: Vec<String>, reason: &str) {
    if keys.is_empty() {
        return;
    }
    let failed = state.artifacts().discard(&keys).await;
    if failed.is_empty() {
        return;
    }
    if let Err(err) =
        artifact_cleanup::enqueue(state.db(), &failed, reason, primitive_now_utc()).await
    {
        tracing::error!(
            keys = ?failed,
            error = %err,
            "Failed to queue artifact cleanup; reconciliation sweep will pick them up"
        );
    }
}

/// Like [`retire_blobs`], but skips keys that a student row references.
async fn discard_unreferenced(state: &AppState, keys: Vec<String>, reason: &str) {
    let keys = match students::referenced_keys(state.db(), &keys).await {
        Ok(referenced) => keys.into_iter().filter(|key| !referenced.contains(key)).collect(),
        Err(err) => {
            tracing::warn!(
                error = %err,
                "Could not check artifact references; leaving blobs to the sweep"
            );
            return;
        }
    };
    retire_blobs(state, keys, reason).await;
}

/// Removes queued blobs right away without making the caller wait. Entries
/// that fail here stay queued for the worker.
fn spawn_queued_cleanup(state: &AppState, keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        let failed = state.artifacts().discard(&keys).await;
        let removed: Vec<String> = keys.into_iter().filter(|key| !failed.contains(key)).collect();
        if removed.is_empty() {
            return;
        }
        if let Err(err) = artifact_cleanup::complete_keys(state.db(), &removed).await {
            tracing::warn!(error = %err, "Failed to clear cleanup queue after immediate removal");
        }
    });
}

#[cfg(test)]
mod tests;
