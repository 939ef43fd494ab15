use axum::{
    extract::{Path, State},
    response::{Html, Response},
    routing::get,
    Router,
};

use crate::api::certificates::pdf_attachment;
use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::today_utc;
use crate::db::models::StudentRecord;
use crate::db::types::Standing;
use crate::repositories;
use crate::services::artifacts::{document_fields, CertificateSubject};
use crate::services::documents::{CertificateTemplate, DocumentFields};

/// Human-facing pages reached from the printed QR code.
pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:certificate_number", get(show_certificate))
        .route("/:certificate_number/download", get(download_certificate))
}

async fn load(state: &AppState, certificate_number: &str) -> Result<StudentRecord, ApiError> {
    repositories::students::find_issued_by_number(state.db(), certificate_number.trim())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load certificate"))?
        .ok_or_else(|| ApiError::NotFound("Certificate not found".to_string()))
}

async fn show_certificate(
    State(state): State<AppState>,
    Path(certificate_number): Path<String>,
) -> Result<Html<String>, ApiError> {
    let record = load(&state, &certificate_number).await?;
    let fields = document_fields(&CertificateSubject::from_record(&record))
        .map_err(|e| ApiError::internal(e, "Certificate record is incomplete"))?;
    let qr_url = record.student.qr_code.as_deref().map(|key| state.storage().public_url(key));
    let standing = record.student.standing(today_utc());

    Ok(Html(render_page(state.artifacts().template(), &fields, qr_url.as_deref(), standing)))
}

async fn download_certificate(
    State(state): State<AppState>,
    Path(certificate_number): Path<String>,
) -> Result<Response, ApiError> {
    let record = load(&state, &certificate_number).await?;
    pdf_attachment(&state, &record).await
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn optional_row(label: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("<tr><th>{}</th><td>{}</td></tr>", escape(label), escape(value)),
        None => String::new(),
    }
}

fn render_page(
    template: &CertificateTemplate,
    fields: &DocumentFields,
    qr_url: Option<&str>,
    standing: Standing,
) -> String {
    let status = match standing {
        Standing::Valid => "Valid",
        Standing::Expired => "Expired",
        Standing::Revoked => "Revoked",
    };
    let qr = qr_url
        .map(|url| {
            format!(
                "<figure><img src=\"{}\" alt=\"QR code\" width=\"160\" height=\"160\">\
                 <figcaption>{}</figcaption></figure>",
                escape(url),
                escape(&template.qr_caption)
            )
        })
        .unwrap_or_default();

    format!(
        "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Certificate {number}</title></head>
<body>
<main class=\"certificate\">
<p class=\"authority\">{authority}</p>
<h1>{issuer}</h1>
<p class=\"number\">No. {number}</p>
<p class=\"status status-{status_class}\">{status}</p>
<h2>{student}</h2>
<table>
<tr><th>Course</th><td>{course}</td></tr>
{hours}{level}{control}<tr><th>Issued</th><td>{issued}</td></tr>
<tr><th>Valid until</th><td>{expires}</td></tr>
</table>
<p class=\"signature\">{director_title} {director_name}</p>
{qr}
</main>
</body>
</html>
",
        number = escape(&fields.certificate_number),
        authority = escape(&template.authority_line),
        issuer = escape(&template.issuer),
        status_class = status.to_ascii_lowercase(),
        student = escape(&fields.student_name),
        course = escape(&fields.course_name),
        hours = optional_row("Hours", fields.hours.as_deref()),
        level = optional_row("Level", fields.level.as_deref()),
        control = optional_row("Assessment", fields.control.as_deref()),
        issued = escape(&fields.issue_date),
        expires = escape(&fields.expiry_date),
        director_title = escape(&template.director_title),
        director_name = escape(&template.director_name),
    )
}
