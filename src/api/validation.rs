use std::path::Path;

use time::Date;

use crate::api::errors::ApiError;
use crate::core::time::parse_iso_date;
use crate::services::lifecycle::FieldErrors;

/// Flattens `validator` output into `{field: [messages]}`.
pub(crate) fn field_errors(errors: &validator::ValidationErrors) -> FieldErrors {
    let mut out = FieldErrors::new();
    for (field, failures) in errors.field_errors() {
        let messages = failures
            .iter()
            .map(|failure| match &failure.message {
                Some(message) => message.to_string(),
                None => format!("The {field} field is invalid."),
            })
            .collect();
        out.insert(field.to_string(), messages);
    }
    out
}

/// Parses an optional `YYYY-MM-DD` field; blank counts as absent.
pub(crate) fn optional_date(field: &str, value: Option<&str>) -> Result<Option<Date>, ApiError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_iso_date(raw)
            .map(Some)
            .ok_or_else(|| ApiError::field(field, format!("The {field} is not a valid date."))),
    }
}

/// Checks extension and MIME type of an uploaded image; returns the
/// normalised extension.
pub(crate) fn validate_image_upload(
    filename: &str,
    content_type: &str,
    allowed_extensions: &[String],
) -> Result<String, ApiError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(|| ApiError::field("image", "The image must have a file extension."))?;

    if !allowed_extensions.iter().any(|allowed| allowed == &extension) {
        return Err(ApiError::field(
            "image",
            format!("The image must be a file of type: {}.", allowed_extensions.join(", ")),
        ));
    }

    let mime = content_type.trim().to_ascii_lowercase();
    if mime_allowed_for_extension(&mime, &extension) {
        Ok(extension)
    } else {
        Err(ApiError::field(
            "image",
            format!("MIME type '{mime}' does not match extension '.{extension}'."),
        ))
    }
}

fn mime_allowed_for_extension(mime: &str, extension: &str) -> bool {
    match extension {
        "jpg" | "jpeg" => matches!(mime, "image/jpeg" | "image/jpg"),
        "png" => mime == "image/png",
        "webp" => mime == "image/webp",
        "gif" => mime == "image/gif",
        _ => false,
    }
}
