pub(crate) mod access;
pub(crate) mod artifact_cleanup;
pub(crate) mod courses;
pub(crate) mod health;
pub(crate) mod sequences;
pub(crate) mod students;
pub(crate) mod users;

/// Escapes LIKE metacharacters so user search text matches literally.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
