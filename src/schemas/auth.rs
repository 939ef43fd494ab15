use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::schemas::user::UserResponse;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct LoginRequest {
    #[validate(email(message = "The email must be a valid email address."))]
    pub(crate) email: String,
    #[validate(length(min = 1, message = "The password field is required."))]
    pub(crate) password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) token_type: String,
    pub(crate) user: UserResponse,
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    #[serde(flatten)]
    pub(crate) user: UserResponse,
    pub(crate) roles: Vec<String>,
    pub(crate) permissions: Vec<String>,
}
