use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::User;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct UserCreate {
    #[validate(email(message = "The email must be a valid email address."))]
    pub(crate) email: String,
    #[serde(alias = "fullName")]
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) full_name: String,
    #[validate(length(min = 8, message = "The password must be at least 8 characters."))]
    pub(crate) password: String,
    #[serde(default)]
    pub(crate) roles: Vec<String>,
    #[serde(default = "default_true")]
    #[serde(alias = "isActive")]
    pub(crate) is_active: bool,
}

/// Partial update; absent fields keep their stored values.
#[derive(Debug, Default, Deserialize, Validate)]
pub(crate) struct UserUpdate {
    #[serde(default)]
    #[validate(email(message = "The email must be a valid email address."))]
    pub(crate) email: Option<String>,
    #[serde(default, alias = "fullName")]
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) full_name: Option<String>,
    #[serde(default)]
    #[validate(length(min = 8, message = "The password must be at least 8 characters."))]
    pub(crate) password: Option<String>,
    #[serde(default, alias = "isActive")]
    pub(crate) is_active: Option<bool>,
    #[serde(default)]
    pub(crate) roles: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserRolesUpdate {
    pub(crate) roles: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserResponse {
    pub(crate) id: String,
    pub(crate) email: String,
    pub(crate) full_name: String,
    pub(crate) is_active: bool,
    pub(crate) created_at: String,
}

impl UserResponse {
    pub(crate) fn from_db(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            full_name: user.full_name,
            is_active: user.is_active,
            created_at: format_primitive(user.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UserWithRolesResponse {
    #[serde(flatten)]
    pub(crate) user: UserResponse,
    pub(crate) roles: Vec<String>,
}

fn default_true() -> bool {
    true
}
