use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::db::models::PermissionRecord;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RoleCreate {
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) permissions: Vec<String>,
}

/// Renames a role. The permission set is only replaced when `permissions` is sent.
#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RoleUpdate {
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) permissions: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoleResponse {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PermissionResponse {
    pub(crate) id: i64,
    pub(crate) name: String,
}

impl From<PermissionRecord> for PermissionResponse {
    fn from(permission: PermissionRecord) -> Self {
        Self { id: permission.id, name: permission.name }
    }
}
