use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::repositories;

pub(crate) const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Permission {
    ViewCourses,
    CreateCourses,
    EditCourses,
    DeleteCourses,
    ViewStudents,
    CreateStudents,
    EditStudents,
    DeleteStudents,
    RevokeCertificates,
    ViewUsers,
    CreateUsers,
    EditUsers,
    DeleteUsers,
    ManageRoles,
}

impl Permission {
    /// Name stored in the `permissions` table.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Permission::ViewCourses => "view courses",
            Permission::CreateCourses => "create courses",
            Permission::EditCourses => "edit courses",
            Permission::DeleteCourses => "delete courses",
            Permission::ViewStudents => "view students",
            Permission::CreateStudents => "create students",
            Permission::EditStudents => "edit students",
            Permission::DeleteStudents => "delete students",
            Permission::RevokeCertificates => "revoke certificates",
            Permission::ViewUsers => "view users",
            Permission::CreateUsers => "create users",
            Permission::EditUsers => "edit users",
            Permission::DeleteUsers => "delete users",
            Permission::ManageRoles => "manage roles",
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum AccessError {
    #[error("missing permission: {}", .0.as_str())]
    Denied(Permission),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub(crate) trait AccessControl: Send + Sync {
    async fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool, sqlx::Error>;

    async fn user_has_permission(
        &self,
        user_id: &str,
        permission: Permission,
    ) -> Result<bool, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub(crate) struct PgAccessControl {
    db: PgPool,
}

impl PgAccessControl {
    pub(crate) fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccessControl for PgAccessControl {
    async fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool, sqlx::Error> {
        repositories::access::user_has_role(&self.db, user_id, role).await
    }

    async fn user_has_permission(
        &self,
        user_id: &str,
        permission: Permission,
    ) -> Result<bool, sqlx::Error> {
        repositories::access::user_has_permission(&self.db, user_id, permission.as_str()).await
    }
}

/// Proof that `user_id` passed a permission check. Only [`authorize`] builds
/// one, so mutating operations that take a `Grant` cannot run unchecked.
#[derive(Debug, Clone)]
pub(crate) struct Grant {
    user_id: String,
    permission: Permission,
}

impl Grant {
    pub(crate) fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Confirms the grant was issued for `permission`.
    pub(crate) fn require(&self, permission: Permission) -> Result<(), AccessError> {
        if self.permission == permission {
            Ok(())
        } else {
            Err(AccessError::Denied(permission))
        }
    }
}

pub(crate) async fn authorize(
    access: &dyn AccessControl,
    user_id: &str,
    permission: Permission,
) -> Result<Grant, AccessError> {
    if access.user_has_permission(user_id, permission).await? {
        Ok(Grant { user_id: user_id.to_string(), permission })
    } else {
        tracing::info!(user_id, permission = permission.as_str(), "Permission denied");
        Err(AccessError::Denied(permission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAccess {
        granted: Vec<Permission>,
    }

    #[async_trait]
    impl AccessControl for StaticAccess {
        async fn user_has_role(&self, _user_id: &str, role: &str) -> Result<bool, sqlx::Error> {
            Ok(role == ADMIN_ROLE)
        }

        async fn user_has_permission(
            &self,
            _user_id: &str,
            permission: Permission,
        ) -> Result<bool, sqlx::Error> {
            Ok(self.granted.contains(&permission))
        }
    }

    #[tokio::test]
    async fn authorize_issues_grant_only_for_held_permission() {
        let access = StaticAccess { granted: vec![Permission::ViewStudents] };

        let grant = authorize(&access, "u-1", Permission::ViewStudents).await.expect("grant");
        assert_eq!(grant.user_id(), "u-1");
        assert!(grant.require(Permission::ViewStudents).is_ok());
        assert!(matches!(
            grant.require(Permission::DeleteStudents),
            Err(AccessError::Denied(Permission::DeleteStudents))
        ));

        assert!(matches!(
            authorize(&access, "u-1", Permission::CreateStudents).await,
            Err(AccessError::Denied(Permission::CreateStudents))
        ));
    }
}
