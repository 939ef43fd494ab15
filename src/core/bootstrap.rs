use anyhow::Context;
use uuid::Uuid;

use crate::core::security;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories;
use crate::services::access_control::ADMIN_ROLE;

/// Makes sure the configured default administrator exists, can log in with
/// the configured password and holds the admin role.
pub(crate) async fn ensure_superuser(state: &AppState) -> anyhow::Result<()> {
    let admin = state.settings().admin();
    if admin.first_superuser_password.is_empty() {
        tracing::warn!("FIRST_SUPERUSER_PASSWORD not configured; skipping superuser creation");
        return Ok(());
    }

    let email = admin.first_superuser_email.trim();
    let now = primitive_now_utc();
    let existing = repositories::users::find_by_email(state.db(), email)
        .await
        .context("failed to look up default superuser")?;

    let user_id = match existing {
        Some(user) => {
            let verified =
                security::verify_password(&admin.first_superuser_password, &user.hashed_password)
                    .unwrap_or(false);
            if !verified || !user.is_active {
                let hashed_password = if verified {
                    None
                } else {
                    Some(security::hash_password(&admin.first_superuser_password)?)
                };
                repositories::users::update(
                    state.db(),
                    &user.id,
                    repositories::users::UpdateUser {
                        email: None,
                        full_name: None,
                        is_active: Some(true),
                        hashed_password,
                        updated_at: now,
                    },
                )
                .await
                .context("failed to update default superuser")?;
                tracing::info!(email, "Updated default superuser");
            }
            user.id
        }
        None => {
            let hashed_password = security::hash_password(&admin.first_superuser_password)?;
            let mut conn = state.db().acquire().await?;
            let user = repositories::users::create(
                &mut conn,
                repositories::users::CreateUser {
                    id: &Uuid::new_v4().to_string(),
                    email,
                    hashed_password,
                    full_name: "Administrator",
                    is_active: true,
                    now,
                },
            )
            .await
            .context("failed to create default superuser")?;
            tracing::info!(email, "Created default superuser");
            user.id
        }
    };

    let is_admin = state
        .access()
        .user_has_role(&user_id, ADMIN_ROLE)
        .await
        .context("failed to check default superuser role")?;
    if !is_admin {
        repositories::access::assign_role_by_name(state.db(), &user_id, ADMIN_ROLE).await?;
        tracing::info!(email, role = ADMIN_ROLE, "Granted role to default superuser");
    }
    Ok(())
}

/// Logs loudly when the certificate font is absent. Issuance fails with a
/// template error until it is provided, but the rest of the service runs.
pub(crate) fn check_template_assets(state: &AppState) {
    let font_path = &state.artifacts().template().font_path;
    if !font_path.is_file() {
        tracing::error!(
            path = %font_path.display(),
            "Certificate font not found; certificate issuance will fail until it is installed"
        );
    }
}
