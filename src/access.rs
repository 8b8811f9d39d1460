//! Caller identity and role-based permissions.
//!
//! Authentication is done upstream by the gateway. It forwards the user id
//! in `x-user-id` and the caller's roles in `x-user-roles`
//! (comma-separated; `User` when absent). Everything here trusts those
//! headers.
//!
//! | Role | Permissions |
//! |------|-------------|
//! | `SuperAdmin` | all |
//! | `User` | none (owns threads and own profile) |
//! | `Restricted` | none |

use anyhow::Result;
use axum::http::HeaderMap;

use crate::error::CxError;
use crate::models::Role;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ManageProfiles,
    ManageProjects,
    ManageThreads,
    ManageMessages,
    ManageNodes,
    ManageSourceDocuments,
}

impl Permission {
    pub fn name(&self) -> &'static str {
        match self {
            Permission::ManageProfiles => "CanManageProfiles",
            Permission::ManageProjects => "CanManageProjects",
            Permission::ManageThreads => "CanManageThreads",
            Permission::ManageMessages => "CanManageMessages",
            Permission::ManageNodes => "CanManageNodes",
            Permission::ManageSourceDocuments => "CanManageSourceDocuments",
        }
    }
}

fn role_grants(role: Role, _permission: Permission) -> bool {
    match role {
        Role::SuperAdmin => true,
        Role::User | Role::Restricted => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }

    /// The identity used by the CLI, which acts with full rights.
    pub fn system() -> Self {
        Self::new("system", vec![Role::SuperAdmin])
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CxError::Forbidden(format!("missing {} header", USER_ID_HEADER)))?;

        let roles = match headers.get(USER_ROLES_HEADER).and_then(|v| v.to_str().ok()) {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .filter(|r| !r.trim().is_empty())
                .map(|r| r.parse::<Role>())
                .collect::<Result<Vec<_>, _>>()?,
            _ => vec![Role::User],
        };

        Ok(Self::new(user_id, roles))
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.roles.iter().any(|r| role_grants(*r, permission))
    }

    pub fn must_have(&self, permission: Permission) -> Result<()> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(CxError::Forbidden(format!(
                "user {} lacks permission {}",
                self.user_id,
                permission.name()
            ))
            .into())
        }
    }

    /// Passes when the caller owns the resource or holds `permission`.
    pub fn must_own_or(&self, owner: &str, permission: Permission) -> Result<()> {
        if self.user_id == owner {
            return Ok(());
        }
        self.must_have(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn roles_default_to_user() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        let caller = Caller::from_headers(&headers).unwrap();
        assert_eq!(caller.user_id, "alice");
        assert_eq!(caller.roles, vec![Role::User]);
        assert!(!caller.has(Permission::ManageThreads));
    }

    #[test]
    fn missing_user_id_is_forbidden() {
        let err = Caller::from_headers(&HeaderMap::new()).unwrap_err();
        assert!(matches!(CxError::find(&err), Some(CxError::Forbidden(_))));
    }

    #[test]
    fn super_admin_has_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("root"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("user, superadmin"));
        let caller = Caller::from_headers(&headers).unwrap();
        assert!(caller.has(Permission::ManageSourceDocuments));
        assert!(caller.must_have(Permission::ManageNodes).is_ok());
    }

    #[test]
    fn owner_passes_without_permission() {
        let caller = Caller::new("bob", vec![Role::Restricted]);
        assert!(caller.must_own_or("bob", Permission::ManageThreads).is_ok());
        let err = caller
            .must_own_or("alice", Permission::ManageThreads)
            .unwrap_err();
        assert!(err.to_string().contains("CanManageThreads"));
    }
}
