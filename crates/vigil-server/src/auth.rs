//! Request identity and permission checks.
//!
//! Identity comes from a trusted authenticating proxy through the
//! `X-Auth-User`, `X-Auth-Role` and `X-Auth-Org` headers. Permission
//! decisions go through an [`AccessControl`] implementation; handlers only
//! consume allow or deny.

use std::collections::HashMap;
use std::fmt;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vigil_alerts::rule::DEFAULT_ORG_ID;

use crate::error::ApiError;

/// Header carrying the login of the authenticated user.
pub const USER_HEADER: &str = "x-auth-user";
/// Header carrying the user's organisation role.
pub const ROLE_HEADER: &str = "x-auth-role";
/// Header carrying the organisation ID.
pub const ORG_HEADER: &str = "x-auth-org";

/// Organisation role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrgRole {
    /// Read-only access.
    Viewer,
    /// Can change rules and silences.
    Editor,
    /// Full access.
    Admin,
}

impl OrgRole {
    /// Parses a role name, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for OrgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Viewer => "Viewer",
            Self::Editor => "Editor",
            Self::Admin => "Admin",
        };
        f.write_str(name)
    }
}

/// The caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Login name.
    pub login: String,
    /// Role in the organisation.
    pub role: OrgRole,
    /// Organisation the request acts on.
    pub org_id: i64,
}

impl User {
    /// Creates a user.
    pub fn new(login: impl Into<String>, role: OrgRole, org_id: i64) -> Self {
        Self {
            login: login.into(),
            role,
            org_id,
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let login = header(parts, USER_HEADER).ok_or(ApiError::Unauthenticated)?;
        let role = match header(parts, ROLE_HEADER) {
            Some(value) => OrgRole::parse(value)
                .ok_or_else(|| ApiError::Validation(format!("invalid role {value:?}")))?,
            None => OrgRole::Viewer,
        };
        let org_id = match header(parts, ORG_HEADER) {
            Some(value) => value
                .parse::<i64>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| ApiError::Validation(format!("invalid organisation {value:?}")))?,
            None => DEFAULT_ORG_ID,
        };
        Ok(Self::new(login, role, org_id))
    }
}

/// Something a user wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read alert rules and their state.
    RulesRead,
    /// Create, change or delete alert rules.
    RulesWrite,
    /// Read alerts held by the Alertmanager.
    AlertsRead,
    /// Post alerts to the Alertmanager.
    AlertsWrite,
    /// Read silences.
    SilencesRead,
    /// Create, update or expire silences.
    SilencesWrite,
    /// Read the Alertmanager configuration.
    NotificationsRead,
    /// Change the Alertmanager configuration.
    NotificationsWrite,
    /// Read provisioned resources.
    ProvisioningRead,
    /// Change provisioned resources.
    ProvisioningWrite,
    /// Read or change where alerts are sent.
    AdminConfig,
}

impl Action {
    /// Lowest role granted this action by default.
    #[must_use]
    pub const fn min_role(self) -> OrgRole {
        match self {
            Self::RulesRead | Self::AlertsRead | Self::SilencesRead => OrgRole::Viewer,
            Self::RulesWrite
            | Self::AlertsWrite
            | Self::SilencesWrite
            | Self::NotificationsRead
            | Self::ProvisioningRead => OrgRole::Editor,
            Self::NotificationsWrite | Self::ProvisioningWrite | Self::AdminConfig => OrgRole::Admin,
        }
    }
}

/// What an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// The whole organisation.
    Global,
    /// One folder.
    Folder(&'a str),
}

/// Permission decisions.
pub trait AccessControl: Send + Sync + fmt::Debug {
    /// True if `user` may perform `action` on `scope`.
    fn allowed(&self, user: &User, action: Action, scope: Scope<'_>) -> bool;
}

/// Role-based [`AccessControl`] with optional per-folder minimum roles.
#[derive(Debug, Default)]
pub struct BasicAccessControl {
    folders: RwLock<HashMap<(i64, String), OrgRole>>,
}

impl BasicAccessControl {
    /// Creates an instance with no folder restrictions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires at least `role` for anything inside a folder.
    pub fn restrict_folder(&self, org_id: i64, folder_uid: impl Into<String>, role: OrgRole) {
        self.folders.write().insert((org_id, folder_uid.into()), role);
    }

    /// Builder form of [`BasicAccessControl::restrict_folder`].
    #[must_use]
    pub fn with_folder(self, org_id: i64, folder_uid: impl Into<String>, role: OrgRole) -> Self {
        self.restrict_folder(org_id, folder_uid, role);
        self
    }
}

impl AccessControl for BasicAccessControl {
    fn allowed(&self, user: &User, action: Action, scope: Scope<'_>) -> bool {
        if user.role < action.min_role() {
            return false;
        }
        match scope {
            Scope::Global => true,
            Scope::Folder(folder) => self
                .folders
                .read()
                .get(&(user.org_id, folder.to_string()))
                .is_none_or(|required| user.role >= *required),
        }
    }
}
