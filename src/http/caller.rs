//! Caller privilege resolution.

use crate::delta::CallerScope;
use axum::http::header::{HeaderMap, HeaderName, InvalidHeaderName};
use std::collections::HashSet;

/// Decides what a request's caller may see.
pub trait CallerResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> CallerScope;
}

/// Reads a role set by the upstream gateway from a request header.
///
/// Missing, non-UTF-8 or unlisted roles resolve to [`CallerScope::Standard`].
#[derive(Clone, Debug)]
pub struct RoleHeaderResolver {
    header: HeaderName,
    privileged_roles: HashSet<String>,
}

impl RoleHeaderResolver {
    pub const DEFAULT_HEADER: &'static str = "x-sync-role";

    pub fn new<I, S>(header: &str, privileged_roles: I) -> Result<Self, InvalidHeaderName>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            header: HeaderName::try_from(header)?,
            privileged_roles: privileged_roles
                .into_iter()
                .map(|r| r.into().to_ascii_lowercase())
                .collect(),
        })
    }
}

impl CallerResolver for RoleHeaderResolver {
    fn resolve(&self, headers: &HeaderMap) -> CallerScope {
        let role = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        match role {
            Some(role) if self.privileged_roles.contains(&role) => CallerScope::Privileged,
            _ => CallerScope::Standard,
        }
    }
}
