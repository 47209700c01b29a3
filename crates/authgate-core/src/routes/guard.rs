//! Navigation guard.
//!
//! Decisions are a pure function of the target route, the current session
//! state and the configured landing pages. The guard never changes state.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::auth::{SessionManager, SessionState};

use super::table::{Route, RouteTable};

pub const DEFAULT_LANDING_PATH: &str = "/dashboard";
pub const DEFAULT_ADMIN_LANDING_PATH: &str = "/admin/dashboard";

/// Where each kind of redirect goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingPages {
    pub login: String,
    pub landing: String,
    pub admin_landing: String,
}

impl Default for LandingPages {
    fn default() -> Self {
        Self {
            login: crate::auth::manager::DEFAULT_LOGIN_PATH.to_string(),
            landing: DEFAULT_LANDING_PATH.to_string(),
            admin_landing: DEFAULT_ADMIN_LANDING_PATH.to_string(),
        }
    }
}

impl LandingPages {
    fn for_role(&self, is_admin: bool) -> &str {
        if is_admin {
            &self.admin_landing
        } else {
            &self.landing
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "to", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RedirectTo(String),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::RedirectTo(path) => write!(f, "redirect to {}", path),
        }
    }
}

/// Decide a navigation. Rules are checked in order; the first match wins.
///
/// A session being renewed counts as authenticated.
pub fn evaluate(route: &Route, state: &SessionState, pages: &LandingPages) -> Decision {
    let authenticated = state.is_authenticated();
    let admin = state.is_admin();

    if route.meta.requires_auth && !authenticated {
        return Decision::RedirectTo(pages.login.clone());
    }
    if route.meta.requires_admin && !admin {
        return Decision::RedirectTo(pages.landing.clone());
    }
    if route.meta.requires_guest && authenticated {
        return Decision::RedirectTo(pages.for_role(admin).to_string());
    }
    if route.is_root() && authenticated {
        return Decision::RedirectTo(pages.for_role(admin).to_string());
    }
    Decision::Allow
}

/// Guard bound to a live session.
#[derive(Clone)]
pub struct NavigationGuard {
    session: SessionManager,
    table: RouteTable,
    pages: LandingPages,
}

impl NavigationGuard {
    pub fn new(session: SessionManager, table: RouteTable, pages: LandingPages) -> Self {
        Self {
            session,
            table,
            pages,
        }
    }

    pub fn decide(&self, route: &Route) -> Decision {
        let decision = evaluate(route, &self.session.state(), &self.pages);
        debug!(path = %route.path, decision = %decision, "Navigation decided");
        decision
    }

    /// Resolve a path against the route table, then decide.
    pub fn decide_path(&self, path: &str) -> Decision {
        self.decide(&self.table.resolve(path))
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }
}
