use serde::Serialize;

/// Access requirements attached to a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteMeta {
    pub requires_auth: bool,
    pub requires_admin: bool,
    pub requires_guest: bool,
}

impl RouteMeta {
    pub const NONE: Self = Self {
        requires_auth: false,
        requires_admin: false,
        requires_guest: false,
    };

    pub const AUTH: Self = Self {
        requires_auth: true,
        requires_admin: false,
        requires_guest: false,
    };

    pub const ADMIN: Self = Self {
        requires_auth: true,
        requires_admin: true,
        requires_guest: false,
    };

    pub const GUEST: Self = Self {
        requires_auth: false,
        requires_admin: false,
        requires_guest: true,
    };

    /// Combine with a parent's requirements. Flags only ever accumulate.
    pub fn merge(self, other: Self) -> Self {
        Self {
            requires_auth: self.requires_auth || other.requires_auth,
            requires_admin: self.requires_admin || other.requires_admin,
            requires_guest: self.requires_guest || other.requires_guest,
        }
    }
}

/// A navigation target with its resolved requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: String,
    pub meta: RouteMeta,
}

impl Route {
    pub fn new(path: impl Into<String>, meta: RouteMeta) -> Self {
        Self {
            path: normalize(&path.into()),
            meta,
        }
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }
}

/// Declared routes, matched by path segment prefix.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<(String, RouteMeta)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prefix: &str, meta: RouteMeta) -> Self {
        self.entries.push((normalize(prefix), meta));
        self
    }

    /// The application's routes: guest pages, the user area and the admin area.
    pub fn standard() -> Self {
        let mut table = Self::new().with("/", RouteMeta::AUTH);

        for page in ["/login", "/register", "/forgot-password", "/reset-password", "/verify-email"] {
            table = table.with(page, RouteMeta::GUEST);
        }

        for page in [
            "/dashboard",
            "/subscription",
            "/devices",
            "/packages",
            "/orders",
            "/nodes",
            "/help",
            "/profile",
            "/login-history",
            "/settings",
            "/tutorials",
        ] {
            table = table.with(page, RouteMeta::AUTH);
        }

        table.with("/admin", RouteMeta::ADMIN)
    }

    /// Resolve a path, merging the requirements of every declared ancestor.
    ///
    /// Undeclared paths resolve with no requirements.
    pub fn resolve(&self, path: &str) -> Route {
        let path = normalize(path);
        let meta = self
            .entries
            .iter()
            .filter(|(prefix, _)| covers(prefix, &path))
            .fold(RouteMeta::NONE, |acc, (_, meta)| acc.merge(*meta));
        Route { path, meta }
    }
}

/// Strip query and fragment, and any trailing slash except the root's.
fn normalize(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Segment-aware prefix match. The root only covers itself.
fn covers(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path == "/";
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
