//! Route access control.
//!
//! - `RouteTable`: declared routes and their access requirements
//! - `NavigationGuard`: decides whether a navigation may proceed
//! - `Navigator`: the capability the session core uses to redirect

pub mod guard;
pub mod table;

pub use guard::{evaluate, Decision, LandingPages, NavigationGuard};
pub use table::{Route, RouteMeta, RouteTable};

use tracing::info;

/// Sends the presentation layer to a path.
///
/// The session manager calls this once when a session expires.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

/// Navigator for front ends without a router: records the redirect in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, path: &str) {
        info!(to = %path, "Navigation requested");
    }
}
