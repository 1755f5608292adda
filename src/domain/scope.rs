//! Canonical queue identity.
//!
//! A [`Scope`] joins a project identifier and a queue name into the single
//! broker-side queue name. Both components are restricted to a small
//! identifier grammar so a request can never address a queue outside its
//! own project namespace.

use std::fmt;

use crate::error::GatewayError;

/// Separator between the project and the queue name. Never valid inside a
/// project identifier, which keeps the mapping injective.
const SEPARATOR: char = '_';

/// Validated broker queue name, `{project}_{queue}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope(String);

impl Scope {
    /// Validates the path components and builds the scope.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] if the project is not purely
    /// alphanumeric or the queue name contains characters outside
    /// `[A-Za-z0-9.:_-]`.
    pub fn resolve(project: &str, queue: &str) -> Result<Self, GatewayError> {
        if !is_project_id(project) {
            return Err(GatewayError::InvalidArgument(
                "Invalid project ID.".to_string(),
            ));
        }
        if !is_queue_name(queue) {
            return Err(GatewayError::InvalidArgument(
                "Invalid queue name.".to_string(),
            ));
        }
        Ok(Self(format!("{project}{SEPARATOR}{queue}")))
    }

    /// Returns the broker queue name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_project_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

fn is_queue_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn joins_project_and_queue() {
        let Ok(scope) = Scope::resolve("acme", "orders.v1:eu-west_2") else {
            panic!("valid scope rejected");
        };
        assert_eq!(scope.as_str(), "acme_orders.v1:eu-west_2");
        assert_eq!(scope.to_string(), "acme_orders.v1:eu-west_2");
    }

    #[test]
    fn rejects_bad_project() {
        for project in ["", "ac-me", "ac_me", "acme!", "ac me"] {
            let result = Scope::resolve(project, "orders");
            assert!(
                matches!(result, Err(GatewayError::InvalidArgument(ref m)) if m == "Invalid project ID."),
                "project {project:?} accepted"
            );
        }
    }

    #[test]
    fn rejects_bad_queue_name() {
        for queue in ["", "or ders", "orders/1", "#", "orders*"] {
            let result = Scope::resolve("acme", queue);
            assert!(
                matches!(result, Err(GatewayError::InvalidArgument(ref m)) if m == "Invalid queue name."),
                "queue {queue:?} accepted"
            );
        }
    }

    #[test]
    fn distinct_pairs_never_collide() {
        let pairs = [("a", "b_c"), ("ab", "c"), ("a1", "b"), ("a", "1_b")];
        let mut seen = std::collections::HashSet::new();
        for (project, queue) in pairs {
            let Ok(scope) = Scope::resolve(project, queue) else {
                panic!("valid scope rejected");
            };
            assert!(seen.insert(scope), "{project}/{queue} collided");
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let a = Scope::resolve("acme", "jobs").ok();
        let b = Scope::resolve("acme", "jobs").ok();
        assert!(a.is_some());
        assert_eq!(a, b);
    }
}
