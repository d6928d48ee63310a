//! Session data model — reusable "proof of passage" credentials with health tracking.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tuning knobs for session health.
///
/// The defaults are production-tuned; override by constructing the struct
/// directly.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Failures before a session is invalidated.
    pub max_failures: u32,
    /// Maximum session age before it counts as expired.
    pub max_age: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_failures: 3,
            max_age: Duration::from_secs(60 * 60), // 1 hour
        }
    }
}

/// A capability URL captured by the producer, reusable across many requests.
///
/// Sessions are created unpersisted (`id = None`); the store assigns the id
/// on insert. All later mutation flows through [`crate::session::SessionPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Store-assigned id; `None` until persisted.
    pub id: Option<i64>,
    /// The captured capability URL (opaque to this crate).
    pub url: String,
    /// Logical partition this session serves (e.g. "US-West").
    pub region: String,
    /// Egress identity active when the session was minted, for traceability.
    pub proxy_bucket: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub success_count: u32,
    pub failure_count: u32,
    pub is_valid: bool,
}

impl Session {
    /// Create a new, not-yet-persisted session.
    pub fn new(url: impl Into<String>, region: impl Into<String>, proxy_bucket: impl Into<String>) -> Self {
        Self {
            id: None,
            url: url.into(),
            region: region.into(),
            proxy_bucket: proxy_bucket.into(),
            created_at: Utc::now(),
            last_used: None,
            success_count: 0,
            failure_count: 0,
            is_valid: true,
        }
    }

    /// Record a successful use. A success also walks back one earlier failure,
    /// so a recovered session stops drifting toward invalidation.
    pub fn mark_success(&mut self) {
        self.success_count += 1;
        self.last_used = Some(Utc::now());
        self.failure_count = self.failure_count.saturating_sub(1);
    }

    /// Record a failed use; invalidates the session once it crosses the
    /// failure threshold.
    pub fn mark_failure(&mut self, limits: &SessionLimits) {
        self.failure_count += 1;
        if self.failure_count >= limits.max_failures {
            self.is_valid = false;
        }
    }

    /// Whether this session is past its maximum age.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX)
    }

    /// Valid and not age-expired. Age expiry is independent of the
    /// use-based invalidation applied by [`Session::mark_failure`].
    pub fn is_healthy(&self, limits: &SessionLimits) -> bool {
        self.is_valid && !self.is_expired(limits.max_age)
    }

    /// Session age in whole minutes, for logs.
    pub fn age_minutes(&self) -> i64 {
        Utc::now().signed_duration_since(self.created_at).num_minutes()
    }
}
