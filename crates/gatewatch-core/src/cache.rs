//! # Cache Types
//!
//! Entry layout shared by both cache tiers, the eviction rule, and the
//! deferred write record used by the offline queue.
//!
//! ## Persisted Entry Layout
//! ```text
//! {
//!   "value":     <any JSON>,
//!   "writtenAt": "2026-01-01T00:00:00Z",
//!   "expiresAt": "2026-01-01T00:00:30Z" | null,
//!   "priority":  "low" | "normal" | "high" | "critical",
//!   "tags":      ["sessions", ...]
//! }
//! ```
//!
//! ## Eviction Rank
//! Victims are chosen by `(priority ascending, writtenAt ascending)`:
//! priority first, recency second, never the reverse.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Priority
// =============================================================================

/// Importance of a cache entry or event.
///
/// Ordering is meaningful: `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Priority {
    /// First to be evicted, never promoted from the slow tier.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Always written through to the slow tier.
    High,
    /// Always written through to the slow tier, last to be evicted.
    Critical,
}

impl Priority {
    /// Returns true if entries of this priority always go to the slow tier.
    pub fn persists(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }

    /// Returns true if a slow-tier hit of this priority is copied to the fast tier.
    pub fn promotes(&self) -> bool {
        *self != Priority::Low
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(CoreError::UnknownPriority(other.to_string())),
        }
    }
}

// =============================================================================
// Resource Classes
// =============================================================================

/// Logical resource classes the dashboard caches.
///
/// Each class has a cache tag (also used as key prefix) and its own TTL in
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Chat sessions and their message counts.
    Sessions,
    /// Agent list and status.
    Agents,
    /// Cron job definitions and runs.
    CronJobs,
    /// Search results.
    SearchResults,
    /// Gateway system health.
    SystemHealth,
}

impl ResourceClass {
    /// Every class.
    pub const ALL: [ResourceClass; 5] = [
        ResourceClass::Sessions,
        ResourceClass::Agents,
        ResourceClass::CronJobs,
        ResourceClass::SearchResults,
        ResourceClass::SystemHealth,
    ];

    /// Class whose tag prefixes `key`, if any.
    pub fn for_key(key: &str) -> Option<ResourceClass> {
        ResourceClass::ALL
            .into_iter()
            .find(|class| key.starts_with(class.tag()))
    }

    /// Tag and key prefix for entries of this class.
    pub fn tag(&self) -> &'static str {
        match self {
            ResourceClass::Sessions => "sessions",
            ResourceClass::Agents => "agents",
            ResourceClass::CronJobs => "cron",
            ResourceClass::SearchResults => "search",
            ResourceClass::SystemHealth => "health",
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached value with its expiry, priority and tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// The cached value.
    pub value: T,

    /// Last write, bumped on fast-tier reads for recency.
    pub written_at: DateTime<Utc>,

    /// Absent means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// Eviction and persistence priority.
    #[serde(default)]
    pub priority: Priority,

    /// Labels for bulk invalidation.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
    /// Creates an entry written at `now`. A zero `ttl` means no expiry.
    pub fn new(
        value: T,
        now: DateTime<Utc>,
        ttl: Duration,
        priority: Priority,
        tags: BTreeSet<String>,
    ) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
        };

        CacheEntry {
            value,
            written_at: now,
            expires_at,
            priority,
            tags,
        }
    }

    /// Returns true once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Returns true once the entry is past expiry by at least `grace`.
    pub fn is_expired_beyond(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let Some(at) = self.expires_at else {
            return false;
        };
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        match at.checked_add_signed(grace) {
            Some(limit) => now >= limit,
            None => false,
        }
    }

    /// Returns true if the entry carries any of `tags`.
    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }

    /// Returns true if `scope` is one of the entry's tags or a prefix of `key`.
    pub fn in_scope(&self, key: &str, scope: &str) -> bool {
        self.tags.contains(scope) || key.starts_with(scope)
    }

    /// Bumps the recency timestamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.written_at = now;
    }

    /// Eviction rank, smallest evicted first.
    pub fn eviction_rank(&self) -> (Priority, DateTime<Utc>) {
        (self.priority, self.written_at)
    }
}

/// Returns the keys to evict so that at most `capacity` entries remain.
pub fn select_evictions<'a, T, I>(entries: I, capacity: usize) -> Vec<String>
where
    T: 'a,
    I: IntoIterator<Item = (&'a String, &'a CacheEntry<T>)>,
{
    let mut ranked: Vec<(&String, (Priority, DateTime<Utc>))> = entries
        .into_iter()
        .map(|(key, entry)| (key, entry.eviction_rank()))
        .collect();

    if ranked.len() <= capacity {
        return Vec::new();
    }

    ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let excess = ranked.len() - capacity;
    ranked
        .into_iter()
        .take(excess)
        .map(|(key, _)| key.clone())
        .collect()
}

// =============================================================================
// Queued Write
// =============================================================================

/// A write that could not reach the gateway and waits for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct QueuedWrite {
    /// Unique id (UUID v4).
    pub id: String,

    /// Resource path the write targets (e.g. `sessions/abc/messages`).
    pub key: String,

    /// JSON body of the write.
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,

    /// When the write was first queued.
    #[ts(as = "String")]
    pub enqueued_at: DateTime<Utc>,

    /// Failed replays so far.
    #[serde(default)]
    pub attempts: u32,

    /// Reason of the last failed replay.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedWrite {
    /// Creates a fresh write record.
    pub fn new(key: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        QueuedWrite {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            payload,
            enqueued_at: now,
            attempts: 0,
            last_error: None,
        }
    }

    /// Records a failed replay.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert!(Priority::High.persists());
        assert!(!Priority::Normal.persists());
        assert!(!Priority::Low.promotes());
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_class_for_key() {
        assert_eq!(ResourceClass::for_key("sessions:list"), Some(ResourceClass::Sessions));
        assert_eq!(ResourceClass::for_key("cron:jobs"), Some(ResourceClass::CronJobs));
        assert_eq!(ResourceClass::for_key("health"), Some(ResourceClass::SystemHealth));
        assert_eq!(ResourceClass::for_key("models"), None);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let now = Utc::now();
        let entry = CacheEntry::new(1, now, Duration::ZERO, Priority::Normal, BTreeSet::new());
        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired(now + TimeDelta::days(365)));
    }

    #[test]
    fn test_expiry_boundaries() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "v",
            now,
            Duration::from_millis(100),
            Priority::Normal,
            BTreeSet::new(),
        );

        assert!(!entry.is_expired(now + TimeDelta::milliseconds(99)));
        assert!(entry.is_expired(now + TimeDelta::milliseconds(100)));
        assert!(entry.is_expired(now + TimeDelta::milliseconds(150)));

        assert!(!entry.is_expired_beyond(now + TimeDelta::milliseconds(150), Duration::from_secs(1)));
        assert!(entry.is_expired_beyond(now + TimeDelta::milliseconds(150), Duration::ZERO));
    }

    #[test]
    fn test_scope_matches_tag_or_prefix() {
        let entry = CacheEntry::new((), Utc::now(), Duration::ZERO, Priority::Normal, tags(&["cron"]));
        assert!(entry.in_scope("jobs:list", "cron"));
        assert!(entry.in_scope("sessions:list", "sessions"));
        assert!(!entry.in_scope("agents:list", "sessions"));
        assert!(entry.has_any_tag(&["x", "cron"]));
    }

    #[test]
    fn test_low_priority_evicted_before_older_critical() {
        let base = Utc::now();
        let mut entries = HashMap::new();
        // Low entry is the newest, critical entries are older
        for i in 0..3 {
            entries.insert(
                format!("c{}", i),
                CacheEntry::new(
                    i,
                    base + TimeDelta::seconds(i),
                    Duration::ZERO,
                    Priority::Critical,
                    BTreeSet::new(),
                ),
            );
        }
        entries.insert(
            "low".to_string(),
            CacheEntry::new(9, base + TimeDelta::seconds(10), Duration::ZERO, Priority::Low, BTreeSet::new()),
        );

        let victims = select_evictions(entries.iter(), 3);
        assert_eq!(victims, vec!["low".to_string()]);

        let victims = select_evictions(entries.iter(), 2);
        assert_eq!(victims, vec!["low".to_string(), "c0".to_string()]);

        assert!(select_evictions(entries.iter(), 10).is_empty());
    }

    #[test]
    fn test_entry_json_layout() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            serde_json::json!({"a": 1}),
            now,
            Duration::from_secs(30),
            Priority::High,
            tags(&["sessions"]),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("writtenAt").is_some());
        assert!(json.get("expiresAt").is_some());
        assert_eq!(json["priority"], "high");
        assert_eq!(json["tags"][0], "sessions");

        let back: CacheEntry<serde_json::Value> = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_queued_write_failure_tracking() {
        let mut write = QueuedWrite::new("sessions/a/messages", serde_json::json!({"text": "hi"}), Utc::now());
        assert_eq!(write.attempts, 0);
        write.record_failure("503");
        write.record_failure("timeout");
        assert_eq!(write.attempts, 2);
        assert_eq!(write.last_error.as_deref(), Some("timeout"));
    }
}
