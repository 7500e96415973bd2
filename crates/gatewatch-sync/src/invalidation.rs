//! # Cache Invalidation Router
//!
//! Applies the cache effect of each inbound event before it is published.
//!
//! | event               | effect                                              |
//! |---------------------|-----------------------------------------------------|
//! | `session_update`    | merge `data.session` into cached copies of the session |
//! | `session_created`   | purge scope `sessions`                              |
//! | `session_ended`     | purge scope `sessions`                              |
//! | `message_sent`      | set `messageCount` on cached copies of the session  |
//! | `cron_triggered`    | purge scope `cron`                                  |
//! | `agent_status`      | none                                                |
//!
//! A cached copy of a session is an object whose `key` or `sessionKey`
//! equals `data.sessionKey`. It may sit at the top level of an entry, inside
//! an array, or inside a `sessions` array of an object.

use serde_json::{Map, Value};
use tracing::debug;

use gatewatch_core::cache::ResourceClass;
use gatewatch_core::event::{RealtimeEvent, RealtimeEventType};
use gatewatch_store::TieredCache;

/// What an event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEffect {
    /// Entries patched in place.
    Patched(usize),
    /// Entries removed.
    Purged(usize),
    /// Nothing to do.
    Untouched,
}

/// Routes events to cache mutations.
#[derive(Debug, Clone)]
pub struct EventRouter {
    cache: TieredCache,
}

impl EventRouter {
    /// Creates a router over `cache`.
    pub fn new(cache: TieredCache) -> Self {
        EventRouter { cache }
    }

    /// Applies the cache effect of `event`.
    pub async fn apply(&self, event: &RealtimeEvent) -> CacheEffect {
        let sessions = ResourceClass::Sessions.tag();

        let effect = match event.kind {
            RealtimeEventType::SessionUpdate => {
                match (&event.data.session_key, event.data.session.as_ref().and_then(Value::as_object)) {
                    (Some(key), Some(fields)) => {
                        let patched = self
                            .cache
                            .update_matching(sessions, |_, value| {
                                patch_session(value, key, &mut |session| merge_fields(session, fields))
                            })
                            .await;
                        CacheEffect::Patched(patched)
                    }
                    // Nothing precise to merge: drop what might be stale.
                    _ => CacheEffect::Purged(self.cache.invalidate(sessions).await),
                }
            }
            RealtimeEventType::SessionCreated | RealtimeEventType::SessionEnded => {
                CacheEffect::Purged(self.cache.invalidate(sessions).await)
            }
            RealtimeEventType::MessageSent => match &event.data.session_key {
                Some(key) => {
                    let count = event.data.message_count;
                    let patched = self
                        .cache
                        .update_matching(sessions, |_, value| {
                            patch_session(value, key, &mut |session| set_message_count(session, count))
                        })
                        .await;
                    CacheEffect::Patched(patched)
                }
                None => CacheEffect::Untouched,
            },
            RealtimeEventType::CronTriggered => {
                CacheEffect::Purged(self.cache.invalidate(ResourceClass::CronJobs.tag()).await)
            }
            RealtimeEventType::AgentStatus => CacheEffect::Untouched,
        };

        debug!(event_type = %event.kind, ?effect, "Applied cache effect");
        effect
    }
}

// =============================================================================
// Session Patching
// =============================================================================

fn is_session(object: &Map<String, Value>, key: &str) -> bool {
    ["key", "sessionKey"]
        .iter()
        .any(|field| object.get(*field).and_then(Value::as_str) == Some(key))
}

/// Finds copies of session `key` in `value` and applies `patch` to each.
/// Returns true if any copy changed.
fn patch_session(
    value: &mut Value,
    key: &str,
    patch: &mut dyn FnMut(&mut Map<String, Value>) -> bool,
) -> bool {
    match value {
        Value::Object(object) if is_session(object, key) => patch(object),
        Value::Object(object) => match object.get_mut("sessions") {
            Some(nested) => patch_session(nested, key, patch),
            None => false,
        },
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= patch_session(item, key, patch);
            }
            changed
        }
        _ => false,
    }
}

fn merge_fields(session: &mut Map<String, Value>, fields: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (name, value) in fields {
        if session.get(name) != Some(value) {
            session.insert(name.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Sets `messageCount`, or increments it when the event carries no count.
fn set_message_count(session: &mut Map<String, Value>, count: Option<u64>) -> bool {
    let next = match count {
        Some(count) => count,
        None => session
            .get("messageCount")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1,
    };
    let next = Value::from(next);
    if session.get("messageCount") == Some(&next) {
        return false;
    }
    session.insert("messageCount".to_string(), next);
    true
}
