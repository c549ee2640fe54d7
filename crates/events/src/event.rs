use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "pipeline.step_started").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the event body for persistence.
    ///
    /// The body must not repeat the type tag; `event_type()` is stored next to it
    /// and is what decoding dispatches on.
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error>;
}
