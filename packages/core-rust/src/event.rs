//! Broadcast events and subscription filters.
//!
//! An `Event` is a type tag plus an ordered payload map. The wire shape is
//! `{ "type": <string>, "data": { ... } }`. Consumers read payload fields by
//! name and must treat a missing field as absent rather than as an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered payload of named fields carried by an event.
pub type Payload = Map<String, Value>;

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Type tag. Decides which broadcast entrypoints are eligible to fire.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Named payload fields, in insertion order.
    #[serde(default)]
    pub data: Payload,
}

impl Event {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Payload::new(),
        }
    }

    /// Adds a field to the payload, replacing any previous value under `name`.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// Returns the raw value of a payload field, or `None` if it is missing.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Returns a payload field as a string slice.
    ///
    /// Missing fields and non-string values both yield `None`.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        field_str(&self.data, name)
    }
}

/// Reads a string field from a payload map. Missing or non-string fields are `None`.
#[must_use]
pub fn field_str<'a>(payload: &'a Payload, name: &str) -> Option<&'a str> {
    payload.get(name).and_then(Value::as_str)
}

/// Subscriber-side filter applied to every event delivered on a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events with this type tag pass. `None` accepts every type.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event_type: Option<String>,
}

impl EventFilter {
    /// A filter that accepts every event.
    #[must_use]
    pub fn any() -> Self {
        Self { event_type: None }
    }

    /// A filter that accepts only events tagged `event_type`.
    #[must_use]
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
        }
    }

    /// Returns `true` if `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |wanted| wanted == event.event_type)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_shape_uses_type_and_data() {
        let event = Event::new("message")
            .with_field("author", "a")
            .with_field("msg", "hi");

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "message", "data": { "author": "a", "msg": "hi" } })
        );
    }

    #[test]
    fn payload_keeps_insertion_order() {
        let event = Event::new("message")
            .with_field("zeta", 1)
            .with_field("alpha", 2);

        let keys: Vec<&str> = event.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn missing_data_decodes_as_empty_payload() {
        let event: Event = serde_json::from_value(json!({ "type": "message" })).unwrap();
        assert!(event.data.is_empty());
        assert_eq!(event.field_str("author"), None);
    }

    #[test]
    fn non_string_field_is_absent_as_str() {
        let event = Event::new("message").with_field("msg", 42);
        assert_eq!(event.field_str("msg"), None);
        assert_eq!(event.field("msg"), Some(&json!(42)));
    }

    #[test]
    fn filter_by_type() {
        let message = Event::new("message");
        let other = Event::new("presence");

        let filter = EventFilter::of_type("message");
        assert!(filter.matches(&message));
        assert!(!filter.matches(&other));

        assert!(EventFilter::any().matches(&other));
    }

    proptest! {
        #[test]
        fn absent_fields_never_panic(
            present in "[a-z]{1,8}",
            probe in "[a-z]{1,8}",
            value in ".*",
        ) {
            let event = Event::new("message").with_field(present.clone(), value.clone());
            let got = event.field_str(&probe);
            if probe == present {
                prop_assert_eq!(got, Some(value.as_str()));
            } else {
                prop_assert_eq!(got, None);
            }
        }
    }
}
