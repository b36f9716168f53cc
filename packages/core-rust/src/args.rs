//! Positional and keyword arguments handed to a worker invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arguments a trigger passes to the method it fires.
///
/// Entrypoints build these: a console line becomes one positional string, a
/// broadcast event becomes one positional payload object, and a once-entrypoint
/// carries whatever fixed arguments it was configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerArgs {
    /// Positional arguments, in call order.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments, in insertion order.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl WorkerArgs {
    /// No arguments at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds positional-only arguments.
    #[must_use]
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    /// Adds a keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument at `index`, if any.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Positional argument at `index` as a string slice.
    #[must_use]
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.arg(index).and_then(Value::as_str)
    }

    /// Positional argument at `index` as an object map.
    #[must_use]
    pub fn arg_object(&self, index: usize) -> Option<&Map<String, Value>> {
        self.arg(index).and_then(Value::as_object)
    }

    /// Keyword argument by name.
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn positional_accessors() {
        let args = WorkerArgs::positional(["alice"]);
        assert_eq!(args.arg_str(0), Some("alice"));
        assert_eq!(args.arg_str(1), None);
        assert!(args.arg_object(0).is_none());
    }

    #[test]
    fn object_argument() {
        let args = WorkerArgs::positional([json!({ "author": "a", "msg": "hi" })]);
        let payload = args.arg_object(0).unwrap();
        assert_eq!(payload.get("msg"), Some(&json!("hi")));
    }

    #[test]
    fn kwargs_by_name() {
        let args = WorkerArgs::empty().with_kwarg("greeting", "hello");
        assert!(args.args.is_empty());
        assert_eq!(args.kwarg("greeting"), Some(&json!("hello")));
        assert_eq!(args.kwarg("missing"), None);
    }
}
