//! Value transforms applied to objects before they are committed to a store.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

type TransformFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A pure mapping from a stored object to a (possibly different) stored
/// object, or a failure. Cheap to clone; the default value is the absent
/// transform, which leaves objects untouched.
#[derive(Clone, Default)]
pub struct Transform(Option<TransformFn>);

impl Transform {
    pub fn new(f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn apply(&self, value: Value) -> Result<Value> {
        match &self.0 {
            Some(f) => f(value),
            None => Ok(value),
        }
    }

    /// Compose two stacked transforms. The inherited one always runs first;
    /// the current one only sees its successful output.
    pub fn chain(inherited: &Transform, current: &Transform) -> Transform {
        match (&inherited.0, &current.0) {
            (None, _) => current.clone(),
            (_, None) => inherited.clone(),
            (Some(a), Some(b)) => {
                let (a, b) = (Arc::clone(a), Arc::clone(b));
                Transform(Some(Arc::new(move |v| b(a(v)?))))
            }
        }
    }

    /// Drop `metadata.managedFields` before storage; it is large and almost
    /// never read back.
    pub fn strip_managed_fields() -> Self {
        Self::new(|mut v| {
            if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                obj.remove("managedFields");
            }
            Ok(v)
        })
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Transform(fn)"),
            None => f.write_str("Transform(none)"),
        }
    }
}
