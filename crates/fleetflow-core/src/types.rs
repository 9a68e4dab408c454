use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A unit of data carried by calls and responses
///
/// This is a wrapper around a JSON value with helper methods for
/// converting to and from typed values at the protocol boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl Payload {
    /// Create a new payload from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create an empty (null) payload
    #[inline]
    pub fn empty() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_null()
    }

    /// Try to view the payload as a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to view the payload as an object
    #[inline]
    pub fn as_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.value.as_object()
    }

    /// Deserialize the payload into a concrete type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Build a payload from any serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Build a string payload
    #[inline]
    pub fn from_string(s: &str) -> Self {
        Self::new(serde_json::Value::String(s.to_string()))
    }
}

/// Priority tier of a message or notification
///
/// Higher tiers are drained first by the worker loop. Within one tier
/// no ordering is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Background work, drained last
    Low,
    /// Regular work
    Medium,
    /// Urgent work, drained before everything else
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Cumulative resource consumption reported for a flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time consumed, in seconds
    pub cpu_seconds: f64,
    /// Bytes sent and received over the network
    pub network_bytes: u64,
    /// Wall-clock runtime, in seconds
    pub runtime_seconds: f64,
}

impl ResourceUsage {
    /// Accumulate another usage report into this one
    pub fn add(&mut self, other: &ResourceUsage) {
        self.cpu_seconds += other.cpu_seconds;
        self.network_bytes = self.network_bytes.saturating_add(other.network_bytes);
        self.runtime_seconds += other.runtime_seconds;
    }
}

/// Optional budgets a flow's cumulative usage is checked against
///
/// A `None` field means that budget is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum CPU seconds
    pub cpu_seconds: Option<f64>,
    /// Maximum network bytes
    pub network_bytes: Option<u64>,
    /// Maximum wall-clock runtime in seconds
    pub runtime_seconds: Option<f64>,
}

impl ResourceLimits {
    /// Budgets are all unlimited
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Check usage against the configured budgets
    ///
    /// Returns the name of the first breached budget, or `None` if all
    /// budgets hold.
    pub fn check(&self, usage: &ResourceUsage) -> Option<&'static str> {
        if let Some(limit) = self.cpu_seconds {
            if usage.cpu_seconds > limit {
                return Some("cpu");
            }
        }
        if let Some(limit) = self.network_bytes {
            if usage.network_bytes > limit {
                return Some("network");
            }
        }
        if let Some(limit) = self.runtime_seconds {
            if usage.runtime_seconds > limit {
                return Some("runtime");
            }
        }
        None
    }
}
