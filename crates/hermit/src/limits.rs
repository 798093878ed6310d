//! Resource limits for workspace command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits for workspace command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum CPU time in milliseconds (enforced with `RLIMIT_CPU`, rounded up to seconds)
    pub max_cpu_ms: u64,
    /// Maximum address space in bytes (enforced with `RLIMIT_AS`, 0 disables)
    pub max_memory_bytes: u64,
    /// Maximum captured output per stream in bytes
    pub max_output_bytes: u64,
    /// Maximum size of a single file read or written through the file store
    pub max_file_bytes: u64,
    /// Default wall-clock timeout when a request does not name one
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Upper bound for any requested timeout
    #[serde(with = "duration_ms")]
    pub max_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_ms: 300_000,                 // 5 minutes CPU
            max_memory_bytes: 0,                 // unlimited unless configured
            max_output_bytes: 1024 * 1024,       // 1 MB output
            max_file_bytes: 10 * 1024 * 1024,    // 10 MB files
            timeout: Duration::from_secs(30),    // 30 second wall clock
            max_timeout: Duration::from_secs(300), // long operations
        }
    }
}

impl ResourceLimits {
    /// Pick the effective timeout for a request.
    ///
    /// `None` falls back to the default; anything above `max_timeout` is
    /// clamped down to it. A zero request is treated as "use the default".
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_timeout),
            _ => self.timeout.min(self.max_timeout),
        }
    }

    /// CPU limit in whole seconds for `RLIMIT_CPU`, `None` when disabled.
    pub fn cpu_seconds(&self) -> Option<u64> {
        (self.max_cpu_ms > 0).then(|| self.max_cpu_ms.div_ceil(1000))
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Same as [`duration_ms`] for optional durations.
pub(crate) mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Output capture with a byte cap.
///
/// Bytes past the cap are dropped and remembered as truncation; the final
/// output ends with a marker so readers can tell.
#[derive(Debug, Clone)]
pub(crate) struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append what fits and return the part that was kept.
    pub(crate) fn push(&mut self, data: &[u8]) -> &[u8] {
        let start = self.buffer.len();
        let room = self.limit.saturating_sub(start);
        let keep = data.len().min(room);
        if keep < data.len() {
            self.truncated = true;
        }
        self.buffer.extend_from_slice(&data[..keep]);
        &self.buffer[start..]
    }

    pub(crate) fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn into_bytes(mut self) -> Vec<u8> {
        if self.truncated {
            self.buffer.extend_from_slice(TRUNCATION_MARKER);
        }
        self.buffer
    }
}

const TRUNCATION_MARKER: &[u8] = b"\n... [output truncated] ...\n";

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();

        assert_eq!(limits.max_output_bytes, 1024 * 1024);
        assert_eq!(limits.timeout, Duration::from_secs(30));
        assert_eq!(limits.max_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_limits_serialization_format() {
        let limits = ResourceLimits {
            timeout: Duration::from_millis(5000),
            ..ResourceLimits::default()
        };

        let json = serde_json::to_string(&limits).unwrap();

        // Timeouts are serialized as milliseconds
        assert!(json.contains("\"timeout\":5000"));
        assert!(json.contains("\"max_timeout\":300000"));
    }

    #[test]
    fn test_partial_limits_deserialize_with_defaults() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"timeout": 1000}"#).unwrap();
        assert_eq!(limits.timeout, Duration::from_secs(1));
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
    }

    #[test]
    fn test_effective_timeout_clamps() {
        let limits = ResourceLimits::default();

        assert_eq!(limits.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(
            limits.effective_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            limits.effective_timeout(Some(Duration::from_secs(3600))),
            Duration::from_secs(300)
        );
        assert_eq!(
            limits.effective_timeout(Some(Duration::ZERO)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_cpu_seconds_rounds_up() {
        let limits = ResourceLimits {
            max_cpu_ms: 1500,
            ..ResourceLimits::default()
        };
        assert_eq!(limits.cpu_seconds(), Some(2));

        let disabled = ResourceLimits {
            max_cpu_ms: 0,
            ..ResourceLimits::default()
        };
        assert_eq!(disabled.cpu_seconds(), None);
    }

    #[test]
    fn test_limited_buffer_keeps_everything_under_cap() {
        let mut buffer = LimitedBuffer::new(100);
        assert_eq!(buffer.push(b"hello "), b"hello ");
        assert_eq!(buffer.push(b"world"), b"world");
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.into_bytes(), b"hello world");
    }

    #[test]
    fn test_limited_buffer_returns_only_kept_bytes() {
        let mut buffer = LimitedBuffer::new(8);
        assert_eq!(buffer.push(b"12345"), b"12345");
        assert_eq!(buffer.push(b"67890"), b"678");
        assert_eq!(buffer.push(b"more"), b"");
        assert!(buffer.was_truncated());

        let content = String::from_utf8(buffer.into_bytes()).unwrap();
        assert!(content.starts_with("12345678\n"));
        assert!(content.ends_with("[output truncated] ...\n"));
    }

    #[test]
    fn test_limited_buffer_empty_push_at_cap_is_not_truncation() {
        let mut buffer = LimitedBuffer::new(0);
        assert!(buffer.push(b"").is_empty());
        assert!(!buffer.was_truncated());
    }
}
