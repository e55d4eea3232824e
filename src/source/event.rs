use std::fmt;
use std::sync::Arc;

/// Maximum byte length of an event name or category.
pub const MAX_NAME_LEN: usize = 255;

/// Value attached to a trace event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Numeric(f64),
    Text(Arc<str>),
    None,
}

impl Payload {
    /// Canonical numeric form: NaN becomes 0.0, infinities clamp to the finite range.
    pub fn normalized(self) -> Self {
        match self {
            Self::Numeric(v) => Self::Numeric(canonical_f64(v)),
            other => other,
        }
    }

    /// Returns the label used in logs and text output.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "text",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::None => f.write_str("-"),
        }
    }
}

/// A single trace event pushed by the host application.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub name: Arc<str>,
    pub category: Arc<str>,
    /// Wall-clock nanoseconds since the UNIX epoch.
    pub timestamp_ns: u64,
    /// Scope length for begin/end pairs, 0 for instantaneous events.
    pub duration_ns: u64,
    pub value: Payload,
    pub thread_id: u32,
}

impl RawEvent {
    /// Creates an instantaneous event with no payload.
    pub fn new(name: impl Into<Arc<str>>, category: impl Into<Arc<str>>, timestamp_ns: u64) -> Self {
        Self {
            name: bounded_name(name.into()),
            category: bounded_name(category.into()),
            timestamp_ns,
            duration_ns: 0,
            value: Payload::None,
            thread_id: 0,
        }
    }

    /// Creates an event carrying a numeric sample.
    pub fn numeric(
        name: impl Into<Arc<str>>,
        category: impl Into<Arc<str>>,
        timestamp_ns: u64,
        value: f64,
    ) -> Self {
        Self::new(name, category, timestamp_ns).with_value(Payload::Numeric(value))
    }

    pub fn with_value(mut self, value: Payload) -> Self {
        self.value = value.normalized();
        self
    }

    pub fn with_duration(mut self, duration_ns: u64) -> Self {
        self.duration_ns = duration_ns;
        self
    }

    pub fn with_thread(mut self, thread_id: u32) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// The sample fed into window statistics.
    ///
    /// Numeric payloads contribute their value. Scoped events without a value
    /// contribute their duration in milliseconds. Everything else counts as a
    /// single occurrence (1.0).
    pub fn sample_value(&self) -> f64 {
        match &self.value {
            Payload::Numeric(v) => *v,
            Payload::None if self.duration_ns > 0 => self.duration_ns as f64 / 1_000_000.0,
            Payload::None | Payload::Text(_) => 1.0,
        }
    }
}

/// Canonicalizes a float for aggregation and encoding.
pub fn canonical_f64(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else if v == f64::INFINITY {
        f64::MAX
    } else if v == f64::NEG_INFINITY {
        f64::MIN
    } else {
        v
    }
}

/// Truncates a name to `MAX_NAME_LEN` bytes on a char boundary.
pub fn bounded_name(name: Arc<str>) -> Arc<str> {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Arc::from(&name[..end])
}
