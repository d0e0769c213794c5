//! Exception codec: converts native errors to a storable [`ErrorRecord`] and
//! back.
//!
//! Decoding is driven by a closed registry. Application error types opt in by
//! implementing [`TaskFailure`] and being registered with
//! [`ErrorCodec::register`]; the stored `kind` tag is only ever looked up in
//! that registry, never resolved to a type any other way. Unregistered kinds
//! decode to [`GenericFailure`], which keeps the kind, message, code, and cause
//! chain intact.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{GENERIC_FAILURE_KIND, MAX_CAUSE_DEPTH};
use crate::error::BoxError;

/// Serializable description of a task failure.
///
/// # Examples
///
/// ```
/// use taskfuture::ErrorRecord;
///
/// let record = ErrorRecord::new("Timeout", "upstream timeout", 504)
///     .with_cause(ErrorRecord::new("Error", "connection reset", 0));
///
/// let json = serde_json::to_value(&record).unwrap();
/// assert_eq!(json["kind"], "Timeout");
/// assert_eq!(json["cause"]["message"], "connection reset");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Registry tag naming the failure type.
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Application error code (0 when the type has none).
    #[serde(default)]
    pub code: i64,

    /// Debug rendering captured at encode time.
    #[serde(default)]
    pub trace: String,

    /// The error that caused this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    /// Creates a record with no trace and no cause.
    pub fn new(kind: impl Into<String>, message: impl Into<String>, code: i64) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code,
            trace: String::new(),
            cause: None,
        }
    }

    /// Attaches a cause (builder pattern).
    pub fn with_cause(mut self, cause: ErrorRecord) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attaches a trace (builder pattern).
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    /// Number of records in the chain, including this one.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |c| c.depth())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ErrorRecord {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
    }
}

/// An application error type that round-trips through the codec as itself.
///
/// # Examples
///
/// ```
/// use taskfuture::codec::{ErrorCodec, ErrorRecord, TaskFailure};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("{0}")]
/// struct UpstreamTimeout(String);
///
/// impl TaskFailure for UpstreamTimeout {
///     const KIND: &'static str = "Timeout";
///
///     fn code(&self) -> i64 {
///         504
///     }
///
///     fn from_record(record: &ErrorRecord) -> Self {
///         Self(record.message.clone())
///     }
/// }
///
/// let mut codec = ErrorCodec::new();
/// codec.register::<UpstreamTimeout>();
///
/// let record = codec.encode(&UpstreamTimeout("upstream timeout".into()));
/// assert_eq!((record.kind.as_str(), record.code), ("Timeout", 504));
///
/// let decoded = codec.decode(&record);
/// assert!(decoded.downcast_ref::<UpstreamTimeout>().is_some());
/// ```
pub trait TaskFailure: Error + Send + Sync + 'static {
    /// Stable registry tag stored in [`ErrorRecord::kind`].
    const KIND: &'static str;

    /// Application error code.
    fn code(&self) -> i64 {
        0
    }

    /// Rebuilds the native error from its stored record.
    fn from_record(record: &ErrorRecord) -> Self
    where
        Self: Sized;
}

#[derive(Clone, Copy)]
struct Registration {
    code_of: fn(&(dyn Error + 'static)) -> Option<i64>,
    rebuild: fn(&ErrorRecord) -> BoxError,
}

fn code_of<E: TaskFailure>(err: &(dyn Error + 'static)) -> Option<i64> {
    err.downcast_ref::<E>().map(TaskFailure::code)
}

fn rebuild<E: TaskFailure>(record: &ErrorRecord) -> BoxError {
    Box::new(E::from_record(record))
}

/// Registry-driven encoder/decoder for task failures.
///
/// Build one at startup, register every failure type the application wants
/// back natively, and share it behind an `Arc`.
#[derive(Clone, Default)]
pub struct ErrorCodec {
    kinds: HashMap<&'static str, Registration>,
}

impl fmt::Debug for ErrorCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("ErrorCodec").field("kinds", &kinds).finish()
    }
}

impl ErrorCodec {
    /// Creates an empty registry. Every kind decodes to [`GenericFailure`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E` under [`TaskFailure::KIND`], replacing any earlier
    /// registration for that tag.
    pub fn register<E: TaskFailure>(&mut self) -> &mut Self {
        self.kinds.insert(
            E::KIND,
            Registration {
                code_of: code_of::<E>,
                rebuild: rebuild::<E>,
            },
        );
        self
    }

    /// Returns `true` if `kind` decodes to a native type.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Encodes an error and its cause chain.
    ///
    /// Records (and [`GenericFailure`]s wrapping one) pass through unchanged.
    pub fn encode(&self, err: &(dyn Error + 'static)) -> ErrorRecord {
        self.encode_at(err, 1)
    }

    fn encode_at(&self, err: &(dyn Error + 'static), depth: usize) -> ErrorRecord {
        if let Some(record) = err.downcast_ref::<ErrorRecord>() {
            return record.clone();
        }
        if let Some(generic) = err.downcast_ref::<GenericFailure>() {
            return generic.0.clone();
        }

        let (kind, code) = self
            .kinds
            .iter()
            .find_map(|(kind, reg)| (reg.code_of)(err).map(|code| (*kind, code)))
            .unwrap_or((GENERIC_FAILURE_KIND, 0));

        let cause = if depth < MAX_CAUSE_DEPTH {
            err.source()
                .map(|source| Box::new(self.encode_at(source, depth + 1)))
        } else {
            None
        };

        ErrorRecord {
            kind: kind.to_string(),
            message: err.to_string(),
            code,
            trace: format!("{err:?}"),
            cause,
        }
    }

    /// Reconstructs the native error for `record`, or a [`GenericFailure`]
    /// when its kind is not registered.
    pub fn decode(&self, record: &ErrorRecord) -> BoxError {
        match self.kinds.get(record.kind.as_str()) {
            Some(reg) => (reg.rebuild)(record),
            None => Box::new(GenericFailure(record.clone())),
        }
    }
}

/// Fallback error for failure kinds the codec does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericFailure(ErrorRecord);

impl GenericFailure {
    /// The stored kind tag.
    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    /// The stored error code.
    pub fn code(&self) -> i64 {
        self.0.code
    }

    /// The stored message.
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// The full record, including trace and cause chain.
    pub fn record(&self) -> &ErrorRecord {
        &self.0
    }
}

impl From<ErrorRecord> for GenericFailure {
    fn from(record: ErrorRecord) -> Self {
        Self(record)
    }
}

impl fmt::Display for GenericFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.message)
    }
}

impl Error for GenericFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}
