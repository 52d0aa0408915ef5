use crate::dispatch::WorkerTerminated;
use std::error::Error;
use std::fmt;

/// A closed set of canonical error tags for one subsystem.
///
/// The `Display` impl of a tag renders its canonical kebab-case name, e.g.
/// `not-permitted`.
pub trait ErrorTag: fmt::Debug + fmt::Display + Clone + Send + Sync + 'static {
    /// The tag reported for failures that have no more specific mapping,
    /// including a crash of the subsystem's background worker.
    fn fallback() -> Self;
}

/// An error carrying one tag of a closed taxonomy plus optional auxiliary
/// data.
///
/// This is the Rust shape of the `{ tag, val? }` error payload: `code` is the
/// tag and `detail` carries the human-readable extra data, usually the
/// original OS message when the tag is a fallback.
#[derive(Clone, PartialEq, Eq)]
pub struct TaggedError<C> {
    code: C,
    detail: Option<String>,
}

impl<C: ErrorTag> TaggedError<C> {
    pub fn new(code: C) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: C, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    /// The fallback tag with `detail` attached.
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::with_detail(C::fallback(), detail)
    }

    pub fn code(&self) -> &C {
        &self.code
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn into_code(self) -> C {
        self.code
    }
}

impl<C: ErrorTag> From<C> for TaggedError<C> {
    fn from(code: C) -> Self {
        Self::new(code)
    }
}

impl<C: ErrorTag> From<WorkerTerminated> for TaggedError<C> {
    fn from(err: WorkerTerminated) -> Self {
        Self::with_detail(C::fallback(), err.to_string())
    }
}

impl<C: fmt::Debug> fmt::Debug for TaggedError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TaggedError");
        s.field("code", &self.code);
        if let Some(detail) = &self.detail {
            s.field("detail", detail);
        }
        s.finish()
    }
}

impl<C: fmt::Display> fmt::Display for TaggedError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl<C: fmt::Debug + fmt::Display> Error for TaggedError<C> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    enum Tag {
        #[error("unknown")]
        Unknown,
        #[error("invalid-state")]
        InvalidState,
    }

    impl ErrorTag for Tag {
        fn fallback() -> Self {
            Tag::Unknown
        }
    }

    #[test]
    fn display_renders_tag_and_detail() {
        let e = TaggedError::new(Tag::InvalidState);
        assert_eq!(e.to_string(), "invalid-state");
        let e = TaggedError::<Tag>::unknown("boom");
        assert_eq!(e.to_string(), "unknown: boom");
        assert_eq!(e.detail(), Some("boom"));
    }

    #[test]
    fn worker_termination_maps_to_fallback() {
        let e = TaggedError::<Tag>::from(WorkerTerminated::new("sockets", "panicked"));
        assert_eq!(*e.code(), Tag::Unknown);
        assert!(e.detail().unwrap().contains("panicked"));
    }
}
