//! Listener failure model.
//!
//! Handlers report failures as a [`ListenerFailure`]: a kind name, a message,
//! and an optional cause chain. Classification and dead-letter routing operate
//! on kind names, so a kind is the unit a configuration includes, excludes, or
//! routes.

use std::fmt;

/// Well-known failure kinds.
pub mod kinds {
    /// Payload could not be deserialized.
    pub const DESERIALIZATION: &str = "DeserializationError";
    /// Payload could not be converted to the handler's input type.
    pub const MESSAGE_CONVERSION: &str = "MessageConversionError";
    /// A value conversion failed inside the handler adapter.
    pub const CONVERSION: &str = "ConversionError";
    /// A handler argument could not be resolved from the record.
    pub const METHOD_ARGUMENT_RESOLUTION: &str = "MethodArgumentResolutionError";
    /// No handler matched the record's payload type.
    pub const NO_SUCH_METHOD: &str = "NoSuchMethodError";
    /// The payload was of an unexpected type.
    pub const CLASS_CAST: &str = "ClassCastError";
    /// A record arrived on a retry or DLT destination without its retry headers.
    pub const MISSING_RETRY_HEADERS: &str = "MissingRetryHeaders";
}

/// A failure raised while processing a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    kind: String,
    message: String,
    cause: Option<Box<ListenerFailure>>,
}

impl ListenerFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Build a failure from any error, using the error's type name as kind.
    ///
    /// Sources are folded into the cause chain with kind `"source"`, since
    /// their concrete types are erased behind `dyn Error`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let kind = short_type_name(std::any::type_name::<E>());
        let mut failure = Self::new(kind, error.to_string());

        let mut source = error.source();
        while let Some(s) = source {
            failure = failure.push_root_cause(Self::new("source", s.to_string()));
            source = s.source();
        }
        failure
    }

    /// Attach `cause` as the direct cause of this failure.
    pub fn caused_by(mut self, cause: ListenerFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ListenerFailure> {
        self.cause.as_deref()
    }

    /// Iterate this failure followed by its causes, outermost first.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(self),
        }
    }

    /// Kind names of the whole chain, outermost first.
    pub fn chain_kinds(&self) -> Vec<&str> {
        self.chain().map(|f| f.kind()).collect()
    }

    fn push_root_cause(mut self, root: ListenerFailure) -> Self {
        self.cause = Some(Box::new(match self.cause.take() {
            Some(cause) => cause.push_root_cause(root),
            None => root,
        }));
        self
    }
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ListenerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Iterator over a failure's cause chain.
pub struct Chain<'a> {
    next: Option<&'a ListenerFailure>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a ListenerFailure;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.cause();
        Some(current)
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failed")]
    struct OuterError {
        #[source]
        inner: InnerError,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner failed")]
    struct InnerError;

    #[test]
    fn test_chain_order() {
        let failure = ListenerFailure::new("Outer", "a")
            .caused_by(ListenerFailure::new("Middle", "b").caused_by(ListenerFailure::new("Root", "c")));

        assert_eq!(failure.chain_kinds(), vec!["Outer", "Middle", "Root"]);
    }

    #[test]
    fn test_from_error_uses_short_type_name() {
        let err = OuterError { inner: InnerError };
        let failure = ListenerFailure::from_error(&err);

        assert_eq!(failure.kind(), "OuterError");
        assert_eq!(failure.message(), "outer failed");
        let cause = failure.cause().expect("source should become a cause");
        assert_eq!(cause.message(), "inner failed");
    }

    #[test]
    fn test_display_includes_causes() {
        let failure =
            ListenerFailure::new("Timeout", "db slow").caused_by(ListenerFailure::new("Io", "reset"));
        assert_eq!(failure.to_string(), "Timeout: db slow (caused by Io: reset)");
    }
}
