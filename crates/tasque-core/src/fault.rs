use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Error carried on the failure channel of a [`Task`](crate::Task).
///
/// A `Fault` is cheap to clone (payloads live behind `Arc`) because the same
/// failure may be broadcast to several subscribers of a memoized task or
/// re-observed across retries.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Fault {
    /// A plain, message-only failure.
    #[error("{0}")]
    Message(Arc<str>),
    /// A failure wrapping an underlying error value.
    #[error(transparent)]
    Source(Arc<dyn Error + Send + Sync + 'static>),
    /// A panic captured from a user-supplied closure.
    #[error("panicked: {0}")]
    Panicked(Arc<str>),
}

impl Fault {
    /// Builds a message-only fault.
    pub fn message(message: impl Into<String>) -> Self {
        Fault::Message(Arc::from(message.into()))
    }

    /// Wraps an arbitrary error value.
    pub fn source(error: impl Error + Send + Sync + 'static) -> Self {
        Fault::Source(Arc::new(error))
    }

    /// Returns true when this fault was produced by a panicking closure.
    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panicked(_))
    }

    /// Converts a payload caught by `catch_unwind` into a fault.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Fault::Panicked(Arc::from(text))
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::message(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_displays_verbatim() {
        let fault = Fault::message("boom");
        assert_eq!(fault.to_string(), "boom");
        assert!(!fault.is_panic());
    }

    #[test]
    fn panic_payloads_keep_their_text() {
        let fault = Fault::from_panic(Box::new("ouch"));
        assert_eq!(fault.to_string(), "panicked: ouch");
        assert!(fault.is_panic());

        let fault = Fault::from_panic(Box::new(String::from("ow")));
        assert_eq!(fault.to_string(), "panicked: ow");
    }

    #[test]
    fn sources_are_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let fault = Fault::source(io);
        assert_eq!(fault.to_string(), "disk gone");
    }
}
