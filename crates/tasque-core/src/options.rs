use std::sync::OnceLock;

/// Per-run options consulted by the run-loop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// When true, every bind reduction polls the cancellation stack and the
    /// run stops mid-chain once it observes a cancel. When false,
    /// cancellation is honoured only at asynchronous suspension points.
    pub auto_cancelable_binds: bool,
    /// Reserved toggle for integrations that transport thread-local-like
    /// context across asynchronous hops. The core recognises and carries the
    /// flag; it does not interpret it.
    pub local_context_propagation: bool,
}

const AUTO_CANCELABLE_ENV: &str = "TASQUE_AUTO_CANCELABLE_BINDS";
const LOCAL_CONTEXT_ENV: &str = "TASQUE_LOCAL_CONTEXT_PROPAGATION";

impl Options {
    /// Enables cancellation polling on bind reductions.
    pub fn auto_cancelable(mut self) -> Self {
        self.auto_cancelable_binds = true;
        self
    }

    /// Defaults derived from the process environment, read once.
    ///
    /// `TASQUE_AUTO_CANCELABLE_BINDS` and `TASQUE_LOCAL_CONTEXT_PROPAGATION`
    /// accept `1`, `true`, `yes`, `on` (case-insensitive).
    pub fn from_env() -> Options {
        static CACHED: OnceLock<Options> = OnceLock::new();
        *CACHED.get_or_init(|| Options::parse(|key| std::env::var(key).ok()))
    }

    fn parse(lookup: impl Fn(&str) -> Option<String>) -> Options {
        Options {
            auto_cancelable_binds: lookup(AUTO_CANCELABLE_ENV)
                .map(|v| truthy(&v))
                .unwrap_or(false),
            local_context_propagation: lookup(LOCAL_CONTEXT_ENV)
                .map(|v| truthy(&v))
                .unwrap_or(false),
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_defaults_are_off() {
        let options = Options::default();
        assert!(!options.auto_cancelable_binds);
        assert!(!options.local_context_propagation);
    }

    #[test]
    fn parses_truthy_spellings() {
        for spelling in ["1", "true", "YES", " on "] {
            let options = Options::parse(|key| {
                (key == AUTO_CANCELABLE_ENV).then(|| spelling.to_string())
            });
            assert!(options.auto_cancelable_binds, "spelling {spelling:?}");
            assert!(!options.local_context_propagation);
        }
    }

    #[test]
    fn ignores_falsy_and_unknown_values() {
        for spelling in ["0", "false", "off", "banana"] {
            let options = Options::parse(|_| Some(spelling.to_string()));
            assert!(!options.auto_cancelable_binds, "spelling {spelling:?}");
        }
    }
}
