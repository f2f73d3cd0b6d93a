use thiserror::Error;

/// Failure reported by an event handler.
///
/// Handlers classify their own failures. A `Transient` failure is worth another
/// attempt (timeouts, unavailable dependencies); a `Permanent` one will fail the
/// same way every time (validation, unknown references) and should be
/// dead-lettered instead of redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(String),

    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_explicit() {
        assert!(HandlerError::permanent("bad payload").is_permanent());
        assert!(!HandlerError::transient("db timeout").is_permanent());
        assert_eq!(HandlerError::transient("db timeout").message(), "db timeout");
    }
}
