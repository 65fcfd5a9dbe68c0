use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Error taxonomy shared by the store, the gateway and the REST layer.
///
/// `Conflict` is an internal signal (duplicate-thread race, unique
/// constraint collisions) and is resolved by retrying at the store
/// boundary; it should not normally reach a client.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("the {0} window for this message has elapsed")]
    Expired(&'static str),

    #[error("conflicting concurrent write")]
    Conflict,

    #[error("storage error: {0}")]
    Store(String),
}

impl ChatError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable code carried on the gateway `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Validation(_) => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Expired(_) => "EXPIRED",
            Self::Conflict => "CONFLICT",
            Self::Store(_) => "STORE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::Unauthenticated.code(), "UNAUTHENTICATED");
        assert_eq!(ChatError::Expired("edit").code(), "EXPIRED");
        assert_eq!(ChatError::NotFound("thread").code(), "NOT_FOUND");
    }
}
