/// Failure of a race or chat action.
///
/// Every message is safe to show to the acting user; the consumer forwards
/// them verbatim in an `error` event.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Rejected(String),
    #[error("Possible sync error. Refresh to continue.")]
    NotFound,
}

impl ActionError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Flatten into the list of messages sent to the client.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Rejected(msg) => vec![msg.clone()],
            Self::NotFound => vec![self.to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SlugError {
    #[error("slug must be 1-64 characters, got {0}")]
    Length(usize),
    #[error("invalid character in slug: {0:?}")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_has_single_message() {
        let err = ActionError::rejected("You are not an entrant.");
        assert_eq!(err.messages(), vec!["You are not an entrant.".to_string()]);
        assert_eq!(err.to_string(), "You are not an entrant.");
    }

    #[test]
    fn not_found_asks_for_refresh() {
        assert_eq!(
            ActionError::NotFound.messages(),
            vec!["Possible sync error. Refresh to continue.".to_string()]
        );
    }
}
