use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TempUserError {
    #[error("invalid pattern {name}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("unknown serial provider type: {0}")]
    UnknownSerialProvider(String),

    #[error("unknown serial mapping type: {0}")]
    UnknownSerialMapping(String),

    #[error("invalid options for serial provider {kind}: {reason}")]
    InvalidProviderOptions { kind: String, reason: String },

    #[error("invalid options for serial mapping {kind}: {reason}")]
    InvalidMappingOptions { kind: String, reason: String },

    /// A generator-side method was called while temp account creation is off.
    #[error("{0} is disabled")]
    Disabled(&'static str),

    /// A matcher-side method was called while temp accounts are not known.
    #[error("{0} is not known")]
    NotKnown(&'static str),
}

impl TempUserError {
    pub fn invalid_pattern(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPattern { .. } => "invalid_pattern",
            Self::UnknownSerialProvider(_) => "unknown_serial_provider",
            Self::UnknownSerialMapping(_) => "unknown_serial_mapping",
            Self::InvalidProviderOptions { .. } => "invalid_provider_options",
            Self::InvalidMappingOptions { .. } => "invalid_mapping_options",
            Self::Disabled(_) => "disabled",
            Self::NotKnown(_) => "not_known",
        }
    }
}
