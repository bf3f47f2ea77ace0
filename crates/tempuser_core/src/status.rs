use serde::Serialize;

use crate::accounts::User;

pub const UNABLE_TO_ACQUIRE: &str = "temp-user-unable-to-acquire";
pub const THROTTLE_HIT: &str = "acct_creation_throttle_hit";
pub const USER_EXISTS: &str = "userexists";
pub const INTERNAL_ERROR: &str = "internalerror_info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageParam {
    Num(u64),
    /// A duration in seconds.
    Duration(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub key: String,
    pub params: Vec<MessageParam>,
}

impl StatusMessage {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_params(key: &str, params: Vec<MessageParam>) -> Self {
        Self {
            key: key.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateStatus {
    pub errors: Vec<StatusMessage>,
    pub warnings: Vec<StatusMessage>,
    pub user: Option<User>,
}

impl CreateStatus {
    pub fn good() -> Self {
        Self::default()
    }

    pub fn new_fatal(message: StatusMessage) -> Self {
        let mut status = Self::default();
        status.fatal(message);
        status
    }

    pub fn fatal(&mut self, message: StatusMessage) {
        self.errors.push(message);
    }

    pub fn warning(&mut self, message: StatusMessage) {
        self.warnings.push(message);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_good(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// Fold another status's messages into this one. The value is kept.
    pub fn merge(&mut self, other: CreateStatus) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_message(&self, key: &str) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|message| message.key == key)
    }

    pub fn first_error_key(&self) -> Option<&str> {
        self.errors.first().map(|message| message.key.as_str())
    }
}
