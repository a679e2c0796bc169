//! Error types for instance name parsing.

use thiserror::Error;

/// Errors that can occur when parsing an instance name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name string is empty.
    #[error("instance name cannot be empty")]
    Empty,

    /// The name does not have the `projects/../locations/../clusters/../instances/..` shape.
    #[error("invalid instance name '{name}': expected projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>")]
    InvalidFormat { name: String },

    /// A segment value is empty.
    #[error("invalid instance name '{name}': {segment} is empty")]
    EmptySegment { name: String, segment: &'static str },

    /// A segment value contains a character that is not allowed there.
    #[error("invalid instance name '{name}': {segment} contains '{found}'")]
    InvalidCharacter {
        name: String,
        segment: &'static str,
        found: char,
    },
}

impl NameError {
    /// Returns the raw input that failed to parse, if any.
    pub fn input(&self) -> Option<&str> {
        match self {
            NameError::Empty => None,
            NameError::InvalidFormat { name }
            | NameError::EmptySegment { name, .. }
            | NameError::InvalidCharacter { name, .. } => Some(name),
        }
    }
}
