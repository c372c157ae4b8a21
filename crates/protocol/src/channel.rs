use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Longest accepted channel name, in bytes.
pub const CHANNEL_NAME_MAX_LEN: usize = 164;

/// Reasons a channel name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelNameError {
    #[error("channel name is empty")]
    Empty,
    #[error("channel name is {0} bytes, limit is {CHANNEL_NAME_MAX_LEN}")]
    TooLong(usize),
    #[error("channel name contains forbidden character {0:?}")]
    BadChar(char),
}

/// A validated channel name.
///
/// Names are 1 to [`CHANNEL_NAME_MAX_LEN`] characters from the set
/// `A-Z a-z 0-9 _ - = @ , . ;`. Construction goes through [`FromStr`] so an
/// instance always holds a valid name. Serializes as a plain string; incoming
/// names arrive as `String` fields and are parsed at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn is_allowed_channel_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '@' | ',' | '.' | ';')
}

impl FromStr for ChannelName {
    type Err = ChannelNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ChannelNameError::Empty);
        }
        if s.len() > CHANNEL_NAME_MAX_LEN {
            return Err(ChannelNameError::TooLong(s.len()));
        }
        if let Some(bad) = s.chars().find(|c| !is_allowed_channel_char(*c)) {
            return Err(ChannelNameError::BadChar(bad));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
