// src/channel/record.rs

use super::error::ChannelError;

/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Longest accepted value, in bytes
pub const MAX_VALUE_LEN: usize = 40000;

/// A validated key/value record; both halves are UTF-8 text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    key: String,
    value: String,
}

impl ChannelRecord {
    /// Validates both halves of a record
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, ChannelError> {
        let key = key.into();
        let value = value.into();

        validate_key(&key)?;
        validate_value(&value)?;

        Ok(Self { key, value })
    }

    /// The record key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The record value
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Checks a key against the length bounds
pub fn validate_key(key: &str) -> Result<(), ChannelError> {
    if key.is_empty() {
        return Err(ChannelError::InvalidRecord("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ChannelError::InvalidRecord(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), ChannelError> {
    if value.is_empty() {
        return Err(ChannelError::InvalidRecord("value is empty".to_string()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(ChannelError::InvalidRecord(format!(
            "value is {} bytes, limit is {}",
            value.len(),
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}
