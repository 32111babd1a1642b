use serde::{Deserialize, Serialize};

use crate::{Result, SmtError};

/// Largest supported tree height; a path is at most this many bits
pub const MAX_HEIGHT: usize = 254;

/// Construction parameters shared by every tree variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Number of levels below the root, and the bit width of a path
    pub height: usize,
    /// Hash the key's field encoding into a path. When off, a key must encode to one element.
    pub hash_key: bool,
    /// Commit `hash(value)` at the leaf. When off, a value must encode to one element.
    pub hash_value: bool,
}

impl TreeConfig {
    pub fn new(height: usize) -> Self {
        Self {
            height,
            hash_key: true,
            hash_value: true,
        }
    }

    pub fn with_hash_key(mut self, hash_key: bool) -> Self {
        self.hash_key = hash_key;
        self
    }

    pub fn with_hash_value(mut self, hash_value: bool) -> Self {
        self.hash_value = hash_value;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_height(self.height)
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new(MAX_HEIGHT)
    }
}

pub(crate) fn check_height(height: usize) -> Result<()> {
    if height == 0 || height > MAX_HEIGHT {
        return Err(SmtError::InvalidHeight {
            height,
            max: MAX_HEIGHT,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_bounds() {
        assert!(TreeConfig::new(1).validate().is_ok());
        assert!(TreeConfig::new(MAX_HEIGHT).validate().is_ok());
        assert!(matches!(
            TreeConfig::new(0).validate(),
            Err(SmtError::InvalidHeight { height: 0, .. })
        ));
        assert!(matches!(
            TreeConfig::new(MAX_HEIGHT + 1).validate(),
            Err(SmtError::InvalidHeight { .. })
        ));
    }

    #[test]
    fn builder_flags() {
        let config = TreeConfig::new(8).with_hash_key(false).with_hash_value(false);
        assert_eq!(config.height, 8);
        assert!(!config.hash_key);
        assert!(!config.hash_value);
        assert_eq!(TreeConfig::default().height, MAX_HEIGHT);
    }
}
