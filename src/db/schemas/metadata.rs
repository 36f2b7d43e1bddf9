//! Timestamps carried by every stored document

use bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    /// Archive listings sort on this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::created(DateTime::now())
    }

    /// Both timestamps set to `at`
    pub fn created(at: DateTime) -> Self {
        Self {
            updated_at: Some(at),
            created_at: Some(at),
        }
    }

    /// Stamp a write, keeping an existing creation time
    pub fn touch(&mut self) {
        let now = DateTime::now();
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_keeps_creation_time() {
        let created = DateTime::from_millis(1_000);
        let mut metadata = Metadata::created(created);
        metadata.touch();

        assert_eq!(metadata.created_at, Some(created));
        assert!(metadata.updated_at > Some(created));
    }

    #[test]
    fn test_touch_fills_missing_creation_time() {
        let mut metadata = Metadata::default();
        metadata.touch();
        assert!(metadata.created_at.is_some());
        assert_eq!(metadata.created_at, metadata.updated_at);
    }
}
