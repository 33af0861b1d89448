//! Asset identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

/// Opaque identifier for a tracked asset (e.g. "BTC")
///
/// Used as the key of every interest set and price lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an id from user input, rejecting blank values
    pub fn parse(id: &str) -> FeedResult<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(FeedError::invalid_asset(id));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for AssetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Convenience for building id lists in call sites and tests
pub fn asset_ids<I, S>(ids: I) -> Vec<AssetId>
where
    I: IntoIterator<Item = S>,
    S: Into<AssetId>,
{
    ids.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_rejects_blank() {
        assert_eq!(AssetId::parse(" BTC ").unwrap(), AssetId::from("BTC"));
        assert_eq!(
            AssetId::parse("   "),
            Err(FeedError::InvalidAsset("   ".to_string()))
        );
        assert!(AssetId::parse("").is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = AssetId::from("ETH");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ETH\"");

        let parsed: AssetId = serde_json::from_str("\"SOL\"").unwrap();
        assert_eq!(parsed.as_str(), "SOL");
    }
}
