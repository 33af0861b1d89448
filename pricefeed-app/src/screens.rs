//! Screen definitions read from the environment
//!
//! `PRICEFEED_SCREENS` lists screens as `name=ID,ID` entries separated by
//! `;`, e.g. `list=BTC,ETH;detail=BTC`.

use pricefeed_core::{AssetId, FeedError, FeedResult};

/// Used when `PRICEFEED_SCREENS` is unset
pub const DEFAULT_SCREENS: &str = "list=BTC,ETH;detail=BTC";

/// One screen and the assets it shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screen {
    pub name: String,
    pub assets: Vec<AssetId>,
}

/// Screens from `PRICEFEED_SCREENS`, or the defaults
pub fn from_env() -> FeedResult<Vec<Screen>> {
    let raw = std::env::var("PRICEFEED_SCREENS").unwrap_or_else(|_| DEFAULT_SCREENS.to_string());
    parse_screens(&raw)
}

pub fn parse_screens(raw: &str) -> FeedResult<Vec<Screen>> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> FeedResult<Screen> {
    let (name, ids) = entry
        .split_once('=')
        .ok_or_else(|| FeedError::config(format!("screen entry {:?} is missing '='", entry)))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(FeedError::invalid_consumer(name));
    }

    let assets = ids
        .split(',')
        .filter(|id| !id.trim().is_empty())
        .map(AssetId::parse)
        .collect::<FeedResult<Vec<_>>>()?;

    Ok(Screen {
        name: name.to_string(),
        assets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricefeed_core::asset_ids;

    #[test]
    fn test_parse_default_screens() {
        let screens = parse_screens(DEFAULT_SCREENS).unwrap();
        assert_eq!(
            screens,
            vec![
                Screen {
                    name: "list".to_string(),
                    assets: asset_ids(["BTC", "ETH"]),
                },
                Screen {
                    name: "detail".to_string(),
                    assets: asset_ids(["BTC"]),
                },
            ]
        );
    }

    #[test]
    fn test_parse_tolerates_whitespace_and_blanks() {
        let screens = parse_screens(" list = BTC , ,ETH ;; detail=").unwrap();
        assert_eq!(screens.len(), 2);
        assert_eq!(screens[0].assets, asset_ids(["BTC", "ETH"]));
        assert!(screens[1].assets.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(matches!(
            parse_screens("list"),
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            parse_screens("=BTC"),
            Err(FeedError::InvalidConsumer(_))
        ));
    }
}
