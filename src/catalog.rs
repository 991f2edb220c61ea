use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::RadioApi;
use crate::script::{parse_dialogue, Dialogue};

/// Embedded fallback catalog, in the legacy array line encoding the server
/// also still emits. Used whenever the live catalog or a per-frequency
/// fetch is unreachable.
const STATIC_CATALOG: &str = r#"
{
    "frequencies": ["145.55", "PRIV", "???"],
    "dialogues": {
        "145.55": {
            "characters": [
                {"name": "operator", "voiceMode": "typing", "displayWindow": 1},
                {"name": "meridian", "voiceMode": "typing", "displayWindow": 2}
            ],
            "conversations": [
                ["operator", "This is relay 145.55, do you copy?"],
                ["meridian", "Copy. Signal is weak but holding."],
                ["operator", "Good.[1s] Stay on this channel.", null, null,
                    {"choiceId": "stay_or_scan", "options": [
                        {"id": "stay", "text": "Holding position."},
                        {"id": "scan", "text": "I need to scan the band."}
                    ]}],
                {"choiceId": "stay_or_scan", "responses": {
                    "stay": [["meridian", "Understood. We hold together."]],
                    "scan": [["meridian", "Then keep this frequency written down."]]
                }},
                ["operator", "Transmission ends here. For now."]
            ]
        },
        "PRIV": {
            "characters": [
                {"name": "archivist", "voiceMode": "voiceline", "displayWindow": 1}
            ],
            "conversations": [
                ["archivist", "Private channel. You should not have this dial setting."],
                ["archivist", "But since you do:[2s] listen carefully."]
            ]
        },
        "???": {
            "characters": [
                {"name": "unknown", "voiceMode": "none", "displayWindow": 2}
            ],
            "conversations": [
                ["unknown", "[fx:glitch]...is anyone...[3s] still out there...", null, "???"]
            ]
        }
    }
}
"#;

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub frequencies: Vec<String>,
    pub asset_base_url: Option<String>,
}

/// Loads the station catalog once and caches it; every later call returns
/// the cached copy, so callers may invoke it freely.
pub struct CatalogLoader {
    cached: Mutex<Option<Catalog>>,
}

impl CatalogLoader {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    pub async fn load(&self, api: &RadioApi) -> Catalog {
        let mut cached = self.cached.lock().await;
        if let Some(catalog) = cached.as_ref() {
            return catalog.clone();
        }
        let catalog = match api.fetch_catalog().await {
            Ok(response) if !response.frequencies.is_empty() => {
                info!(count = response.frequencies.len(), "loaded live frequency catalog");
                Catalog {
                    frequencies: response.frequencies,
                    asset_base_url: response.asset_base_url,
                }
            }
            Ok(_) => {
                warn!("live catalog was empty; using embedded fallback");
                static_catalog()
            }
            Err(err) => {
                warn!(?err, "catalog fetch failed; using embedded fallback");
                static_catalog()
            }
        };
        *cached = Some(catalog.clone());
        catalog
    }
}

pub fn static_catalog() -> Catalog {
    Catalog {
        frequencies: static_frequencies(),
        asset_base_url: None,
    }
}

pub fn static_frequencies() -> Vec<String> {
    static_root()
        .get("frequencies")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub fn static_dialogue(frequency: &str) -> Option<Dialogue> {
    static_root()
        .get("dialogues")
        .and_then(|dialogues| dialogues.get(frequency))
        .map(parse_dialogue)
}

fn static_root() -> Value {
    // The embedded catalog is compile-time constant; a parse failure here
    // is a build defect, not a runtime condition.
    serde_json::from_str(STATIC_CATALOG).unwrap_or_else(|err| {
        warn!(?err, "embedded catalog failed to parse");
        Value::Null
    })
}

/// Step through the dial cyclically, skipping frequencies the operator has
/// no access to. `allowed` of `None` means the wildcard policy: everything
/// is tunable.
pub fn step_frequency(
    order: &[String],
    allowed: Option<&[String]>,
    current: &str,
    forward: bool,
) -> Option<String> {
    if order.is_empty() {
        return None;
    }
    let len = order.len() as isize;
    let start = order
        .iter()
        .position(|freq| freq == current)
        .map(|idx| idx as isize)
        .unwrap_or(0);
    let step = if forward { 1 } else { -1 };

    for offset in 1..=len {
        let idx = (start + step * offset).rem_euclid(len) as usize;
        let candidate = &order[idx];
        let tunable = allowed
            .map(|list| list.iter().any(|freq| freq == candidate))
            .unwrap_or(true);
        if tunable {
            return Some(candidate.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{static_dialogue, static_frequencies, step_frequency, CatalogLoader};
    use crate::api::RadioApi;
    use crate::script::Line;

    fn order() -> Vec<String> {
        vec!["A".to_owned(), "B".to_owned(), "C".to_owned()]
    }

    #[test]
    fn embedded_catalog_parses() {
        assert_eq!(static_frequencies(), vec!["145.55", "PRIV", "???"]);
        let dialogue = static_dialogue("145.55").expect("embedded dialogue");
        assert_eq!(dialogue.characters.len(), 2);
        assert!(dialogue
            .conversations
            .iter()
            .any(|line| matches!(line, Line::Choice { .. })));
        assert!(static_dialogue("88.00").is_none());
    }

    #[tokio::test]
    async fn unreachable_server_falls_back_and_stays_cached() {
        // Nothing listens on this port; the refused connection exercises
        // the fallback, and the second call must serve the cached copy.
        let api = RadioApi::new("http://127.0.0.1:9");
        let loader = CatalogLoader::new();
        let first = loader.load(&api).await;
        assert_eq!(first.frequencies, static_frequencies());
        let second = loader.load(&api).await;
        assert_eq!(second.frequencies, first.frequencies);
    }

    #[test]
    fn restricted_navigation_skips_and_wraps() {
        let allowed = vec!["A".to_owned(), "C".to_owned()];
        // B is skipped going forward from A; wrapping from C lands on A.
        assert_eq!(
            step_frequency(&order(), Some(&allowed), "A", true).as_deref(),
            Some("C")
        );
        assert_eq!(
            step_frequency(&order(), Some(&allowed), "C", true).as_deref(),
            Some("A")
        );
    }

    #[test]
    fn backward_navigation_wraps_too() {
        assert_eq!(
            step_frequency(&order(), None, "A", false).as_deref(),
            Some("C")
        );
    }

    #[test]
    fn wildcard_access_allows_everything() {
        assert_eq!(
            step_frequency(&order(), None, "A", true).as_deref(),
            Some("B")
        );
    }

    #[test]
    fn sole_allowed_frequency_steps_onto_itself() {
        let allowed = vec!["B".to_owned()];
        assert_eq!(
            step_frequency(&order(), Some(&allowed), "B", true).as_deref(),
            Some("B")
        );
    }

    #[test]
    fn no_allowed_frequency_means_no_step() {
        let allowed: Vec<String> = Vec::new();
        assert_eq!(step_frequency(&order(), Some(&allowed), "A", true), None);
    }
}
