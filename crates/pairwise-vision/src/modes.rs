//! Match-mode vocabulary across wire versions.
//!
//! Callers and stored rules use the legacy (v1) names. The v2 endpoint
//! renamed some of them.

/// Legacy name → v2 name, for every mode whose name changed.
const LEGACY_TO_V2: &[(&str, &str)] = &[("accurate", "precise")];

/// Known legacy mode names.
pub const LEGACY_MODES: &[&str] = &["fast", "balanced", "accurate"];

/// Translate a legacy mode to its v2 name. Unknown modes pass through.
pub fn to_v2_mode(legacy: &str) -> &str {
    LEGACY_TO_V2
        .iter()
        .find(|(from, _)| *from == legacy)
        .map_or(legacy, |(_, to)| *to)
}

/// Map either vocabulary to the legacy name, lowercased and trimmed.
pub fn normalize_legacy_mode(mode: &str) -> String {
    let mode = mode.trim().to_ascii_lowercase();
    LEGACY_TO_V2
        .iter()
        .find(|(_, v2)| *v2 == mode)
        .map_or(mode.clone(), |(legacy, _)| legacy.to_string())
}

pub fn is_known_mode(mode: &str) -> bool {
    LEGACY_MODES.contains(&normalize_legacy_mode(mode).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accurate_maps_to_precise() {
        assert_eq!(to_v2_mode("accurate"), "precise");
    }

    #[test]
    fn test_other_modes_are_identity() {
        assert_eq!(to_v2_mode("fast"), "fast");
        assert_eq!(to_v2_mode("balanced"), "balanced");
        assert_eq!(to_v2_mode("custom"), "custom");
    }

    #[test]
    fn test_normalize_accepts_v2_names() {
        assert_eq!(normalize_legacy_mode(" Precise "), "accurate");
        assert_eq!(normalize_legacy_mode("FAST"), "fast");
        assert!(is_known_mode("precise"));
        assert!(!is_known_mode("turbo"));
    }
}
