/// Display form of an entity name: trimmed, internal whitespace collapsed.
pub fn clean_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Merge identity of an entity: the cleaned name, lowercased.
///
/// Only case and whitespace are folded. Names that differ otherwise
/// ("CAR-T" vs "CAR-T Therapy", "E.S.P. 32" vs "ESP32") stay separate keys.
pub fn normalize_key(name: &str) -> String {
    clean_name(name).to_lowercase()
}
