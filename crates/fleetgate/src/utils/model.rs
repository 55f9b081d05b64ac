//! Model-name helpers: key formatting, `:latest` tag resolution, and
//! parameter-count parsing for size estimation.

/// Formats the `(server, model)` pair into the key used by breakers,
/// metrics, cooldowns, bans and timeouts.
pub fn model_key(server_id: &str, model: &str) -> String {
    format!("{}:{}", server_id, model)
}

/// Splits a model key back into `(server_id, model)`.
///
/// Server ids never contain `:`, so the first separator wins; model names
/// may contain further colons (tags).
pub fn split_model_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Resolves a requested model name against a server's model list, applying
/// the `:latest` rule: an untagged request matches `name:latest` when the
/// exact name is absent.
pub fn resolve_model_name<'a>(requested: &'a str, available: &'a [String]) -> Option<&'a str> {
    if available.iter().any(|m| m == requested) {
        return Some(requested);
    }
    if !requested.contains(':') {
        let tagged = available
            .iter()
            .find(|m| m.strip_suffix(":latest").map(|base| base == requested) == Some(true));
        if let Some(tagged) = tagged {
            return Some(tagged.as_str());
        }
    }
    None
}

/// Parses a parameter count (in billions) out of a model name, e.g.
/// `llama3:70b` → 70.0, `phi3:3.8b-mini` → 3.8. Returns `None` when the name
/// carries no recognizable size marker.
pub fn parameter_billions(model: &str) -> Option<f64> {
    let lower = model.to_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'b' {
                // Reject trailing digit runs that are part of a longer word
                // (e.g. "v2base") by requiring a boundary after the 'b'.
                let boundary_ok = i + 1 >= bytes.len() || !bytes[i + 1].is_ascii_alphanumeric();
                // And a boundary before the number ("q4b" quantization tags);
                // 'x' is allowed so expert counts like "8x7b" parse as 7b.
                let prefix_ok = start == 0
                    || !bytes[start - 1].is_ascii_alphanumeric()
                    || bytes[start - 1] == b'x';
                if boundary_ok && prefix_ok {
                    if let Ok(value) = lower[start..i].parse::<f64>() {
                        if value > 0.0 && value < 2_000.0 {
                            return Some(value);
                        }
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Maps a model size in GB onto the coarse size classes used for load-time
/// estimates.
pub fn size_class(size_gb: f64) -> &'static str {
    match size_gb {
        s if s < 2.0 => "tiny",
        s if s < 6.0 => "small",
        s if s < 12.0 => "medium",
        s if s < 30.0 => "large",
        s if s < 60.0 => "xl",
        _ => "xxl",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips() {
        let key = model_key("srv-1", "llama3:latest");
        assert_eq!(split_model_key(&key), Some(("srv-1", "llama3:latest")));
    }

    #[test]
    fn latest_rule_resolves_untagged_names() {
        let available = vec!["llama3:latest".to_string(), "phi3:mini".to_string()];
        assert_eq!(resolve_model_name("llama3", &available), Some("llama3:latest"));
        assert_eq!(
            resolve_model_name("llama3:latest", &available),
            Some("llama3:latest")
        );
        assert_eq!(resolve_model_name("phi3", &available), None);
        assert_eq!(resolve_model_name("mistral", &available), None);
    }

    #[test]
    fn parameter_counts_are_parsed() {
        assert_eq!(parameter_billions("llama3:70b"), Some(70.0));
        assert_eq!(parameter_billions("phi3:3.8b-mini"), Some(3.8));
        assert_eq!(parameter_billions("nomic-embed-text"), None);
        assert_eq!(parameter_billions("mixtral:8x7b"), Some(7.0));
    }

    #[test]
    fn size_classes_cover_the_range() {
        assert_eq!(size_class(1.0), "tiny");
        assert_eq!(size_class(8.0), "medium");
        assert_eq!(size_class(40.0), "xl");
        assert_eq!(size_class(120.0), "xxl");
    }
}
