/// Minimum text length for a reply to count as signal on its own. Also
/// the floor below which agent-proposed replies are suppressed.
pub const MIN_REPLY_LENGTH: usize = 10;

/// Low-signal filter applied before builder-profile synthesis.
///
/// Replies shorter than the threshold with no attachments are noise
/// ("gm", "nice"). Originals with neither text nor attachments carry
/// nothing to summarize. Attachments rescue short casts in both cases.
pub fn is_low_signal_cast(text: &str, is_reply: bool, has_embeds: bool) -> bool {
    if is_reply {
        text.trim().len() < MIN_REPLY_LENGTH && !has_embeds
    } else {
        text.trim().is_empty() && !has_embeds
    }
}

/// Lowercase and dedup a membership list (groups/users/tags), preserving
/// first-seen order.
pub fn normalize_membership(values: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reply_without_embeds_is_filtered() {
        assert!(is_low_signal_cast("gm", true, false));
    }

    #[test]
    fn short_reply_with_embeds_is_kept() {
        assert!(!is_low_signal_cast("gm", true, true));
    }

    #[test]
    fn empty_original_without_embeds_is_filtered() {
        assert!(is_low_signal_cast("", false, false));
    }

    #[test]
    fn original_with_text_is_kept() {
        assert!(!is_low_signal_cast("Shipped the new contract today", false, false));
    }

    #[test]
    fn normalize_lowercases_and_dedups_in_order() {
        let input = vec![
            "Nouns".to_string(),
            "nouns".to_string(),
            " Flows ".to_string(),
            "".to_string(),
        ];
        assert_eq!(normalize_membership(&input), vec!["nouns", "flows"]);
    }
}
