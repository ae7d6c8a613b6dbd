//! Subject-line normalization shared by discovery, curation and dedupe keys.

use regex::Regex;
use std::sync::OnceLock;

pub const NO_SUBJECT: &str = "(no subject)";

fn reply_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(re|fw|fwd)\s*:\s*").expect("reply prefix regex must compile")
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strips `Re:`/`Fw:`/`Fwd:` prefixes and collapses whitespace until nothing changes.
///
/// Empty results map to [`NO_SUBJECT`]. The output is a fixed point, so
/// normalizing twice is the same as normalizing once.
pub fn normalize_subject(subject: &str) -> String {
    let mut current = collapse_whitespace(subject);
    loop {
        let next = collapse_whitespace(&reply_prefix_re().replace(&current, ""));
        if next == current {
            break;
        }
        current = next;
    }
    if current.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_nested_prefixes() {
        assert_eq!(normalize_subject("RE: Fw: FWD:  Q3 budget"), "Q3 budget");
        assert_eq!(normalize_subject("re :re: gas   deal "), "gas deal");
        assert_eq!(normalize_subject("Regarding the plan"), "Regarding the plan");
    }

    #[test]
    fn empty_subjects_become_sentinel() {
        assert_eq!(normalize_subject(""), NO_SUBJECT);
        assert_eq!(normalize_subject("  Re:  "), NO_SUBJECT);
        assert_eq!(normalize_subject(NO_SUBJECT), NO_SUBJECT);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(s in ".{0,60}") {
            let once = normalize_subject(&s);
            prop_assert_eq!(normalize_subject(&once), once.clone());
        }

        #[test]
        fn prefixed_subjects_are_idempotent(
            prefixes in proptest::collection::vec("(re|RE|Re|fw|FW|Fw|fwd|FWD|Fwd) ?: ?", 0..6),
            rest in "[a-zA-Z :]{0,30}",
        ) {
            let s = format!("{}{}", prefixes.concat(), rest);
            let once = normalize_subject(&s);
            prop_assert_eq!(normalize_subject(&once), once.clone());
        }
    }
}
