/// Phrases that mark a subject as a likely scam.
pub const SCAM_KEYWORDS: [&str; 8] = [
    "bank account",
    "urgent",
    "won",
    "payment failure",
    "lottery",
    "fraud",
    "password reset",
    "security alert",
];

/// Keyword filter run ahead of the spam model.
///
/// Matching is a case-insensitive substring search with no word boundaries, so
/// "urgently" matches "urgent" and "wonderful" matches "won".
#[derive(Debug, Clone)]
pub struct ScamDetector {
    keywords: Vec<String>,
}

impl Default for ScamDetector {
    fn default() -> Self {
        Self {
            keywords: SCAM_KEYWORDS.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

impl ScamDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scam(&self, subject: &str) -> bool {
        self.matched_keyword(subject).is_some()
    }

    /// First keyword found in `subject`, if any.
    pub fn matched_keyword(&self, subject: &str) -> Option<&str> {
        let subject = subject.to_lowercase();
        self.keywords
            .iter()
            .find(|k| subject.contains(k.as_str()))
            .map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_keyword_matches_in_any_casing() {
        let detector = ScamDetector::new();
        for keyword in SCAM_KEYWORDS {
            let upper = format!("Re: {} inside", keyword.to_uppercase());
            let mixed = format!("{}!!!", capitalize_words(keyword));
            assert!(detector.is_scam(keyword), "{keyword}");
            assert!(detector.is_scam(&upper), "{upper}");
            assert!(detector.is_scam(&mixed), "{mixed}");
        }
    }

    #[test]
    fn test_plain_subjects_are_not_scams() {
        let detector = ScamDetector::new();
        for subject in [
            "Meeting notes",
            "Quarterly report attached",
            "Lunch on Friday?",
            "",
            "No Subject",
            "bank statement",
            "pass word",
        ] {
            assert!(!detector.is_scam(subject), "{subject}");
        }
    }

    #[test]
    fn test_substring_semantics_have_no_word_boundaries() {
        let detector = ScamDetector::new();
        assert!(detector.is_scam("Please reply urgently"));
        assert!(detector.is_scam("A wonderful weekend"));
        assert_eq!(detector.matched_keyword("Urgently needed"), Some("urgent"));
    }

    #[test]
    fn test_multi_word_keywords_need_the_exact_spacing() {
        let detector = ScamDetector::new();
        assert!(detector.is_scam("Your BANK ACCOUNT is locked"));
        assert!(!detector.is_scam("Your bank  account is locked"));
        assert!(!detector.is_scam("Your bankaccount is locked"));
    }

    fn capitalize_words(s: &str) -> String {
        s.split(' ')
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
