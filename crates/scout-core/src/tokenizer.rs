//! Word tokenizer and the outreach vocabulary the decoder samples from.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::signal::SignalKind;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s'!?.,]").unwrap());
static PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([!?.,])").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());

pub const PAD: &str = "[PAD]";
pub const BOS: &str = "[BOS]";
pub const EOS: &str = "[EOS]";
pub const UNK: &str = "[UNK]";

pub const PAD_ID: usize = 0;
pub const BOS_ID: usize = 1;
pub const EOS_ID: usize = 2;
pub const UNK_ID: usize = 3;

/// Lowercase words with sentence punctuation split off as its own token.
/// Apostrophes inside words survive ("we're"); other symbols are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    let spaced = PUNCT.replace_all(&cleaned, " $1 ");
    spaced
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Opening line keyed on the lead's strongest signal.
pub fn opening_hook(kind: Option<SignalKind>) -> &'static str {
    match kind {
        None => "Saw we're both in the SaaS space.",
        Some(SignalKind::ContentEngagement) => "Saw you engaged with our recent post.",
        Some(SignalKind::ProfileVisit) => "Thanks for stopping by my profile recently.",
        Some(SignalKind::FundingRound) => "Huge congrats on the funding round!",
        Some(SignalKind::RoleChange) => "Congrats on the new role!",
        Some(SignalKind::EventAttendance) => "Saw you're also attending the event.",
        Some(SignalKind::DemoRequest) => "Thanks for requesting a demo with us.",
        Some(SignalKind::PricingPageVisit) => "Noticed you were looking at plans and pricing.",
        Some(SignalKind::JobPosting) => "Saw your team is hiring.",
        Some(_) => "I've been following your work.",
    }
}

/// Corpus the default vocabulary is built from.
pub const OUTREACH_TEMPLATES: &[&str] = &[
    "Hi there,",
    "Saw we're both in the SaaS space.",
    "Saw you engaged with our recent post.",
    "Thanks for stopping by my profile recently.",
    "Huge congrats on the funding round!",
    "Congrats on the new role!",
    "Saw you're also attending the event.",
    "Thanks for requesting a demo with us.",
    "Noticed you were looking at plans and pricing.",
    "Saw your team is hiring.",
    "I've been following your work.",
    "We help companies scale their outbound efficiency.",
    "I help leaders automate their GTM motion to cut costs while doubling pipeline.",
    "We built a tool that automates signal collection so your team can focus on closing, not researching.",
    "Our platform handles the boring data entry parts of prospecting for you.",
    "Worth a quick chat?",
    "Best,",
];

/// Bidirectional word ↔ id map. Ids 0..4 are the special tokens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct OutreachVocab {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

impl From<Vec<String>> for OutreachVocab {
    fn from(words: Vec<String>) -> Self {
        let index = words.iter().enumerate().map(|(i, w)| (w.clone(), i)).collect();
        Self { words, index }
    }
}

impl From<OutreachVocab> for Vec<String> {
    fn from(vocab: OutreachVocab) -> Self {
        vocab.words
    }
}

impl Default for OutreachVocab {
    fn default() -> Self {
        Self::from_corpus(OUTREACH_TEMPLATES.iter().copied())
    }
}

impl OutreachVocab {
    /// Specials first, then every distinct token in first-seen order.
    pub fn from_corpus<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut words: Vec<String> = [PAD, BOS, EOS, UNK].iter().map(|s| s.to_string()).collect();
        for text in texts {
            for token in tokenize(text) {
                if !words.contains(&token) {
                    words.push(token);
                }
            }
        }
        Self::from(words)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn id(&self, word: &str) -> usize {
        self.index.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn word(&self, id: usize) -> &str {
        self.words.get(id).map_or(UNK, String::as_str)
    }

    /// Token ids for `text`; words outside the vocabulary map to `[UNK]`.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        tokenize(text).iter().map(|t| self.id(t)).collect()
    }

    /// Join ids back into text, skipping specials and attaching punctuation
    /// to the preceding word.
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id < UNK_ID {
                continue;
            }
            let word = self.word(id);
            let is_punct = matches!(word, "." | "," | "!" | "?");
            if !out.is_empty() && !is_punct {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokenize() {
        assert_eq!(tokenize("Hello, world!"), vec!["hello", ",", "world", "!"]);
    }

    #[test]
    fn test_apostrophe_preserved() {
        assert_eq!(tokenize("We're 'live'"), vec!["we're", "live"]);
    }

    #[test]
    fn test_symbols_dropped() {
        assert_eq!(tokenize("cut costs by 40%"), vec!["cut", "costs", "by", "40"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("  \t\n ").is_empty());
    }

    #[test]
    fn test_specials_are_first() {
        let vocab = OutreachVocab::default();
        assert_eq!(vocab.word(PAD_ID), PAD);
        assert_eq!(vocab.word(BOS_ID), BOS);
        assert_eq!(vocab.word(EOS_ID), EOS);
        assert_eq!(vocab.word(UNK_ID), UNK);
        assert_eq!(vocab.id("worth"), vocab.id("worth"));
        assert!(vocab.id("worth") > UNK_ID);
    }

    #[test]
    fn test_unknown_word_maps_to_unk() {
        let vocab = OutreachVocab::default();
        let ids = vocab.encode("worth a zeppelin");
        assert_eq!(ids[2], UNK_ID);
        assert_ne!(ids[0], UNK_ID);
    }

    #[test]
    fn test_decode_round_trip_of_template() {
        let vocab = OutreachVocab::default();
        let ids = vocab.encode("Worth a quick chat?");
        assert_eq!(vocab.decode(&ids), "worth a quick chat?");
    }

    #[test]
    fn test_decode_skips_control_tokens() {
        let vocab = OutreachVocab::default();
        let mut ids = vec![BOS_ID];
        ids.extend(vocab.encode("best,"));
        ids.push(EOS_ID);
        ids.push(PAD_ID);
        assert_eq!(vocab.decode(&ids), "best,");
    }

    #[test]
    fn test_every_hook_is_in_vocab() {
        let vocab = OutreachVocab::default();
        let kinds = std::iter::once(None).chain(SignalKind::ALL.into_iter().map(Some));
        for kind in kinds {
            assert!(!vocab.encode(opening_hook(kind)).contains(&UNK_ID), "{kind:?}");
        }
    }

    #[test]
    fn test_serde_as_word_list() {
        let vocab = OutreachVocab::from_corpus(["hi there"]);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["[PAD]","[BOS]","[EOS]","[UNK]","hi","there"]"#);
        let back: OutreachVocab = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vocab);
    }
}
