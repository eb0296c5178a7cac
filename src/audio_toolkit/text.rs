//! Text utilities: input-script gating and speech-text cleanup.
//!
//! The backend only understands English, Hindi and Marathi, so anything
//! written outside Latin or Devanagari is rejected locally before a single
//! byte reaches the network.

use once_cell::sync::Lazy;
use regex::Regex;

/// Minimum cleaned length worth sending to speech synthesis.
pub const MIN_SPEAKABLE_CHARS: usize = 5;

/// Script classification of user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    /// Only Latin letters (plus neutral characters)
    Latin,
    /// Only Devanagari letters (plus neutral characters)
    Devanagari,
    /// Both Latin and Devanagari letters
    Mixed,
    /// Contains letters from a script the backend cannot handle
    Unsupported,
}

impl ScriptClass {
    pub fn is_supported(self) -> bool {
        !matches!(self, ScriptClass::Unsupported)
    }
}

fn is_devanagari(c: char) -> bool {
    ('\u{0900}'..='\u{097F}').contains(&c) || ('\u{A8E0}'..='\u{A8FF}').contains(&c)
}

fn is_latin_letter(c: char) -> bool {
    c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&c)
}

fn is_neutral(c: char) -> bool {
    c.is_ascii_digit()
        || c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(
            c,
            '\u{2013}' | '\u{2014}' | '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}'
                | '\u{2026}' | '\u{20B9}'
        )
}

/// Classify the input by the scripts its letters belong to.
///
/// Neutral characters (digits, whitespace, punctuation, the rupee sign)
/// never affect the verdict; a single character from an unknown script
/// makes the whole input unsupported.
pub fn classify_script(text: &str) -> ScriptClass {
    let mut saw_latin = false;
    let mut saw_devanagari = false;

    for c in text.chars() {
        if is_neutral(c) {
            continue;
        }
        if is_devanagari(c) {
            saw_devanagari = true;
        } else if is_latin_letter(c) {
            saw_latin = true;
        } else {
            return ScriptClass::Unsupported;
        }
    }

    match (saw_latin, saw_devanagari) {
        (true, true) => ScriptClass::Mixed,
        (false, true) => ScriptClass::Devanagari,
        _ => ScriptClass::Latin,
    }
}

static BRACKET_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]]*\]").unwrap());
static MARKUP_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[✅ℹ️🔍⚠️💡🤖🧑*●#=_`>|~-]").unwrap());
static WHITESPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip markup and decoration that would be read out loud verbatim.
pub fn clean_for_speech(text: &str) -> String {
    let text = BRACKET_TAGS.replace_all(text, "");
    let text = MARKUP_NOISE.replace_all(&text, "");
    WHITESPACE_RUNS.replace_all(&text, " ").trim().to_string()
}

/// Whether the cleaned text is long enough to be worth synthesizing.
pub fn is_speakable(cleaned: &str) -> bool {
    cleaned.chars().count() >= MIN_SPEAKABLE_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_devanagari_accepted() {
        assert_eq!(
            classify_script("मुख्यमंत्री योजना काय आहे?"),
            ScriptClass::Devanagari
        );
    }

    #[test]
    fn test_latin_accepted() {
        assert_eq!(
            classify_script("Show the main schemes, please."),
            ScriptClass::Latin
        );
    }

    #[test]
    fn test_mixed_accepted() {
        let class = classify_script("PMAY म्हणजे काय?");
        assert_eq!(class, ScriptClass::Mixed);
        assert!(class.is_supported());
    }

    #[test]
    fn test_cyrillic_rejected() {
        assert_eq!(classify_script("Что это такое?"), ScriptClass::Unsupported);
    }

    #[test]
    fn test_digits_and_punctuation_are_neutral() {
        assert_eq!(classify_script("12,500 (2024)!"), ScriptClass::Latin);
    }

    #[test]
    fn test_clean_for_speech() {
        let cleaned = clean_for_speech("✅ **Answer:** [Cached] योजना ● available\n\n  now");
        assert_eq!(cleaned, "Answer: योजना available now");
    }

    #[test]
    fn test_speakable_threshold() {
        assert!(!is_speakable("ok"));
        assert!(is_speakable("नमस्ते आपण"));
    }
}
