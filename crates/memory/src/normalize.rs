use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Canonical form of a spoken question: trim, casefold, drop everything that
/// is not alphanumeric or a space, collapse whitespace runs.
///
/// This is the key used for snapshot questions and synonym maps, so two
/// phrasings that differ only in punctuation or case compare equal.
pub fn normalize_question(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if ch.is_whitespace() && !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Filler words stripped when deriving a gist. Spoken input is full of these
/// and they destroy cache-key stability.
const DISFLUENCIES: &[&str] = &[
    "uh", "um", "er", "ah", "hmm", "like", "actually", "basically", "well", "so",
    "you know", "i mean", "kind of", "sort of", "please",
];

/// Derives stable "gist" cache keys from raw transcript text.
///
/// Loads three expansion dictionaries once (punctuation, numbers, domain
/// names; `word = symbol` per line) and keeps the reverse symbol→word
/// mappings. Missing dictionary files degrade to empty maps so the
/// normalizer always works.
#[derive(Debug, Clone, Default)]
pub struct GistNormalizer {
    reverse_punctuation: BTreeMap<String, String>,
    reverse_numbers: BTreeMap<String, String>,
    reverse_domains: BTreeMap<String, String>,
}

impl GistNormalizer {
    pub fn load(dictionary_dir: impl AsRef<Path>) -> Self {
        let dir = dictionary_dir.as_ref();
        let normalizer = Self {
            reverse_punctuation: load_reverse_map(&dir.join("punctuation.map")),
            reverse_numbers: load_reverse_map(&dir.join("numbers.map")),
            reverse_domains: load_reverse_map(&dir.join("domains.map")),
        };
        debug!(
            punctuation = normalizer.reverse_punctuation.len(),
            numbers = normalizer.reverse_numbers.len(),
            domains = normalizer.reverse_domains.len(),
            "gist normalizer dictionaries loaded"
        );
        normalizer
    }

    /// Gist extraction: casefold, drop disfluencies, collapse whitespace.
    pub fn normalized_gist(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let mut working = lowered.trim().to_string();

        // Multi-word fillers first so "you know" is not left half-removed.
        for filler in DISFLUENCIES.iter().filter(|f| f.contains(' ')) {
            working = working.replace(filler, " ");
        }

        let kept = working
            .split_whitespace()
            .map(|token| token.trim_matches(|c: char| c == ',' || c == '.' || c == '?' || c == '!'))
            .filter(|token| !token.is_empty())
            .filter(|token| !DISFLUENCIES.contains(token))
            .collect::<Vec<_>>();

        kept.join(" ")
    }

    /// Expand symbols, digits, and known domains to their spoken-word forms.
    /// Iteration is over sorted maps so results are deterministic.
    pub fn expand_symbols(&self, text: &str) -> String {
        let mut expanded = text.to_string();
        for (symbol, word) in &self.reverse_punctuation {
            // Never expand the space character itself.
            if symbol == " " {
                continue;
            }
            if expanded.contains(symbol.as_str()) {
                expanded = expanded.replace(symbol.as_str(), &format!(" {word} "));
            }
        }
        for (number, word) in &self.reverse_numbers {
            if expanded.contains(number.as_str()) {
                expanded = expanded.replace(number.as_str(), &format!(" {word} "));
            }
        }
        for (domain, word) in &self.reverse_domains {
            if expanded.contains(domain.as_str()) {
                expanded = expanded.replace(domain.as_str(), &format!(" {word} "));
            }
        }
        expanded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Full cache-key normalization: gist first, then optional expansion.
    pub fn normalize_for_cache(&self, text: &str, expand_symbols_to_words: bool) -> String {
        let gist = self.normalized_gist(text);
        if expand_symbols_to_words {
            self.expand_symbols(&gist)
        } else {
            gist
        }
    }
}

/// Read a `word = symbol` dictionary and return the reversed symbol→word map.
/// Lines starting with `#` and malformed lines are skipped.
fn load_reverse_map(path: &Path) -> BTreeMap<String, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), %err, "dictionary missing — using empty map");
            return BTreeMap::new();
        }
    };

    let mut reversed = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((word, symbol)) = line.split_once('=') {
            reversed.insert(
                symbol.trim().to_lowercase(),
                word.trim().to_lowercase(),
            );
        }
    }
    reversed
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── normalize_question ─────────────────────────────────────────────────

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(normalize_question("What is 2 + 2?"), "what is 2 2");
        assert_eq!(normalize_question("  What's   today's DATE? "), "whats todays date");
    }

    #[test]
    fn equivalent_phrasings_share_a_canonical_form() {
        assert_eq!(
            normalize_question("What time is it?"),
            normalize_question("what time is it")
        );
    }

    #[test]
    fn empty_and_symbol_only_input_normalizes_to_empty() {
        assert_eq!(normalize_question(""), "");
        assert_eq!(normalize_question("?!...  "), "");
    }

    // ── GistNormalizer ─────────────────────────────────────────────────────

    #[test]
    fn gist_removes_disfluencies() {
        let normalizer = GistNormalizer::default();
        assert_eq!(
            normalizer.normalized_gist("Um, what is, like, the weather today?"),
            "what is the weather today"
        );
        assert_eq!(
            normalizer.normalized_gist("you know what I mean about rust"),
            "what about rust"
        );
    }

    #[test]
    fn missing_dictionaries_degrade_to_empty_maps() {
        let normalizer = GistNormalizer::load("/nonexistent/dicts");
        // Expansion with empty maps is the identity on word-joined text.
        assert_eq!(normalizer.expand_symbols("a plus b"), "a plus b");
    }

    #[test]
    fn expansion_uses_reverse_mappings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("punctuation.map"),
            "plus = +\ncomma = ,\n# a comment\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("numbers.map"), "two = 2\n").unwrap();

        let normalizer = GistNormalizer::load(dir.path());
        assert_eq!(normalizer.expand_symbols("2 + 2"), "two plus two");
    }

    #[test]
    fn cache_normalization_composes_gist_and_expansion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("numbers.map"), "four = 4\n").unwrap();

        let normalizer = GistNormalizer::load(dir.path());
        assert_eq!(
            normalizer.normalize_for_cache("um what is 4", true),
            "what is four"
        );
        assert_eq!(
            normalizer.normalize_for_cache("um what is 4", false),
            "what is 4"
        );
    }
}
