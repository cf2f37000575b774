use std::collections::HashSet;
use std::sync::OnceLock;

/// Arabic stopwords, including common prefixed variants, as a JSON array.
const STOPWORDS_JSON: &str = include_str!("../assets/stopwords.json");

fn stopwords() -> &'static HashSet<&'static str> {
    static STOPWORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOPWORDS.get_or_init(|| {
        serde_json::from_str::<Vec<&str>>(STOPWORDS_JSON)
            .expect("embedded stopword list is valid JSON")
            .into_iter()
            .collect()
    })
}

/// Arabic harakat and related combining marks, plus tatweel.
fn is_diacritic(c: char) -> bool {
    matches!(
        c,
        '\u{064B}'..='\u{0652}' // fathatan through sukun
        | '\u{0670}' // superscript alef
        | '\u{0653}'..='\u{0655}' // madda, hamza above, hamza below
        | '\u{0640}' // tatweel
    )
}

fn is_arabic_letter(c: char) -> bool {
    matches!(c, '\u{0621}'..='\u{064A}' | '\u{0671}')
}

/// Strip diacritics, drop everything but Arabic letters, digits, and
/// whitespace.
fn clean_arabic(s: &str) -> String {
    s.chars()
        .filter(|c| !is_diacritic(*c))
        .filter(|c| is_arabic_letter(*c) || c.is_numeric() || c.is_whitespace())
        .collect()
}

/// Normalize a lexical search query: clean the text, then drop whole-word
/// stopwords. Stopwords merged into larger words stay untouched.
pub fn clean_and_filter_stopwords(s: &str) -> String {
    clean_arabic(s)
        .split_whitespace()
        .filter(|word| !stopwords().contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}
