//! Text normalization for search-friendly catalog fields.
//!
//! Keyword expansion is a recall booster, not a stemmer: it happily produces
//! variants like `tubos`/`tubo` as well as nonsense ones like `gass`.

use std::collections::BTreeSet;

/// Tokens that never become keywords. Matched after normalization, so entries
/// are lowercase and accent-free.
const STOPWORDS: &[&str] = &[
    // es
    "al", "con", "como", "cual", "cuando", "de", "del", "desde", "donde", "el", "en", "entre",
    "esa", "esas", "ese", "eso", "esos", "esta", "estas", "este", "esto", "estos", "hasta",
    "hay", "la", "las", "lo", "los", "mas", "muy", "otra", "otras", "otro", "otros", "para",
    "pero", "por", "que", "sin", "sobre", "son", "sus", "tambien", "todo", "todos", "una",
    "unas", "uno", "unos", "y",
    // en
    "and", "are", "for", "from", "the", "this", "that", "with", "without",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Lowercase, fold diacritics, collapse whitespace and trim.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    text.to_lowercase()
        .chars()
        .filter_map(fold_diacritic)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map an accented letter to its base letter. Standalone combining marks are
/// dropped so decomposed input folds the same way as precomposed input.
fn fold_diacritic(c: char) -> Option<char> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        '\u{0300}'..='\u{036f}' => return None,
        other => other,
    };
    Some(folded)
}

/// Derive the keyword set for a description.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    let normalized = normalize(text);
    let mut keywords = BTreeSet::new();

    for token in normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .filter(|t| !is_stopword(t))
    {
        let companion = plural_companion(token);
        if !is_stopword(&companion) {
            keywords.insert(companion);
        }
        keywords.insert(token.to_string());
    }

    keywords
}

fn plural_companion(token: &str) -> String {
    match token.strip_suffix('s') {
        Some(singular) if token.chars().count() > 3 => singular.to_string(),
        _ => format!("{token}s"),
    }
}
