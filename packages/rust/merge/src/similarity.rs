//! Content similarity between tool outputs.

/// Above this many characters, bigram overlap replaces edit distance.
const LONG_TEXT_CHARS: usize = 2_000;

/// Collapse whitespace runs so layout noise does not count as disagreement.
fn canonical(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in [0,1]; 1 means identical after whitespace normalization.
///
/// Short content uses normalized Levenshtein distance. Long content uses the
/// Sørensen–Dice bigram coefficient, which is linear in input size.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (canonical(a), canonical(b));
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let longest = a.chars().count().max(b.chars().count());
    let s = if longest > LONG_TEXT_CHARS {
        strsim::sorensen_dice(&a, &b)
    } else {
        strsim::normalized_levenshtein(&a, &b)
    };
    s.clamp(0.0, 1.0)
}

/// Highest similarity between `content` and any of `others`.
pub fn best_agreement<'a>(content: &str, others: impl IntoIterator<Item = &'a str>) -> Option<f64> {
    others
        .into_iter()
        .map(|o| similarity(content, o))
        .max_by(|a, b| a.total_cmp(b))
}
