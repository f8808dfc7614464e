//! Word splitting and approximate word matching for `matches`.

use std::collections::BTreeSet;

/// Words of `text` worth indexing: lowercase alphanumeric runs longer than
/// two characters, deduplicated.
pub fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Decides whether an indexed word satisfies a query word.
///
/// Results are always ordered by message number, never by score, so a
/// scorer only accepts or rejects.
pub trait Scorer: Send + Sync {
    fn accepts(&self, query: &str, candidate: &str) -> bool;
}

/// Accepts exact words, words containing the query word, long words the
/// query word contains, and words within a bounded edit distance of it.
#[derive(Debug, Clone, Copy)]
pub struct FuzzyScorer {
    pub max_distance: usize,
    /// Query words shorter than this must match exactly or as substrings.
    /// Candidates shorter than this never match as parts of the query.
    pub min_fuzzy_len: usize,
}

impl Default for FuzzyScorer {
    fn default() -> Self {
        Self {
            max_distance: 1,
            min_fuzzy_len: 5,
        }
    }
}

impl Scorer for FuzzyScorer {
    fn accepts(&self, query: &str, candidate: &str) -> bool {
        if candidate == query || candidate.contains(query) {
            return true;
        }
        if candidate.chars().count() >= self.min_fuzzy_len && query.contains(candidate) {
            return true;
        }
        let query: Vec<char> = query.chars().collect();
        query.len() >= self.min_fuzzy_len
            && levenshtein_within(&query, candidate, self.max_distance).is_some()
    }
}

/// Edit distance between `needle` and `value`, or `None` once it is known
/// to exceed `max`.
fn levenshtein_within(needle: &[char], value: &str, max: usize) -> Option<usize> {
    let value: Vec<char> = value.chars().collect();
    if value.len().abs_diff(needle.len()) > max {
        return None;
    }
    let mut previous: Vec<usize> = (0..=needle.len()).collect();
    let mut current = vec![0usize; needle.len() + 1];
    for (i, vc) in value.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, nc) in needle.iter().enumerate() {
            let cost = usize::from(vc != nc);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut previous, &mut current);
    }
    let distance = previous[needle.len()];
    (distance <= max).then_some(distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation_and_drops_short_words() {
        let found: Vec<String> = words("Hi, some TEXT to index! text?").into_iter().collect();
        assert_eq!(found, vec!["index", "some", "text"]);
    }

    #[test]
    fn keeps_unicode_words() {
        assert!(words("привет мир").contains("привет"));
    }

    #[test]
    fn fuzzy_scorer_accepts_near_misses_only_for_long_words() {
        let scorer = FuzzyScorer::default();
        assert!(scorer.accepts("text", "text"));
        assert!(scorer.accepts("text", "texts"), "substring");
        assert!(scorer.accepts("index", "indx"), "one deletion");
        assert!(scorer.accepts("lunch", "lunck"), "one substitution");
        assert!(!scorer.accepts("lunch", "bunco"), "two edits");
        assert!(!scorer.accepts("cat", "cot"), "short words are exact");
    }

    #[test]
    fn fuzzy_scorer_accepts_long_words_inside_the_query() {
        let scorer = FuzzyScorer::default();
        assert!(scorer.accepts("lunchbox", "lunch"));
        assert!(scorer.accepts("reindexing", "index"));
        assert!(!scorer.accepts("hello", "ell"), "short candidates stay out");
        assert!(!scorer.accepts("textbook", "text"), "below the fuzzy length");
    }

    #[test]
    fn levenshtein_bails_out_early() {
        let needle: Vec<char> = "kitten".chars().collect();
        assert_eq!(levenshtein_within(&needle, "sitting", 3), Some(3));
        assert_eq!(levenshtein_within(&needle, "sitting", 2), None);
    }
}
