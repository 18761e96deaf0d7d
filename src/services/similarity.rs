//! Fuzzy label matching shared by extraction and calibration.

/// Lowercase, collapse runs of whitespace, strip trailing colons.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(':')
        .trim()
        .to_string()
}

/// Classic edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Similarity in 0.0..=1.0 between two labels after normalization.
///
/// Exact match scores 1.0. When one side contains the other the score is at
/// least 0.7, so "First Name" still matches a key printed as "First Name (Given)".
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let longest = a.chars().count().max(b.chars().count()) as f64;
    let ratio = 1.0 - levenshtein(&a, &b) as f64 / longest;
    if a.contains(&b) || b.contains(&a) {
        ratio.max(0.7)
    } else {
        ratio.max(0.0)
    }
}

/// Label matcher with a fixed acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct LabelMatcher {
    pub min_similarity: f64,
}

impl Default for LabelMatcher {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
        }
    }
}

impl LabelMatcher {
    pub fn new(min_similarity: f64) -> Self {
        Self { min_similarity }
    }

    /// Similarity score when it clears the threshold.
    pub fn score(&self, expected: &str, observed: &str) -> Option<f64> {
        let score = similarity(expected, observed);
        (score >= self.min_similarity).then_some(score)
    }

    /// Best-scoring candidate; ties keep the earliest.
    pub fn best<'a, T>(
        &self,
        expected: &str,
        candidates: impl IntoIterator<Item = &'a T>,
        text_of: impl Fn(&T) -> &str,
    ) -> Option<(&'a T, f64)>
    where
        T: 'a,
    {
        let mut best: Option<(&'a T, f64)> = None;
        for candidate in candidates {
            if let Some(score) = self.score(expected, text_of(candidate)) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((candidate, score));
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(normalize("  First   NAME: "), "first name");
        assert_eq!(similarity("First Name", "first  name:"), 1.0);
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn containment_scores_at_least_point_seven() {
        assert!(similarity("Age", "Age (in years)") >= 0.7);
        assert_eq!(similarity("", "Age"), 0.0);
    }

    #[test]
    fn matcher_rejects_unrelated_keys() {
        let matcher = LabelMatcher::default();
        assert!(matcher.score("First Name", "Date of Birth").is_none());
        assert!(matcher.score("First Name", "Frist Name").is_some());
    }

    #[test]
    fn best_prefers_higher_score() {
        let matcher = LabelMatcher::default();
        let keys = vec!["Last Name".to_string(), "First Name".to_string()];
        let (hit, score) = matcher.best("first name", &keys, |k| k.as_str()).unwrap();
        assert_eq!(hit, "First Name");
        assert_eq!(score, 1.0);
    }
}
