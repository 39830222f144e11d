use regex::RegexBuilder;

use noio_core::types::Metrics;
use noio_core::SearchMode;

/// Occurrences of the `*`-stripped query as a whole word, case-insensitive,
/// summed over all snippets.
pub fn count_token_matches(snippets: &[String], query_text: &str) -> usize {
    let cleaned = query_text.trim_matches('*');
    if cleaned.trim().is_empty() {
        return 0;
    }
    let pattern = format!(r"\b{}\b", regex::escape(cleaned));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => snippets.iter().map(|s| re.find_iter(s).count()).sum(),
        Err(e) => {
            tracing::debug!(error = %e, "token pattern rejected");
            0
        }
    }
}

/// Undo the `+1.0` offset carried by vector scores, rounded to 4 decimals.
pub fn recover_cosine(score: f32) -> f32 { ((score - 1.0) * 10_000.0).round() / 10_000.0 }

pub fn compute_metrics(snippets: &[String], query_text: &str, mode: SearchMode, score: f32) -> Metrics {
    let Some(first) = snippets.first() else { return Metrics::default() };
    Metrics {
        snippet_length: Some(first.chars().count()),
        token_matches: Some(count_token_matches(snippets, query_text)),
        cosine_score: mode.reports_cosine().then(|| recover_cosine(score)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_whole_words_only() {
        let snippets = vec!["Ka wai, ka WAI.".to_string(), "kahawai wai".to_string()];
        assert_eq!(count_token_matches(&snippets, "wai"), 3);
        assert_eq!(count_token_matches(&snippets, "*wai*"), 3);
        assert_eq!(count_token_matches(&snippets, "**"), 0);
    }

    #[test]
    fn cosine_is_only_reported_for_document_vector_modes() {
        let s = vec!["aloha".to_string()];
        let m = compute_metrics(&s, "aloha", SearchMode::Hybrid, 1.87654);
        assert_eq!(m.snippet_length, Some(5));
        assert_eq!(m.token_matches, Some(1));
        assert!((m.cosine_score.unwrap() - 0.8765).abs() < 1e-6);
        assert_eq!(compute_metrics(&s, "aloha", SearchMode::Match, 3.0).cosine_score, None);
        assert_eq!(compute_metrics(&[], "aloha", SearchMode::Knn, 1.5), Metrics::default());
    }
}
