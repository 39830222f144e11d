//! Retrieval modes.
//!
//! The set of modes is closed. Parsing an unknown name is an explicit error
//! (`FromStr`); callers that want the lenient behaviour use
//! [`SearchMode::parse_or_default`], which falls back to [`SearchMode::Match`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Match,
    Term,
    Phrase,
    Regexp,
    Wildcard,
    Vector,
    Hybrid,
    #[serde(rename = "vectorsentence")]
    VectorSentence,
    #[serde(rename = "hybridsentence")]
    HybridSentence,
    Knn,
    #[serde(rename = "matchsentence_all")]
    MatchSentenceAll,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown search mode: {0:?}")]
pub struct UnknownMode(pub String);

impl SearchMode {
    /// Every mode, in the order `all` runs them.
    pub const ALL: [SearchMode; 11] = [
        SearchMode::Match,
        SearchMode::Term,
        SearchMode::Phrase,
        SearchMode::Regexp,
        SearchMode::Wildcard,
        SearchMode::Vector,
        SearchMode::Hybrid,
        SearchMode::VectorSentence,
        SearchMode::HybridSentence,
        SearchMode::Knn,
        SearchMode::MatchSentenceAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Match => "match",
            SearchMode::Term => "term",
            SearchMode::Phrase => "phrase",
            SearchMode::Regexp => "regexp",
            SearchMode::Wildcard => "wildcard",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
            SearchMode::VectorSentence => "vectorsentence",
            SearchMode::HybridSentence => "hybridsentence",
            SearchMode::Knn => "knn",
            SearchMode::MatchSentenceAll => "matchsentence_all",
        }
    }

    /// Parse a mode name, degrading to `Match` for anything unrecognised.
    pub fn parse_or_default(name: &str) -> SearchMode {
        match name.parse() {
            Ok(mode) => mode,
            Err(UnknownMode(name)) => {
                tracing::warn!(mode = %name, "unknown search mode, using match");
                SearchMode::Match
            }
        }
    }

    pub fn is_lexical(&self) -> bool {
        matches!(self, SearchMode::Match | SearchMode::Term | SearchMode::Phrase | SearchMode::Regexp | SearchMode::Wildcard)
    }

    /// Modes whose query embeds the query text.
    pub fn uses_vector(&self) -> bool {
        matches!(
            self,
            SearchMode::Vector | SearchMode::Hybrid | SearchMode::VectorSentence | SearchMode::HybridSentence | SearchMode::Knn
        )
    }

    /// Modes whose results are individual sentences and can be reranked.
    pub fn is_sentence_level(&self) -> bool {
        matches!(self, SearchMode::VectorSentence | SearchMode::HybridSentence)
    }

    /// Modes whose raw score carries a `+1.0` cosine offset that metrics undo.
    pub fn reports_cosine(&self) -> bool {
        matches!(self, SearchMode::Vector | SearchMode::Hybrid | SearchMode::Knn)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for SearchMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SearchMode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// Either a single mode or every mode at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    All,
    Single(SearchMode),
}

impl ModeSelection {
    pub fn modes(&self) -> Vec<SearchMode> {
        match self {
            ModeSelection::All => SearchMode::ALL.to_vec(),
            ModeSelection::Single(mode) => vec![*mode],
        }
    }

    /// `all` or any mode name; unknown names degrade to `match`.
    pub fn parse_or_default(name: &str) -> ModeSelection {
        if name.trim().eq_ignore_ascii_case("all") {
            ModeSelection::All
        } else {
            ModeSelection::Single(SearchMode::parse_or_default(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for mode in SearchMode::ALL {
            assert_eq!(mode.as_str().parse::<SearchMode>(), Ok(mode));
        }
        assert_eq!("HybridSentence".parse::<SearchMode>(), Ok(SearchMode::HybridSentence));
    }

    #[test]
    fn unknown_mode_is_an_error_but_lenient_parse_falls_back() {
        assert_eq!("fuzzy".parse::<SearchMode>(), Err(UnknownMode("fuzzy".to_string())));
        assert_eq!(SearchMode::parse_or_default("fuzzy"), SearchMode::Match);
        assert_eq!(ModeSelection::parse_or_default("ALL"), ModeSelection::All);
        assert_eq!(ModeSelection::parse_or_default("nope"), ModeSelection::Single(SearchMode::Match));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&SearchMode::MatchSentenceAll).unwrap();
        assert_eq!(json, "\"matchsentence_all\"");
        let back: SearchMode = serde_json::from_str("\"vectorsentence\"").unwrap();
        assert_eq!(back, SearchMode::VectorSentence);
    }
}
