//! Text analysis shared by lexical matching and highlighting.

use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, TextAnalyzer, TokenStream};

/// One analysed token with its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub offset_from: usize,
    pub offset_to: usize,
}

fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default()).filter(LowerCaser).build()
}

/// Split on non-alphanumeric characters and lowercase. The ʻokina is a
/// letter, so `ʻāina` stays one token.
pub fn analyze(text: &str) -> Vec<Token> {
    let mut analyzer = analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut out = Vec::new();
    while stream.advance() {
        let t = stream.token();
        out.push(Token { text: t.text.clone(), offset_from: t.offset_from, offset_to: t.offset_to });
    }
    out
}

pub fn terms(text: &str) -> Vec<String> { analyze(text).into_iter().map(|t| t.text).collect() }
