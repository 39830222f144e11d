use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use noio_backend::elastic::render_request;
use noio_backend::{connect, Corpus};
use noio_cache::MetadataCache;
use noio_core::config::{expand_path, BackendKind, Config, Settings};
use noio_core::fingerprint::fingerprint;
use noio_core::traits::{EmbedPurpose, Embedder};
use noio_core::types::{hit_count, top_hits, SearchHit};
use noio_core::{ModeSelection, SearchMode};
use noio_embed::get_default_embedder;
use noio_query::{QueryBuilder, QueryParams};
use noio_search::{Reranker, SearchOrchestrator, SearchRequest};

#[derive(Parser)]
#[command(name = "noio", about = "Hybrid lexical and semantic search over Hawaiian-language texts")]
struct Cli {
    /// Corpus JSON files or directories for the in-memory backend.
    #[arg(long, global = true)]
    corpus: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a search and print grouped results.
    Search(SearchArgs),
    /// Print the Elasticsearch request a mode would send.
    Query(QueryArgs),
}

#[derive(clap::Args)]
struct SearchArgs {
    #[arg(required = true)]
    query: Vec<String>,
    /// A mode name or `all`; unknown names fall back to `match`.
    #[arg(long, short, default_value = "match")]
    mode: String,
    #[arg(long)]
    max_results: Option<usize>,
    #[arg(long)]
    snippet_size: Option<usize>,
    #[arg(long)]
    fragments: Option<usize>,
    #[arg(long)]
    threshold: Option<f32>,
    #[arg(long)]
    k: Option<usize>,
    #[arg(long)]
    quality_weight: Option<f32>,
    /// Show per-hit metrics.
    #[arg(long)]
    metrics: bool,
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args)]
struct QueryArgs {
    #[arg(required = true)]
    query: Vec<String>,
    #[arg(long, short, default_value = "match")]
    mode: String,
    #[arg(long)]
    k: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let settings = config.settings()?;
    tracing::debug!(env = config.env_name(), "configuration loaded");

    match cli.command {
        Command::Search(args) => run_search(&settings, &cli.corpus, args),
        Command::Query(args) => run_query(&settings, args),
    }
}

fn run_search(settings: &Settings, corpus_paths: &[PathBuf], args: SearchArgs) -> anyhow::Result<()> {
    let embedder: Arc<dyn Embedder> = Arc::from(get_default_embedder(&settings.embed)?);

    let corpus = match settings.backend.kind {
        BackendKind::Memory => {
            let mut corpus = load_corpora(&corpus_inputs(settings, corpus_paths))?;
            prepare_corpus(&mut corpus, embedder.as_ref())?;
            corpus
        }
        BackendKind::Elasticsearch => Corpus::default(),
    };
    let connection = connect(&settings.backend, corpus)?;

    let mut request = SearchRequest::from_settings(args.query.join(" "), ModeSelection::parse_or_default(&args.mode), &settings.search);
    if let Some(n) = args.max_results {
        request.max_results = n;
    }
    if let Some(n) = args.snippet_size {
        request.snippet_size = n;
    }
    if let Some(n) = args.fragments {
        request.num_fragments = n;
    }
    if let Some(t) = args.threshold {
        request.similarity_threshold = t;
    }
    request.k = args.k;

    let reranker = Reranker::new(args.quality_weight.unwrap_or(settings.search.quality_weight))?;
    let mut cache = MetadataCache::from_settings(connection.store.clone(), &settings.cache)?;
    let orchestrator =
        SearchOrchestrator::new(embedder, connection.gateway.clone()).with_sentence_expansion(settings.search.expand_sentence_hits);

    let hits = orchestrator.search_reranked(&request, &reranker, &mut cache)?;
    tracing::info!(query = %request.query, sources = hits.len(), hits = hit_count(&hits), "search complete");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        print_hits(&top_hits(&hits, request.max_results), args.metrics);
    }
    cache.finish()?;
    Ok(())
}

fn run_query(settings: &Settings, args: QueryArgs) -> anyhow::Result<()> {
    let embedder: Arc<dyn Embedder> = Arc::from(get_default_embedder(&settings.embed)?);
    let builder = QueryBuilder::new(embedder);
    let params = QueryParams {
        k: args.k,
        candidate_multiplier: Some(settings.search.candidate_multiplier),
        similarity_threshold: settings.search.similarity_threshold,
    };
    let query = builder.build(SearchMode::parse_or_default(&args.mode), &args.query.join(" "), &params)?;
    println!("{}", serde_json::to_string_pretty(&render_request(&query))?);
    Ok(())
}

fn corpus_inputs(settings: &Settings, cli_paths: &[PathBuf]) -> Vec<PathBuf> {
    if !cli_paths.is_empty() {
        return cli_paths.to_vec();
    }
    settings.backend.corpus_path.iter().map(expand_path).collect()
}

/// Load every `.json` file under the given files or directories into one corpus.
fn load_corpora(paths: &[PathBuf]) -> anyhow::Result<Corpus> {
    let mut corpus = Corpus::default();
    if paths.is_empty() {
        tracing::warn!("no corpus given; the in-memory backend is empty");
    }
    for root in paths {
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if entry.file_type().is_file() && is_json(entry.path()) {
                let part = Corpus::load(entry.path()).with_context(|| format!("loading {}", entry.path().display()))?;
                tracing::info!(path = %entry.path().display(), documents = part.documents.len(), "loaded corpus file");
                corpus.merge(part);
            }
        }
    }
    Ok(corpus)
}

fn is_json(path: &Path) -> bool { path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("json")) }

/// Fill in missing document and sentence vectors and sentence fingerprints.
fn prepare_corpus(corpus: &mut Corpus, embedder: &dyn Embedder) -> anyhow::Result<()> {
    let pending = corpus
        .documents
        .iter()
        .filter(|d| d.text_vector.is_none() || d.sentences.iter().any(|s| s.vector.is_none()))
        .count();
    let pb = ProgressBar::new(pending as u64);
    pb.set_style(ProgressStyle::with_template("{spinner} embedding [{bar:40}] {pos}/{len} {msg}")?.progress_chars("=> "));

    for doc in &mut corpus.documents {
        let needs_work = doc.text_vector.is_none() || doc.sentences.iter().any(|s| s.vector.is_none());
        if doc.text_vector.is_none() && !doc.text.is_empty() {
            doc.text_vector = Some(embedder.embed(&doc.text, EmbedPurpose::Passage)?);
        }
        for sentence in &mut doc.sentences {
            if sentence.vector.is_none() {
                sentence.vector = Some(embedder.embed(&sentence.text, EmbedPurpose::Passage)?);
            }
            if sentence.fingerprint.is_none() {
                sentence.fingerprint = Some(fingerprint(&sentence.text));
            }
        }
        if needs_work {
            pb.inc(1);
        }
    }
    pb.finish_and_clear();
    Ok(())
}

fn print_hits(hits: &[&SearchHit], with_metrics: bool) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        match hit.combined_score {
            Some(c) => println!("{}. {} [{}] score={:.4} combined={:.4}", i + 1, hit.source_name, hit.mode, hit.score, c),
            None => println!("{}. {} [{}] score={:.4}", i + 1, hit.source_name, hit.mode, hit.score),
        }
        for snippet in &hit.snippets {
            println!("     {snippet}");
        }
        if with_metrics {
            let m = &hit.metrics;
            let show = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
            println!(
                "     length={} matches={} cosine={}",
                show(m.snippet_length.map(|v| v.to_string())),
                show(m.token_matches.map(|v| v.to_string())),
                show(m.cosine_score.map(|v| format!("{v:.4}"))),
            );
        }
    }
}
