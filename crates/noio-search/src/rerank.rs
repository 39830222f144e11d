//! Quality-weighted reranking of sentence-level hits.
//!
//! `combined = (1 - w) * relevance + w * quality`, where relevance is the raw
//! score and quality is `1 - boilerplate_score` looked up by the fingerprint
//! of the hit's first snippet. Both are divided by their maximum over the
//! result set before mixing.

use noio_core::fingerprint::fingerprint;
use noio_core::traits::MetadataLookup;
use noio_core::types::{HitsBySource, SearchHit};
use noio_core::{Error, Result};

pub const DEFAULT_QUALITY_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct Reranker {
    quality_weight: f32,
}

impl Default for Reranker {
    fn default() -> Self { Self { quality_weight: DEFAULT_QUALITY_WEIGHT } }
}

impl Reranker {
    pub fn new(quality_weight: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&quality_weight) {
            return Err(Error::InvalidConfig(format!("quality_weight must be within [0, 1], got {quality_weight}")));
        }
        Ok(Self { quality_weight })
    }

    pub fn quality_weight(&self) -> f32 { self.quality_weight }

    /// Score every hit and regroup by source. Within a source, hits are in
    /// descending `combined_score` order; equal scores keep their input order.
    pub fn rerank<L>(&self, hits: HitsBySource, metadata: &mut L) -> HitsBySource
    where
        L: MetadataLookup + ?Sized,
    {
        let mut flat: Vec<SearchHit> = hits.into_values().flatten().collect();
        if flat.is_empty() {
            return HitsBySource::new();
        }

        let relevance: Vec<f32> = flat.iter().map(|h| h.score).collect();
        let quality: Vec<f32> = flat.iter().map(|h| quality_of(h, metadata)).collect();
        let relevance = normalize_by_max(&relevance);
        let quality = normalize_by_max(&quality);

        let w = self.quality_weight;
        for (hit, (rel, qual)) in flat.iter_mut().zip(relevance.into_iter().zip(quality)) {
            hit.combined_score = Some((1.0 - w) * rel + w * qual);
        }
        // stable: ties keep input order
        flat.sort_by(|a, b| {
            let (ka, kb) = (a.combined_score.unwrap_or(0.0), b.combined_score.unwrap_or(0.0));
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut out = HitsBySource::new();
        for hit in flat {
            out.entry(hit.source_name.clone()).or_default().push(hit);
        }
        out
    }
}

/// Free-function form of [`Reranker::rerank`] with an explicit weight.
pub fn rerank<L>(hits: HitsBySource, metadata: &mut L, quality_weight: f32) -> Result<HitsBySource>
where
    L: MetadataLookup + ?Sized,
{
    Ok(Reranker::new(quality_weight)?.rerank(hits, metadata))
}

fn quality_of<L: MetadataLookup + ?Sized>(hit: &SearchHit, metadata: &mut L) -> f32 {
    let key = fingerprint(hit.primary_snippet());
    match metadata.lookup(&key) {
        Ok(record) => record.quality(),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "metadata lookup failed; treating quality as 0");
            0.0
        }
    }
}

/// Divide by the maximum; a non-positive maximum zeroes everything.
fn normalize_by_max(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > 0.0 {
        values.iter().map(|v| v / max).collect()
    } else {
        vec![0.0; values.len()]
    }
}
