//! Nearest-neighbour matching with rejection.

use crate::provider::{features_from_bytes, FaceFeatureProvider, FeatureError};
use crate::templates::TemplateDatabase;
use crate::types::{Embedding, MatchResult};

/// Distance reported when there is nothing to compare against.
const MAX_DISTANCE: f32 = 2.0;

/// Classify a live embedding against an enrolled gallery.
pub trait Matcher {
    fn compare(&self, live: &Embedding, db: &TemplateDatabase, threshold: f32) -> MatchResult;
}

/// Cosine-distance nearest neighbour: `stranger` iff `dmin > threshold`.
///
/// Every template is visited; on equal distances the earliest identity wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, live: &Embedding, db: &TemplateDatabase, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        for (idx, identity) in db.identities().iter().enumerate() {
            let d = live.cosine_distance(&identity.template);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((idx, d));
            }
        }

        match best {
            Some((idx, dmin)) if dmin <= threshold => {
                MatchResult::matched(db.identities()[idx].label.clone(), dmin)
            }
            Some((_, dmin)) => MatchResult::stranger(dmin),
            None => MatchResult::stranger(MAX_DISTANCE),
        }
    }
}

/// Decode → features → compare, for one encoded image.
pub fn recognize<P: FaceFeatureProvider + ?Sized>(
    provider: &mut P,
    bytes: &[u8],
    db: &TemplateDatabase,
    threshold: f32,
) -> Result<MatchResult, FeatureError> {
    let features = features_from_bytes(provider, bytes)?;
    Ok(CosineMatcher.compare(&features.embedding, db, threshold))
}
