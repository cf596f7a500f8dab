use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::wal::record::{LabelSet, RefSeries, SeriesRef};

/// Maps WAL series references to their label sets, remembering the segment
/// each reference was last seen in so stale ones can be dropped once the
/// WAL reclaims their segments.
#[derive(Default)]
pub struct SeriesCache {
    series: RwLock<HashMap<SeriesRef, CachedSeries>>,
}

struct CachedSeries {
    labels: LabelSet,
    segment: i64,
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or refreshes) each series as seen in `segment`.
    pub fn store(&self, series: &[RefSeries], segment: i64) {
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        for s in series {
            map.insert(
                s.series_ref,
                CachedSeries {
                    labels: s.labels.clone(),
                    segment,
                },
            );
        }
    }

    pub fn get(&self, series_ref: SeriesRef) -> Option<LabelSet> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&series_ref)
            .map(|s| s.labels.clone())
    }

    /// Forgets every series last seen in `segment` or earlier. Returns how
    /// many were removed.
    pub fn reset(&self, segment: i64) -> usize {
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, s| s.segment > segment);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
