//! Near-duplicate matching between a reference set and a working set.

mod compare;
mod fields;

pub use compare::{match_hashes, Strategy};
pub use fields::{FieldValue, FsMetadata, MetadataSource};

use crate::cache::{CacheLookup, HashCache};
use crate::config::Config;
use crate::hash::{hash_bits_for, HashBits, HashPool, ImageHasher};
use crate::index::DirectoryIndex;
use crate::paths::canonical_path;
use crate::LookalikeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// How two files are judged to be the same image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum MatchCriteria {
    /// Perceptual dhash within a similarity threshold (percent)
    Hash {
        hash_size: u32,
        similarity_percent: f64,
    },
    /// Exact equality on every listed metadata field
    Fields { fields: Vec<String> },
}

impl MatchCriteria {
    pub fn hash(hash_size: u32, similarity_percent: f64) -> Self {
        Self::Hash {
            hash_size,
            similarity_percent,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self {
            Self::Hash {
                hash_size,
                similarity_percent,
            } => {
                if !(2..=64).contains(hash_size) {
                    return Err(LookalikeError::InvalidCriteria(format!(
                        "hash_size must be between 2 and 64, got {hash_size}"
                    )));
                }
                if !similarity_percent.is_finite() || !(0.0..=100.0).contains(similarity_percent) {
                    return Err(LookalikeError::InvalidCriteria(format!(
                        "similarity must be between 0 and 100, got {similarity_percent}"
                    )));
                }
            }
            Self::Fields { fields } => {
                if fields.iter().all(|f| f.trim().is_empty()) {
                    return Err(LookalikeError::InvalidCriteria(
                        "at least one field is required".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Largest Hamming distance that still counts as a match
pub fn max_distance(hash_size: u32, similarity_percent: f64) -> u32 {
    let bits = hash_bits_for(hash_size);
    let d = ((1.0 - similarity_percent / 100.0) * bits as f64).round();
    (d.max(0.0) as u32).min(bits)
}

/// Why a pair matched
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MatchTag {
    Dhash { distance: u32, similarity: f64 },
    Fields { fields: Vec<String> },
}

impl fmt::Display for MatchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchTag::Dhash { similarity, .. } => write!(f, "dhash({similarity:.1}%)"),
            MatchTag::Fields { fields } => write!(f, "fields({})", fields.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchPair {
    pub reference: PathBuf,
    pub work: PathBuf,
    pub tag: MatchTag,
}

/// Counters describing how a hash-mode search resolved its inputs
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchStats {
    /// Distinct files after path normalization
    pub files: usize,
    pub cached: usize,
    pub computed: usize,
    pub unreadable: usize,
    pub timed_out: usize,
    pub bucketed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    pub matches: Vec<MatchPair>,
    pub unique_ref: Vec<PathBuf>,
    pub unique_work: Vec<PathBuf>,
    pub stats: MatchStats,
}

pub struct MatchingEngine {
    cache: HashCache,
    index: DirectoryIndex,
    pool: HashPool,
    metadata: Arc<dyn MetadataSource>,
    default_prefix_bits: u32,
    bucket_threshold: usize,
}

impl MatchingEngine {
    pub fn new(cache: HashCache, hasher: Arc<dyn ImageHasher>, config: &Config) -> crate::Result<Self> {
        let pool = HashPool::from_config(hasher, config)?;
        let index = DirectoryIndex::new(Arc::clone(cache.store()))
            .with_defaults(config.index.prefix_bits, config.index.batch_size);
        Ok(Self {
            cache,
            index,
            pool,
            metadata: Arc::new(FsMetadata),
            default_prefix_bits: config.index.prefix_bits,
            bucket_threshold: config.index.bucket_threshold,
        })
    }

    /// Replace the metadata source used by field matching
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Find every matching (reference, work) pair and the files on each side
    /// that match nothing. Invalid criteria is the only error.
    pub fn find_matches(
        &self,
        reference: &[PathBuf],
        work: &[PathBuf],
        criteria: &MatchCriteria,
    ) -> crate::Result<MatchOutcome> {
        criteria.validate()?;
        match criteria {
            MatchCriteria::Hash {
                hash_size,
                similarity_percent,
            } => Ok(self.match_by_hash(reference, work, *hash_size, *similarity_percent)),
            MatchCriteria::Fields { fields } => Ok(self.match_by_fields(reference, work, fields)),
        }
    }

    fn match_by_hash(
        &self,
        reference: &[PathBuf],
        work: &[PathBuf],
        hash_size: u32,
        similarity_percent: f64,
    ) -> MatchOutcome {
        // Each distinct canonical file is hashed once
        let mut files: Vec<PathBuf> = Vec::new();
        let mut slot_of: HashMap<PathBuf, usize> = HashMap::new();
        let mut slots = |paths: &[PathBuf]| -> Vec<usize> {
            paths
                .iter()
                .map(|p| {
                    let canonical = canonical_path(p);
                    *slot_of.entry(canonical.clone()).or_insert_with(|| {
                        files.push(canonical);
                        files.len() - 1
                    })
                })
                .collect()
        };
        let ref_slots = slots(reference);
        let work_slots = slots(work);

        let (hashes, mut stats) = self.resolve_hashes(&files, hash_size);
        let ref_hashes: Vec<Option<&HashBits>> =
            ref_slots.iter().map(|&s| hashes[s].as_ref()).collect();
        let work_hashes: Vec<Option<&HashBits>> =
            work_slots.iter().map(|&s| hashes[s].as_ref()).collect();

        let max_distance = max_distance(hash_size, similarity_percent);
        let strategy = if reference.len() > self.bucket_threshold || work.len() > self.bucket_threshold {
            stats.bucketed = true;
            Strategy::Bucketed {
                prefix_bits: self.prefix_bits_for(&files, &ref_slots, &work_slots),
            }
        } else {
            Strategy::Full
        };

        let bits = hash_bits_for(hash_size) as f64;
        let pairs = match_hashes(&ref_hashes, &work_hashes, max_distance, strategy);
        debug!(
            pairs = pairs.len(),
            max_distance,
            ?strategy,
            "hash comparison finished"
        );

        let matches = pairs
            .iter()
            .map(|&(ri, wi, distance)| MatchPair {
                reference: reference[ri].clone(),
                work: work[wi].clone(),
                tag: MatchTag::Dhash {
                    distance,
                    similarity: 100.0 * (1.0 - distance as f64 / bits),
                },
            })
            .collect();
        let (unique_ref, unique_work) =
            uniques(reference, work, pairs.iter().map(|&(ri, wi, _)| (ri, wi)));

        MatchOutcome {
            matches,
            unique_ref,
            unique_work,
            stats,
        }
    }

    /// Cached hashes first, then the pool for the rest. Freshly computed
    /// results are written back; timeouts are not.
    fn resolve_hashes(&self, files: &[PathBuf], hash_size: u32) -> (Vec<Option<HashBits>>, MatchStats) {
        let mut stats = MatchStats {
            files: files.len(),
            ..MatchStats::default()
        };
        let mut hashes: Vec<Option<HashBits>> = vec![None; files.len()];
        let mut missing: Vec<usize> = Vec::new();

        for (i, lookup) in self.cache.lookup_many(files, hash_size).into_iter().enumerate() {
            match lookup {
                CacheLookup::Hit(bits) => {
                    stats.cached += 1;
                    hashes[i] = Some(bits);
                }
                CacheLookup::Unreadable => stats.unreadable += 1,
                CacheLookup::Miss => missing.push(i),
            }
        }

        if missing.is_empty() {
            return (hashes, stats);
        }

        let paths: Vec<PathBuf> = missing.iter().map(|&i| files[i].clone()).collect();
        let mut to_store: Vec<(PathBuf, Option<HashBits>)> = Vec::with_capacity(paths.len());
        let result = self.pool.hash_all(&paths, hash_size, |j, result| {
            let i = missing[j];
            match result {
                Ok(bits) => {
                    stats.computed += 1;
                    to_store.push((files[i].clone(), Some(bits.clone())));
                    hashes[i] = Some(bits);
                }
                Err(e) if e.is_persistent() => {
                    debug!(path = %files[i].display(), error = %e, "image cannot be hashed");
                    stats.unreadable += 1;
                    to_store.push((files[i].clone(), None));
                }
                Err(e) => {
                    debug!(path = %files[i].display(), error = %e, "hash skipped");
                    stats.timed_out += 1;
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "hashing pool failed");
        }

        if let Err(e) = self.cache.set_many(&to_store, hash_size) {
            warn!(error = %e, "failed to cache computed hashes");
        }
        debug!(
            files = stats.files,
            cached = stats.cached,
            computed = stats.computed,
            unreadable = stats.unreadable,
            "resolved hashes"
        );
        (hashes, stats)
    }

    /// Indexed files in one tracked directory that look like `path`, closest
    /// first. Only records sharing the query image's stored prefix are fetched:
    /// files that differ inside the prefix bits are not found.
    pub fn find_in_directory(
        &self,
        path: &Path,
        directory_id: i64,
        hash_size: u32,
        similarity_percent: f64,
        limit: usize,
    ) -> crate::Result<Vec<MatchPair>> {
        MatchCriteria::hash(hash_size, similarity_percent).validate()?;
        let dir = self.index.get_directory(directory_id)?;
        let query_path = canonical_path(path);
        let (mut hashes, _) = self.resolve_hashes(std::slice::from_ref(&query_path), hash_size);
        let Some(query) = hashes.pop().flatten() else {
            debug!(path = %path.display(), "query image has no hash");
            return Ok(Vec::new());
        };

        let max_distance = max_distance(hash_size, similarity_percent);
        let bits = hash_bits_for(hash_size) as f64;
        let mut found: Vec<MatchPair> = self
            .index
            .candidates_by_prefix(directory_id, query.prefix(dir.prefix_bits), limit)?
            .into_iter()
            .filter(|rec| rec.path != query_path && rec.hash_size == hash_size)
            .filter_map(|rec| {
                let distance = query.hamming_distance(rec.hash.as_ref()?);
                (distance <= max_distance).then(|| MatchPair {
                    reference: rec.path,
                    work: path.to_path_buf(),
                    tag: MatchTag::Dhash {
                        distance,
                        similarity: 100.0 * (1.0 - distance as f64 / bits),
                    },
                })
            })
            .collect();
        found.sort_by_key(|m| match m.tag {
            MatchTag::Dhash { distance, .. } => distance,
            MatchTag::Fields { .. } => 0,
        });
        Ok(found)
    }

    /// Narrower of the two sides' tracked prefix_bits, else the configured default
    fn prefix_bits_for(&self, files: &[PathBuf], ref_slots: &[usize], work_slots: &[usize]) -> u32 {
        let side = |slots: &[usize]| -> Option<u32> {
            let paths: Vec<PathBuf> = slots.iter().map(|&s| files[s].clone()).collect();
            match self.index.prefix_bits_for_paths(&paths) {
                Ok(bits) => bits,
                Err(e) => {
                    warn!(error = %e, "cannot read directory prefix_bits");
                    None
                }
            }
        };
        match (side(ref_slots), side(work_slots)) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => self.default_prefix_bits,
        }
    }

    fn match_by_fields(&self, reference: &[PathBuf], work: &[PathBuf], fields: &[String]) -> MatchOutcome {
        let fields: Vec<String> = fields
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();

        let key_of = |path: &PathBuf| -> Option<Vec<FieldValue>> {
            fields
                .iter()
                .map(|name| self.metadata.get_field(path, name).map(FieldValue::normalized))
                .collect()
        };

        let mut by_key: HashMap<Vec<FieldValue>, Vec<usize>> = HashMap::new();
        for (wi, path) in work.iter().enumerate() {
            if let Some(key) = key_of(path) {
                by_key.entry(key).or_default().push(wi);
            }
        }

        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for (ri, path) in reference.iter().enumerate() {
            let Some(key) = key_of(path) else { continue };
            if let Some(hits) = by_key.get(&key) {
                pairs.extend(hits.iter().map(|&wi| (ri, wi)));
            }
        }

        let matches = pairs
            .iter()
            .map(|&(ri, wi)| MatchPair {
                reference: reference[ri].clone(),
                work: work[wi].clone(),
                tag: MatchTag::Fields {
                    fields: fields.clone(),
                },
            })
            .collect();
        let (unique_ref, unique_work) = uniques(reference, work, pairs.iter().copied());

        MatchOutcome {
            matches,
            unique_ref,
            unique_work,
            stats: MatchStats::default(),
        }
    }
}

/// Inputs on each side that appear in no pair, in input order
fn uniques(
    reference: &[PathBuf],
    work: &[PathBuf],
    pairs: impl Iterator<Item = (usize, usize)>,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut ref_hit = vec![false; reference.len()];
    let mut work_hit = vec![false; work.len()];
    for (ri, wi) in pairs {
        ref_hit[ri] = true;
        work_hit[wi] = true;
    }
    let pick = |paths: &[PathBuf], hit: &[bool]| -> Vec<PathBuf> {
        paths
            .iter()
            .zip(hit)
            .filter(|(_, &h)| !h)
            .map(|(p, _)| p.clone())
            .collect()
    };
    (pick(reference, &ref_hit), pick(work, &work_hit))
}
