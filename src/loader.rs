//! Locating and loading the trained model artifact.
//!
//! Candidates are tried in order and the first existing file that
//! deserializes wins. Missing candidates are skipped; a candidate that exists
//! but fails to load is remembered and the search moves on.
//!
//! ```ignore
//! use mining_change::loader::ModelLocator;
//!
//! let model = ModelLocator::with_defaults(Some("runs/latest.bin")).load()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use log::{debug, info, warn};

use crate::config::DEFAULT_MODEL_CANDIDATES;
use crate::error::{Error, Result};
use crate::model::{SharedModel, SiameseModel};

/// Ordered list of model artifact locations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLocator {
    candidates: Vec<PathBuf>,
}

impl ModelLocator {
    pub fn new<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// An explicit path (if any) followed by the default artifact names.
    pub fn with_defaults<P: AsRef<Path>>(explicit: Option<P>) -> Self {
        Self::with_fallbacks(explicit, DEFAULT_MODEL_CANDIDATES.iter().map(PathBuf::from))
    }

    /// An explicit path (if any) followed by `fallbacks`.
    pub fn with_fallbacks<P, I>(explicit: Option<P>, fallbacks: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = PathBuf>,
    {
        let mut candidates: Vec<PathBuf> = explicit
            .map(|p| p.as_ref().to_path_buf())
            .into_iter()
            .collect();
        candidates.extend(fallbacks);
        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Load the first candidate that exists and deserializes.
    pub fn load(&self) -> Result<SiameseModel> {
        self.load_with(|path| SiameseModel::load(path))
    }

    /// Same search as [`load`](Self::load) with a custom deserializer.
    pub fn load_with<T, F>(&self, mut load: F) -> Result<T>
    where
        F: FnMut(&Path) -> Result<T>,
    {
        let mut last_error: Option<(PathBuf, String)> = None;

        for path in &self.candidates {
            if !path.exists() {
                debug!("model candidate {} does not exist", path.display());
                continue;
            }
            match load(path) {
                Ok(model) => {
                    info!("loaded model from {}", path.display());
                    return Ok(model);
                }
                Err(e) => {
                    warn!("failed to load model candidate {}: {e}", path.display());
                    last_error = Some((path.clone(), e.to_string()));
                }
            }
        }

        match last_error {
            Some((path, reason)) => Err(Error::ModelLoad { path, reason }),
            None => Err(Error::ModelNotFound {
                tried: self.candidates.clone(),
            }),
        }
    }
}

fn shared_slot() -> &'static Mutex<Option<SharedModel<SiameseModel>>> {
    static SLOT: OnceLock<Mutex<Option<SharedModel<SiameseModel>>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Process-wide model handle, loaded on first use and reused afterwards.
///
/// The locator is only consulted until a load succeeds; a failed load leaves
/// the slot empty so a later call may retry with a different locator.
/// Concurrent first callers wait for a single load.
pub fn shared_model(locator: &ModelLocator) -> Result<SharedModel<SiameseModel>> {
    load_once(shared_slot(), || locator.load().map(SharedModel::new))
}

/// Fill `slot` from `load` unless it already holds a value. The lock is held
/// across the load.
fn load_once<T, F>(slot: &Mutex<Option<T>>, load: F) -> Result<T>
where
    T: Clone,
    F: FnOnce() -> Result<T>,
{
    // The slot is only written after a successful load, so a poisoned lock
    // still guards a consistent value.
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = guard.as_ref() {
        return Ok(value.clone());
    }
    let value = load()?;
    *guard = Some(value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SiameseModelBuilder;
    use ndarray::Array1;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn write_model(path: &Path) {
        SiameseModelBuilder::new()
            .pool_grid(1)
            .identity_embedding()
            .head(Array1::from_elem(3, 1.0), 0.0)
            .build()
            .unwrap()
            .save(path)
            .unwrap();
    }

    #[test]
    fn skips_missing_candidates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("best_model.keras");
        let present = dir.path().join("best_model.bin");
        let later = dir.path().join("other.bin");
        write_model(&present);
        fs::write(&later, b"never read").unwrap();

        let mut visited = Vec::new();
        let locator = ModelLocator::new([&missing, &present, &later]);
        let found = locator
            .load_with(|path| {
                visited.push(path.to_path_buf());
                SiameseModel::load(path)
            })
            .unwrap();

        assert_eq!(found.pool_grid(), 1);
        assert_eq!(visited, vec![present]);
    }

    #[test]
    fn nothing_found_reports_all_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin.bz2");

        match ModelLocator::new([&a, &b]).load() {
            Err(Error::ModelNotFound { tried }) => assert_eq!(tried, vec![a, b]),
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_candidate_falls_through_to_next() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("best_model.bin");
        let good = dir.path().join("best_model.bin.bz2");
        fs::write(&corrupt, b"\x01\x02garbage").unwrap();
        write_model(&good);

        let model = ModelLocator::new([&corrupt, &good]).load().unwrap();
        assert_eq!(model.embedding_dim(), 3);
    }

    #[test]
    fn only_corrupt_candidates_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("best_model.bin");
        fs::write(&corrupt, b"garbage").unwrap();

        match ModelLocator::new([dir.path().join("missing.bin"), corrupt.clone()]).load() {
            Err(Error::ModelLoad { path, .. }) => assert_eq!(path, corrupt),
            other => panic!("expected ModelLoad, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_first_calls_load_once() {
        let slot = Mutex::new(None);
        let loads = AtomicUsize::new(0);
        let start = Barrier::new(8);

        let values: Vec<u32> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        load_once(&slot, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(42)
                        })
                        .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|&v| v == 42));
    }

    #[test]
    fn failed_load_leaves_slot_empty() {
        let slot = Mutex::new(None);
        let err = load_once(&slot, || Err::<u32, _>(Error::ModelNotFound { tried: vec![] }));
        assert!(err.is_err());
        assert!(slot.lock().unwrap().is_none());

        assert_eq!(load_once(&slot, || Ok(7)).unwrap(), 7);
        assert_eq!(load_once(&slot, || Ok(9)).unwrap(), 7);
    }

    #[test]
    fn explicit_path_comes_first() {
        let locator = ModelLocator::with_defaults(Some("custom.bin"));
        assert_eq!(
            locator.candidates(),
            &[
                PathBuf::from("custom.bin"),
                PathBuf::from("best_model.bin"),
                PathBuf::from("best_model.bin.bz2"),
            ]
        );

        let locator = ModelLocator::with_defaults(None::<&str>);
        assert_eq!(locator.candidates().len(), 2);
    }
}
