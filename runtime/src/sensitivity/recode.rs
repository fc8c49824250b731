//! Migration of stored recipes between sensitivity modes.

use serde::{Deserialize, Serialize};

use snapcache_core::config::SensitivityMode;
use snapcache_core::error::Result;
use snapcache_core::hash::ChunkHash;

use super::Classifier;
use crate::chunk::{ChunkStore, Recipe};

/// Outcome of recoding one recipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecodeReport {
    /// Slots inspected
    pub slots: usize,
    /// Slots whose stored hash changed
    pub rewritten: usize,
    /// Chunks uploaded under their new hash
    pub uploaded: usize,
}

impl RecodeReport {
    pub fn modified(&self) -> bool {
        self.rewritten > 0
    }
}

/// Rewrites recipe slots to the hashes a new sensitivity mode requires.
///
/// Recoding is idempotent: running it again with the same arguments on an
/// already migrated recipe changes nothing.
pub struct Recoder {
    store: ChunkStore,
    classifier: Classifier,
}

impl Recoder {
    /// `classifier` supplies the partial-mode policy; its own mode is ignored.
    pub fn new(store: ChunkStore, classifier: Classifier) -> Self {
        Self { store, classifier }
    }

    /// Migrate `recipe` of snapshot `identity` (built from `image`) from
    /// `old_mode` to `new_mode`.
    ///
    /// Chunks whose new stored hash is missing from the store are uploaded
    /// under that hash before the slot is rewritten.
    pub async fn recode(
        &self,
        recipe: &mut Recipe,
        old_mode: SensitivityMode,
        new_mode: SensitivityMode,
        identity: &str,
        image: &str,
    ) -> Result<RecodeReport> {
        let target_classifier = self.classifier.with_mode(new_mode);
        let mut report = RecodeReport {
            slots: recipe.len(),
            ..Default::default()
        };

        for idx in 0..recipe.len() {
            let Some(&stored) = recipe.get(idx) else {
                break;
            };

            // Under mode none every slot already holds the plain hash.
            let mut fetched = None;
            let mut plain = if old_mode == SensitivityMode::None {
                stored
            } else {
                let data = self.store.download(&stored, identity).await?;
                let plain = ChunkHash::of(&data);
                fetched = Some(data);
                plain
            };

            let mut target = target_classifier.stored_hash(&plain, image, identity);
            if target == stored {
                continue;
            }

            if !self.store.exists(&target).await? {
                let data = match fetched {
                    Some(data) => data,
                    None => self.store.download(&stored, identity).await?,
                };

                let actual = ChunkHash::of(&data);
                if actual != plain {
                    // Slot was already remapped by an earlier run.
                    plain = actual;
                    target = target_classifier.stored_hash(&plain, image, identity);
                    if target == stored {
                        continue;
                    }
                }

                if self.store.upload(&target, &data).await? {
                    report.uploaded += 1;
                }
            }

            recipe.set(idx, target);
            report.rewritten += 1;
        }

        tracing::debug!(
            identity,
            from = %old_mode,
            to = %new_mode,
            slots = report.slots,
            rewritten = report.rewritten,
            uploaded = report.uploaded,
            "Recoded recipe"
        );
        Ok(report)
    }
}
