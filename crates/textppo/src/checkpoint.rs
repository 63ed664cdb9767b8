//! Trainer checkpoint metadata.
//!
//! Weight serialization is delegated to the policy (`PolicyModel::save`)
//! and the codec (`TextDecoder::save`); this module owns only the
//! `meta.json` sitting next to them, so a resumed run keeps its config,
//! step counter, and adapted KL coefficient.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PpoConfig;
use crate::error::{checkpoint_error, IoResultExt, PpoResult};
use crate::kl::KlController;

/// Metadata stored alongside the serialized weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerMeta {
    pub config: PpoConfig,
    pub step: usize,
    pub kl_ctl: KlController,
}

/// Write `<dir>/meta.json`.
pub fn save_meta(dir: &Path, meta: &TrainerMeta) -> PpoResult<()> {
    std::fs::create_dir_all(dir).with_path(dir)?;
    let path = dir.join("meta.json");
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| checkpoint_error(e.to_string(), &path))?;
    std::fs::write(&path, json).with_path(&path)
}

/// Read `<dir>/meta.json`.
pub fn load_meta(dir: &Path) -> PpoResult<TrainerMeta> {
    let path = dir.join("meta.json");
    let json = std::fs::read_to_string(&path).with_path(&path)?;
    serde_json::from_str(&json).map_err(|e| checkpoint_error(e.to_string(), &path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = PpoConfig::smoke_test();
        let mut kl_ctl = KlController::from_config(&config);
        kl_ctl.update(12.0, config.batch_size);

        let meta = TrainerMeta {
            config: config.clone(),
            step: 7,
            kl_ctl,
        };
        save_meta(dir.path(), &meta).unwrap();

        let loaded = load_meta(dir.path()).unwrap();
        assert_eq!(loaded.step, 7);
        assert_eq!(loaded.config.batch_size, config.batch_size);
        assert!((loaded.kl_ctl.value() - meta.kl_ctl.value()).abs() < 1e-15);
    }

    #[test]
    fn test_missing_meta_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_meta(dir.path()).unwrap_err();
        assert!(err.path().unwrap().contains("meta.json"));
    }
}
