//! Composition of weight adapters (LoRAs) into the live runtime.
//!
//! The fused set is never patched. Every reconciliation unfuses everything
//! and fuses the requested declarations again from scratch, so the live state
//! is always a function of the declarations alone.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    AdapterDeclaration, AdapterMechanism, AdapterSpec, EaselError, ErrorKind, Result,
    RuntimeHandle,
};

pub const MAX_ACTIVE_ADAPTERS: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedAdapter {
    pub id: u64,
    pub name: String,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedAdapter {
    pub id: u64,
    pub name: String,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionReport {
    pub requested: usize,
    pub loaded_count: usize,
    pub fused: Vec<FusedAdapter>,
    pub skipped: Vec<SkippedAdapter>,
}

#[derive(Default)]
pub struct AdapterComposer {
    fused: Vec<FusedAdapter>,
}

impl AdapterComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fused(&self) -> &[FusedAdapter] {
        &self.fused
    }

    /// Forgets the fused set without touching any handle. Used when the
    /// handle itself was replaced.
    pub fn reset(&mut self) {
        self.fused.clear();
    }

    /// Replaces the fused set with exactly the given declarations.
    ///
    /// Missing archives, adapters for another base lineage and adapters the
    /// runtime rejects are skipped and reported. More than
    /// [`MAX_ACTIVE_ADAPTERS`] declarations fail before anything changes.
    pub fn apply_active_adapters(
        &mut self,
        handle: &mut RuntimeHandle,
        declarations: &[AdapterDeclaration],
    ) -> Result<CompositionReport> {
        if declarations.len() > MAX_ACTIVE_ADAPTERS {
            return Err(EaselError::AdapterLimitExceeded {
                requested: declarations.len(),
                max: MAX_ACTIVE_ADAPTERS,
            });
        }

        let mut report = CompositionReport {
            requested: declarations.len(),
            ..Default::default()
        };
        let mut candidates = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            if !declaration.path.is_file() {
                let err = EaselError::AdapterFileMissing(declaration.path.display().to_string());
                warn!(adapter = %declaration.name, "{err}, skipping");
                report.skipped.push(skipped(declaration, &err));
            } else if !handle.family.accepts_adapter_for(declaration.family) {
                let err = EaselError::InvalidInput(format!(
                    "adapter targets {} but the loaded model is {}",
                    declaration.family, handle.family
                ));
                warn!(adapter = %declaration.name, "{err}, skipping");
                report.skipped.push(skipped(declaration, &err));
            } else {
                candidates.push(declaration);
            }
        }

        // Each round starts from a clean handle. A failing adapter is dropped
        // and the remaining set is fused again.
        self.fused.clear();
        loop {
            unfuse_all(handle);
            if candidates.is_empty() {
                break;
            }
            match fuse_round(handle, &candidates)? {
                None => break,
                Some((index, err)) => {
                    let declaration = candidates.remove(index);
                    let err = EaselError::runtime(err);
                    warn!(adapter = %declaration.name, "failed to fuse adapter: {err}");
                    report.skipped.push(skipped(declaration, &err));
                }
            }
        }

        self.fused = candidates
            .iter()
            .map(|d| FusedAdapter {
                id: d.id,
                name: d.name.clone(),
                weight: d.weight,
            })
            .collect();
        for adapter in &self.fused {
            info!(adapter = %adapter.name, weight = adapter.weight, "fused adapter");
        }
        report.loaded_count = self.fused.len();
        report.fused = self.fused.clone();
        Ok(report)
    }

    /// Unfuses everything. Never fails.
    pub fn clear(&mut self, handle: &mut RuntimeHandle) {
        unfuse_all(handle);
        if !self.fused.is_empty() {
            info!(count = self.fused.len(), "cleared adapters");
        }
        self.fused.clear();
    }
}

fn skipped(declaration: &AdapterDeclaration, err: &EaselError) -> SkippedAdapter {
    SkippedAdapter {
        id: declaration.id,
        name: declaration.name.clone(),
        kind: err.kind(),
        reason: err.to_string(),
    }
}

fn unfuse_all(handle: &mut RuntimeHandle) {
    for pipeline in handle.pipelines_mut() {
        if let Err(e) = pipeline.unfuse_adapters() {
            warn!(task = ?pipeline.task(), "unfuse failed: {e:#}");
        }
    }
}

/// Fuses every candidate into every pipeline. Returns the index of the first
/// adapter the runtime rejected, if any.
fn fuse_round(
    handle: &mut RuntimeHandle,
    candidates: &[&AdapterDeclaration],
) -> Result<Option<(usize, anyhow::Error)>> {
    let specs: Vec<AdapterSpec> = candidates.iter().map(|d| d.spec()).collect();
    for pipeline in handle.pipelines_mut() {
        match pipeline.adapter_mechanism() {
            AdapterMechanism::Staged => {
                for (index, spec) in specs.iter().enumerate() {
                    if let Err(e) = pipeline.stage_adapter(spec) {
                        return Ok(Some((index, e)));
                    }
                }
                if let Err(e) = pipeline.commit_adapters() {
                    error!(task = ?pipeline.task(), "failed to commit staged adapters: {e:#}");
                    if let Err(e) = pipeline.unfuse_adapters() {
                        warn!("unfuse after failed commit also failed: {e:#}");
                    }
                    return Err(EaselError::runtime(e));
                }
            }
            AdapterMechanism::Direct => {
                for (index, spec) in specs.iter().enumerate() {
                    if let Err(e) = pipeline.fuse_adapter(spec) {
                        return Ok(Some((index, e)));
                    }
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::testing::{mock_handle, MockCounters};
    use crate::ArchitectureFamily;

    fn declaration(dir: &Path, id: u64, name: &str, weight: f64) -> AdapterDeclaration {
        let path = dir.join(format!("{name}.safetensors"));
        std::fs::write(&path, b"lora").unwrap();
        AdapterDeclaration {
            id,
            name: name.to_string(),
            path,
            family: ArchitectureFamily::Unknown,
            trigger_words: vec![],
            weight,
            active: true,
        }
    }

    fn names(composer: &AdapterComposer) -> Vec<&str> {
        composer.fused().iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn reconciling_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let set = vec![
            declaration(dir.path(), 1, "x", 1.0),
            declaration(dir.path(), 2, "y", 0.5),
        ];
        let mut composer = AdapterComposer::new();
        let first = composer.apply_active_adapters(&mut handle, &set).unwrap();
        let second = composer.apply_active_adapters(&mut handle, &set).unwrap();
        assert_eq!(first.fused, second.fused);
        assert_eq!(names(&composer), ["x", "y"]);
        assert_eq!(counters.live_adapters(), vec!["x".to_string(), "y".to_string()]);
        assert!(counters.max_live_adapters() <= set.len());
    }

    #[test]
    fn six_adapters_leave_previous_set_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let mut composer = AdapterComposer::new();
        let x = declaration(dir.path(), 1, "x", 1.0);
        composer.apply_active_adapters(&mut handle, &[x]).unwrap();
        let unfuses = counters.unfuses();

        let six: Vec<_> = (0..6)
            .map(|i| declaration(dir.path(), 10 + i, &format!("a{i}"), 1.0))
            .collect();
        let err = composer.apply_active_adapters(&mut handle, &six).unwrap_err();
        assert!(matches!(err, EaselError::AdapterLimitExceeded { requested: 6, max: 5 }));
        assert_eq!(names(&composer), ["x"]);
        assert_eq!(counters.unfuses(), unfuses);
        assert_eq!(counters.live_adapters(), vec!["x".to_string()]);
    }

    #[test]
    fn missing_and_mismatched_adapters_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let mut gone = declaration(dir.path(), 1, "gone", 1.0);
        gone.path = dir.path().join("nowhere.safetensors");
        let mut sdxl_only = declaration(dir.path(), 2, "sdxl-style", 1.0);
        sdxl_only.family = ArchitectureFamily::PonyXl;
        let mut flux_style = declaration(dir.path(), 3, "flux-style", 0.8);
        flux_style.family = ArchitectureFamily::Flux(crate::FluxVariant::Dev);

        let mut composer = AdapterComposer::new();
        let report = composer
            .apply_active_adapters(&mut handle, &[gone, sdxl_only, flux_style])
            .unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.loaded_count, 1);
        assert_eq!(names(&composer), ["flux-style"]);
        assert_eq!(report.skipped[0].kind, ErrorKind::AdapterFileMissing);
        assert_eq!(report.skipped[1].kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn runtime_rejection_is_isolated_to_one_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let set = vec![
            declaration(dir.path(), 1, "x", 1.0),
            declaration(dir.path(), 2, "broken", 1.0),
            declaration(dir.path(), 3, "y", 0.5),
        ];
        let mut composer = AdapterComposer::new();
        let report = composer.apply_active_adapters(&mut handle, &set).unwrap();
        assert_eq!(names(&composer), ["x", "y"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].kind, ErrorKind::RuntimeFailure);
        assert_eq!(counters.live_adapters(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn clear_empties_everything() {
        let dir = tempfile::tempdir().unwrap();
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let mut composer = AdapterComposer::new();
        composer
            .apply_active_adapters(&mut handle, &[declaration(dir.path(), 1, "x", 1.0)])
            .unwrap();
        composer.clear(&mut handle);
        composer.clear(&mut handle);
        assert!(composer.fused().is_empty());
        assert!(counters.live_adapters().is_empty());
    }
}
