//! Profile Registry: load profile files from a directory, resolve
//! inheritance/dependency order, merge into concrete [`Profile`] values, and
//! serve lookups to the rest of the engine. `Reload` rebuilds off to the
//! side and only swaps in the new generation if the directory scan itself
//! succeeds. A bad profile quarantines just that profile, not the reload.

pub mod graph;
pub mod merge;
pub mod parse;
pub mod types;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use tracing::warn;

use crate::config::ClassifierConfig;
use crate::error::Result;
pub use graph::QuarantineEntry;
use types::{Profile, ProfileSource};

const PROFILE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

struct Generation {
    profiles: BTreeMap<String, Profile>,
    quarantined: Vec<QuarantineEntry>,
}

pub struct ProfileRegistry {
    generation: RwLock<Generation>,
}

impl ProfileRegistry {
    /// `LoadAll`: scan `dir` for profile files, parse, resolve inheritance
    /// order, and merge. Per-file problems (bad syntax, missing parent, a
    /// dependency cycle) quarantine just that profile; an unreadable
    /// directory is the only thing that fails the whole call.
    pub fn load_all(dir: &Path, classifier_defaults: &ClassifierConfig) -> Result<ProfileRegistry> {
        let generation = build_generation(dir, classifier_defaults)?;
        Ok(ProfileRegistry {
            generation: RwLock::new(generation),
        })
    }

    /// `GetProfile`: a clone of the current generation's merged profile, if
    /// it loaded and wasn't quarantined.
    pub fn get_profile(&self, id: &str) -> Option<Profile> {
        self.generation.read().unwrap().profiles.get(id).cloned()
    }

    pub fn profile_ids(&self) -> Vec<String> {
        self.generation.read().unwrap().profiles.keys().cloned().collect()
    }

    pub fn quarantined(&self) -> Vec<QuarantineEntry> {
        self.generation.read().unwrap().quarantined.clone()
    }

    /// `Reload`: rebuild from `dir` off to the side, then atomically swap
    /// it in. If the directory scan fails outright, the previous generation
    /// stays live and the error propagates.
    pub fn reload(&self, dir: &Path, classifier_defaults: &ClassifierConfig) -> Result<Vec<QuarantineEntry>> {
        let fresh = build_generation(dir, classifier_defaults)?;
        let quarantined = fresh.quarantined.clone();
        *self.generation.write().unwrap() = fresh;
        Ok(quarantined)
    }
}

fn build_generation(dir: &Path, classifier_defaults: &ClassifierConfig) -> Result<Generation> {
    let mut sources: BTreeMap<String, ProfileSource> = BTreeMap::new();
    let mut quarantined: BTreeMap<String, String> = BTreeMap::new();
    let mut seen_by_path: BTreeMap<String, std::path::PathBuf> = BTreeMap::new();

    for extension in PROFILE_EXTENSIONS {
        let pattern = dir.join(format!("**/*.{extension}"));
        let pattern = pattern.to_string_lossy().to_string();
        for entry in glob::glob(&pattern).map_err(|e| crate::error::Error::validation("profiles", e.to_string()))? {
            let path = entry.map_err(|e| crate::error::Error::Io(e.into()))?;
            let contents = std::fs::read_to_string(&path)?;
            match parse::parse_profile_file(&path, &contents) {
                Ok(source) => {
                    if let Some(existing_path) = seen_by_path.get(&source.id) {
                        warn!(id = %source.id, existing = %existing_path.display(), new = %path.display(), "duplicate profile id");
                        quarantined.insert(
                            source.id.clone(),
                            format!("duplicate id, already defined by '{}'", existing_path.display()),
                        );
                        continue;
                    }
                    seen_by_path.insert(source.id.clone(), path.clone());
                    sources.insert(source.id.clone(), source);
                }
                Err(e) => {
                    let fallback_id = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.to_string_lossy().to_string());
                    warn!(path = %path.display(), error = %e, "quarantining unparsable profile file");
                    quarantined.insert(fallback_id, format!("failed to parse: {e}"));
                }
            }
        }
    }

    let resolution = graph::resolve(&sources);
    for entry in &resolution.quarantined {
        quarantined.insert(entry.id.clone(), entry.reason.clone());
    }

    let mut profiles: BTreeMap<String, Profile> = BTreeMap::new();
    for id in &resolution.order {
        let source = &sources[id];
        let merged = match &source.inherits_from {
            None => merge::merge_root(source, classifier_defaults),
            Some(parent_id) => match profiles.get(parent_id) {
                Some(parent) => merge::merge_child(parent, source),
                None => {
                    quarantined.insert(id.clone(), format!("parent '{parent_id}' failed to build"));
                    continue;
                }
            },
        };
        profiles.insert(id.clone(), merged);
    }

    Ok(Generation {
        profiles,
        quarantined: quarantined
            .into_iter()
            .map(|(id, reason)| QuarantineEntry { id, reason })
            .collect(),
    })
}
