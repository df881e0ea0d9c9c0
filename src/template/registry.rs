//! TemplateRegistry — disk discovery and lookup of template descriptors.
//!
//! Walks the configured template roots once at startup. Each subdirectory
//! holding a descriptor file (`template.json`, `template.yaml`, or
//! `template.yml`) contributes one template. Templates are read-only after
//! load; `refreshed()` builds a replacement registry with a bumped generation
//! which the hot-reload task swaps in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::{ConfigLayers, ConfigProcessor};
use crate::error::StevedoreError;
use crate::template::descriptor::{TemplateDescriptor, TemplateOrigin};

/// Descriptor file names probed inside each template directory, in order.
const DESCRIPTOR_NAMES: &[&str] = &["template.json", "template.yaml", "template.yml"];

/// The sole source of template identity. All other components receive
/// resolved descriptors from here.
pub struct TemplateRegistry {
    roots: Vec<(PathBuf, TemplateOrigin)>,
    templates: HashMap<String, Arc<TemplateDescriptor>>,
    /// Content fingerprints for change detection across refreshes.
    fingerprints: HashMap<String, String>,
    generation: u64,
}

impl TemplateRegistry {
    /// Discover templates under a single user-template root.
    pub fn discover(root: impl Into<PathBuf>) -> crate::Result<Self> {
        Self::load(vec![(root.into(), TemplateOrigin::User)], 0)
    }

    /// Discover templates under multiple roots with per-root origin.
    pub fn discover_roots(roots: Vec<(PathBuf, TemplateOrigin)>) -> crate::Result<Self> {
        Self::load(roots, 0)
    }

    fn load(roots: Vec<(PathBuf, TemplateOrigin)>, generation: u64) -> crate::Result<Self> {
        let mut templates: HashMap<String, Arc<TemplateDescriptor>> = HashMap::new();
        let mut fingerprints = HashMap::new();

        for (root, origin) in &roots {
            if !root.is_dir() {
                tracing::debug!(root = %root.display(), "template root missing, skipping");
                continue;
            }
            let entries = std::fs::read_dir(root).map_err(|e| {
                StevedoreError::InvalidTemplate(root.display().to_string(), e.to_string())
            })?;
            for entry in entries.flatten() {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }
                let Some(descriptor_path) = find_descriptor(&dir) else {
                    tracing::debug!(dir = %dir.display(), "no descriptor file, skipping");
                    continue;
                };
                let contents = std::fs::read_to_string(&descriptor_path).map_err(|e| {
                    StevedoreError::InvalidTemplate(
                        descriptor_path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                let mut descriptor = TemplateDescriptor::parse(&descriptor_path, &contents)?;
                descriptor.origin = *origin;

                // The schema must validate its own declared defaults.
                ConfigProcessor::new(&descriptor)
                    .process(&ConfigLayers::default())
                    .map_err(|e| {
                        StevedoreError::InvalidTemplate(
                            descriptor_path.display().to_string(),
                            format!("schema defaults do not validate: {}", e),
                        )
                    })?;

                if templates.contains_key(&descriptor.id) {
                    return Err(StevedoreError::InvalidTemplate(
                        descriptor_path.display().to_string(),
                        format!("duplicate template id '{}'", descriptor.id),
                    ));
                }
                let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if dir_name != descriptor.id {
                    tracing::warn!(
                        template = %descriptor.id,
                        dir = %dir_name,
                        "template id differs from its directory name"
                    );
                }
                fingerprints.insert(descriptor.id.clone(), fingerprint(&descriptor));
                templates.insert(descriptor.id.clone(), Arc::new(descriptor));
            }
        }

        tracing::info!(count = templates.len(), generation, "templates loaded");
        Ok(Self {
            roots,
            templates,
            fingerprints,
            generation,
        })
    }

    /// Look up a template by id.
    pub fn get(&self, id: &str) -> crate::Result<Arc<TemplateDescriptor>> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| StevedoreError::TemplateNotFound(id.to_string()))
    }

    /// All descriptors, sorted by id for stable output.
    pub fn list(&self) -> Vec<Arc<TemplateDescriptor>> {
        let mut all: Vec<_> = self.templates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// All template ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Monotonic reload counter; bumped by every `refreshed()`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The roots this registry discovers from.
    pub fn roots(&self) -> &[(PathBuf, TemplateOrigin)] {
        &self.roots
    }

    /// Re-walk the roots and build the replacement registry.
    pub fn refreshed(&self) -> crate::Result<Self> {
        Self::load(self.roots.clone(), self.generation + 1)
    }

    /// Ids whose descriptor content differs from (or is absent in) `other`.
    /// Drives tool-cache invalidation after a refresh.
    pub fn changed_since(&self, other: &TemplateRegistry) -> Vec<String> {
        let mut changed: Vec<String> = Vec::new();
        for (id, print) in &self.fingerprints {
            if other.fingerprints.get(id) != Some(print) {
                changed.push(id.clone());
            }
        }
        for id in other.fingerprints.keys() {
            if !self.fingerprints.contains_key(id) {
                changed.push(id.clone());
            }
        }
        changed.sort();
        changed
    }
}

/// Probe a template directory for its descriptor file.
fn find_descriptor(dir: &Path) -> Option<PathBuf> {
    DESCRIPTOR_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Content hash of the canonical JSON form of a descriptor.
fn fingerprint(descriptor: &TemplateDescriptor) -> String {
    let canonical = serde_json::to_vec(descriptor).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}
