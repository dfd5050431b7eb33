//! Workspaces - cloned repositories under the workspaces directory
//!
//! Layout:
//!
//! ```text
//! <workspaces_dir>/<workspace_id>/
//!   ├── ...repository files...
//!   └── .harbor/
//!       ├── workspace.json          (repo_url, branch, created_at)
//!       └── compose-overrides/      (operator-edited compose files)
//! ```

use chrono::{DateTime, Utc};
use harbor_foundation::{Error, JsonStore, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Per-workspace metadata directory
pub const WORKSPACE_META_DIR: &str = ".harbor";

const WORKSPACE_META_FILE: &str = "workspace.json";
const OVERRIDES_DIR: &str = "compose-overrides";
const IGNORED_DIRS: [&str; 2] = [".git", WORKSPACE_META_DIR];
const MAX_SCAN_DEPTH: usize = 8;

/// Stored next to the checkout
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceMeta {
    pub workspace_id: String,
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// What a workspace contains, returned by clone
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkspaceListing {
    pub workspace_id: String,
    pub dockerfiles: Vec<String>,
    pub directories: Vec<String>,
    pub compose_files: Vec<String>,
}

/// Handle on the workspaces root
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh 32-char id
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Ids are 32 ASCII alphanumerics
    pub fn validate_id(id: &str) -> Result<()> {
        if id.len() == 32 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("Invalid workspace_id: {:?}", id)))
        }
    }

    /// Path for a new workspace (not created)
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        Self::validate_id(id)?;
        Ok(self.root.join(id))
    }

    /// Path of an existing workspace
    pub fn path(&self, id: &str) -> Result<PathBuf> {
        let path = self.path_for(id)?;
        if !path.is_dir() {
            return Err(Error::NotFound(format!("Workspace {} not found", id)));
        }
        Ok(path)
    }

    /// Delete a workspace; returns whether it existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&path)?;
        info!(workspace_id = id, "Workspace removed");
        Ok(true)
    }

    fn meta_store(&self, id: &str) -> Result<JsonStore> {
        Ok(JsonStore::new(self.path(id)?.join(WORKSPACE_META_DIR)))
    }

    pub fn read_meta(&self, id: &str) -> Result<Option<WorkspaceMeta>> {
        self.meta_store(id)?.load_optional(WORKSPACE_META_FILE)
    }

    /// Write metadata, keeping the original `created_at`
    pub fn write_meta(&self, id: &str, repo_url: &str, branch: Option<&str>) -> Result<WorkspaceMeta> {
        let store = self.meta_store(id)?;
        let existing: Option<WorkspaceMeta> = store.load_optional(WORKSPACE_META_FILE).unwrap_or(None);
        let meta = WorkspaceMeta {
            workspace_id: id.to_string(),
            repo_url: repo_url.to_string(),
            branch: branch.map(str::to_string),
            created_at: existing
                .and_then(|m| m.created_at)
                .or_else(|| Some(Utc::now())),
        };
        store.save(WORKSPACE_META_FILE, &meta)?;
        Ok(meta)
    }

    /// Dockerfiles, top-level directories and compose files
    pub fn describe(&self, id: &str) -> Result<WorkspaceListing> {
        let root = self.path(id)?;
        let files = walk_files(&root)?;

        let mut dockerfiles: Vec<String> = files
            .iter()
            .filter(|rel| file_name(rel).starts_with("Dockerfile"))
            .cloned()
            .collect();
        dockerfiles.sort();

        let mut directories = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && name != ".git" {
                directories.push(name);
            }
        }
        directories.sort();

        let compose_files = sort_by_depth(files.into_iter().filter(|rel| is_compose_file(rel)).collect());

        debug!(
            workspace_id = id,
            dockerfiles = dockerfiles.len(),
            compose_files = compose_files.len(),
            "Workspace described"
        );
        Ok(WorkspaceListing {
            workspace_id: id.to_string(),
            dockerfiles,
            directories,
            compose_files,
        })
    }

    /// Resolve a relative path inside a workspace, rejecting escapes and
    /// reserved directories
    pub fn resolve_file(&self, id: &str, relative: &str) -> Result<PathBuf> {
        let root = self.path(id)?;
        let clean = relative.trim();
        if clean.is_empty() {
            return Err(Error::InvalidInput("path is required".to_string()));
        }
        let rel = Path::new(clean);
        if rel.is_absolute() {
            return Err(Error::InvalidInput("path must be relative".to_string()));
        }

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(Error::InvalidInput("path escapes workspace".to_string()));
                    }
                }
                _ => return Err(Error::InvalidInput("path escapes workspace".to_string())),
            }
        }
        if parts
            .iter()
            .any(|p| IGNORED_DIRS.iter().any(|ignored| *p == std::ffi::OsStr::new(ignored)))
        {
            return Err(Error::InvalidInput(
                "path points to reserved directory".to_string(),
            ));
        }

        Ok(parts.into_iter().fold(root, |acc, p| acc.join(p)))
    }

    /// Compose file selected by `compose_path`, or the shallowest one found
    pub fn select_compose(&self, id: &str, compose_path: Option<&str>) -> Result<String> {
        match compose_path {
            Some(path) => {
                let file = self.resolve_file(id, path)?;
                if !file.is_file() {
                    return Err(Error::NotFound(format!("Compose file not found: {}", path)));
                }
                if !has_compose_suffix(path) {
                    return Err(Error::InvalidInput(
                        "compose_path must end with .yml or .yaml".to_string(),
                    ));
                }
                let root = self.path(id)?;
                Ok(relative_display(&root, &file))
            }
            None => self
                .describe(id)?
                .compose_files
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound("No compose file found in workspace".to_string())),
        }
    }

    /// Location of the override for a compose file
    pub fn override_path(&self, id: &str, compose_path: &str) -> Result<PathBuf> {
        let root = self.path(id)?;
        let suffix = if compose_path.to_ascii_lowercase().ends_with(".yml") {
            "yml"
        } else {
            "yaml"
        };
        Ok(root
            .join(WORKSPACE_META_DIR)
            .join(OVERRIDES_DIR)
            .join(format!("{}.{}", override_slug(compose_path), suffix)))
    }
}

/// `deploy/docker-compose.yml` -> `deploy__docker-compose`
fn override_slug(compose_path: &str) -> String {
    let stem = compose_path
        .trim_end_matches(".yaml")
        .trim_end_matches(".yml")
        .trim_end_matches(".YAML")
        .trim_end_matches(".YML");
    let slug: String = stem
        .replace('/', "__")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if slug.is_empty() {
        "compose".to_string()
    } else {
        slug
    }
}

fn has_compose_suffix(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".yml") || lower.ends_with(".yaml")
}

fn is_compose_file(rel: &str) -> bool {
    let name = file_name(rel).to_ascii_lowercase();
    has_compose_suffix(&name) && name.contains("compose")
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// Shallowest first, then lexicographic
fn sort_by_depth(mut paths: Vec<String>) -> Vec<String> {
    paths.sort_by(|a, b| {
        a.matches('/')
            .count()
            .cmp(&b.matches('/').count())
            .then_with(|| a.cmp(b))
    });
    paths.dedup();
    paths
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative paths (with `/`) of all files, skipping reserved directories
fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                let name = entry.file_name();
                if IGNORED_DIRS.iter().any(|d| name == std::ffi::OsStr::new(d)) {
                    continue;
                }
                if depth < MAX_SCAN_DEPTH {
                    stack.push((path, depth + 1));
                }
            } else if file_type.is_file() {
                out.push(relative_display(root, &path));
            }
        }
    }
    Ok(out)
}
