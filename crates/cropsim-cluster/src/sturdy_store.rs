//! ---
//! cs_section: "04-cluster"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "JSON file of named sturdy references."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cropsim_rpc::SturdyRef;
use tracing::debug;

use crate::error::ClusterError;

/// Named sturdy references persisted between runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SturdyRefStore {
    path: PathBuf,
    refs: BTreeMap<String, SturdyRef>,
}

impl SturdyRefStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let path = path.into();
        let refs = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| ClusterError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = refs.len(), "sturdy ref store loaded");
        Ok(Self { path, refs })
    }

    pub fn save(&self) -> Result<(), ClusterError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ClusterError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents = serde_json::to_string_pretty(&self.refs)?;
        fs::write(&self.path, contents).map_err(|source| ClusterError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&SturdyRef> {
        self.refs.get(name)
    }

    /// Returns the reference previously stored under `name`.
    pub fn put(&mut self, name: impl Into<String>, sturdy: SturdyRef) -> Option<SturdyRef> {
        self.refs.insert(name.into(), sturdy)
    }

    pub fn remove(&mut self, name: &str) -> Option<SturdyRef> {
        self.refs.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.refs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropsim_rpc::CapKind;

    #[test]
    fn entries_survive_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("refs.json");

        let mut store = SturdyRefStore::load(&path).expect("empty store");
        assert!(store.is_empty());
        store.put("wheat-1", SturdyRef::new("tok-1", CapKind::CapHolder));
        store.put("group", SturdyRef::new("tok-2", CapKind::HolderGroup));
        store.save().expect("save");

        let reloaded = SturdyRefStore::load(&path).expect("reload");
        assert_eq!(reloaded, store);
        assert_eq!(
            reloaded.get("group"),
            Some(&SturdyRef::new("tok-2", CapKind::HolderGroup))
        );
        assert_eq!(reloaded.names().collect::<Vec<_>>(), vec!["group", "wheat-1"]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("refs.json");
        fs::write(&path, "[").expect("write");
        assert!(matches!(
            SturdyRefStore::load(&path),
            Err(ClusterError::Json(_))
        ));
    }
}
