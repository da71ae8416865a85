//! Repo map assembly.
//!
//! The merged repo map resolves `repo:<key>` hints to checkout paths. It is
//! self-healing: every tick merges (in increasing precedence) directories
//! discovered under the configured repo root, an optional JSON map file,
//! and the mapping already persisted in state. Keys are normalized; paths
//! that are no longer directories are pruned.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::classifier::normalize_repo_key;

/// Discover `<root>/<name>` checkouts as repo keys.
pub fn discover_repo_map(repo_root: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if repo_root.as_os_str().is_empty() {
        return out;
    }
    let Ok(entries) = fs::read_dir(repo_root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let key = normalize_repo_key(name);
        if !key.is_empty() {
            out.insert(key, path.display().to_string());
        }
    }
    // Common aliases so cards can say repo:api / repo:frontend.
    if let Some(server) = out.get("server").cloned() {
        out.entry("api".to_string()).or_insert_with(|| server.clone());
        out.entry("backend".to_string()).or_insert(server);
    }
    if let Some(web) = out.get("web").cloned() {
        out.entry("frontend".to_string()).or_insert_with(|| web.clone());
        out.entry("ui".to_string()).or_insert(web);
    }
    out
}

/// Load an explicit JSON `{key: path}` mapping file.
pub fn load_repo_map_file(path: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if path.as_os_str().is_empty() {
        return out;
    }
    let Ok(contents) = fs::read_to_string(path) else {
        return out;
    };
    let Ok(raw) = serde_json::from_str::<BTreeMap<String, String>>(&contents) else {
        return out;
    };
    for (key, value) in raw {
        let key = normalize_repo_key(&key);
        if !key.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

/// Merge maps (later wins) and prune entries that are not directories.
pub fn merge_repo_maps(maps: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for map in maps {
        for (key, value) in map.iter() {
            let key = normalize_repo_key(key);
            if !key.is_empty() {
                merged.insert(key, value.clone());
            }
        }
    }
    let pruned: BTreeMap<String, String> = merged
        .into_iter()
        .filter(|(_, path)| Path::new(path).is_dir())
        .collect();
    debug!(repos = pruned.len(), "repo map assembled");
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_normalizes_names_and_adds_aliases() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("Server")).expect("mkdir");
        fs::create_dir(temp.path().join("web")).expect("mkdir");
        fs::write(temp.path().join("not-a-dir"), "x").expect("write");

        let map = discover_repo_map(temp.path());
        assert!(map.contains_key("server"));
        assert!(map.contains_key("api"));
        assert!(map.contains_key("backend"));
        assert!(map.contains_key("frontend"));
        assert!(!map.contains_key("not-a-dir"));
    }

    #[test]
    fn merge_prefers_later_maps_and_prunes_dead_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let real = temp.path().join("real");
        fs::create_dir(&real).expect("mkdir");

        let mut low = BTreeMap::new();
        low.insert("repo".to_string(), "/does/not/exist".to_string());
        let mut high = BTreeMap::new();
        high.insert("repo".to_string(), real.display().to_string());

        let merged = merge_repo_maps(&[&low, &high]);
        assert_eq!(merged.get("repo"), Some(&real.display().to_string()));

        let merged = merge_repo_maps(&[&low]);
        assert!(merged.is_empty());
    }

    #[test]
    fn map_file_tolerates_missing_and_invalid_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_repo_map_file(&temp.path().join("missing.json")).is_empty());
        let path = temp.path().join("bad.json");
        fs::write(&path, "not json").expect("write");
        assert!(load_repo_map_file(&path).is_empty());
        let path = temp.path().join("good.json");
        fs::write(&path, "{\"My Repo\": \"/tmp\"}").expect("write");
        let map = load_repo_map_file(&path);
        assert_eq!(map.get("my-repo"), Some(&"/tmp".to_string()));
    }
}
