//! named update sources, `remotes.toml` at the store root

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repo::Repo;

const REMOTES_FILE: &str = "remotes.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteList {
    #[serde(default)]
    remote: BTreeMap<String, RemoteEntry>,
}

fn load(repo: &Repo) -> Result<RemoteList> {
    let path = repo.path().join(REMOTES_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteList::default()),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', ':']) || name.chars().any(char::is_whitespace) {
        return Err(Error::Configuration(format!("invalid remote name {:?}", name)));
    }
    Ok(())
}

/// register `url` as `name`; an existing entry is replaced only with `force`
pub fn add_remote(repo: &Repo, name: &str, url: &str, force: bool) -> Result<()> {
    validate_name(name)?;
    let _lock = repo.lock()?;
    let mut list = load(repo)?;
    if list.remote.contains_key(name) && !force {
        return Err(Error::RemoteExists(name.to_string()));
    }
    list.remote.insert(
        name.to_string(),
        RemoteEntry {
            url: url.to_string(),
        },
    );
    let encoded = toml::to_string_pretty(&list)?;
    crate::fs::write_atomic(&repo.path().join(REMOTES_FILE), encoded.as_bytes())?;
    tracing::debug!(remote = name, url, "added remote");
    Ok(())
}

pub fn remote_url(repo: &Repo, name: &str) -> Result<String> {
    load(repo)?
        .remote
        .remove(name)
        .map(|entry| entry.url)
        .ok_or_else(|| Error::NoSuchRemote(name.to_string()))
}

/// (name, url), sorted by name
pub fn list_remotes(repo: &Repo) -> Result<Vec<(String, String)>> {
    Ok(load(repo)?
        .remote
        .into_iter()
        .map(|(name, entry)| (name, entry.url))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_and_read() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();

        assert!(list_remotes(&repo).unwrap().is_empty());
        add_remote(&repo, "tcbuilder", "http://localhost:8080/", false).unwrap();
        assert_eq!(remote_url(&repo, "tcbuilder").unwrap(), "http://localhost:8080/");
        assert!(matches!(
            remote_url(&repo, "origin"),
            Err(Error::NoSuchRemote(_))
        ));
    }

    #[test]
    fn test_replace_needs_force() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        add_remote(&repo, "tcbuilder", "http://localhost:8080/", false).unwrap();

        assert!(matches!(
            add_remote(&repo, "tcbuilder", "http://localhost:9090/", false),
            Err(Error::RemoteExists(_))
        ));
        add_remote(&repo, "tcbuilder", "http://localhost:9090/", true).unwrap();
        assert_eq!(
            list_remotes(&repo).unwrap(),
            vec![("tcbuilder".to_string(), "http://localhost:9090/".to_string())]
        );
    }

    #[test]
    fn test_invalid_names() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        for name in ["", "a/b", "a:b", "two words"] {
            assert!(add_remote(&repo, name, "http://x/", true).is_err(), "{:?}", name);
        }
    }
}
