use std::fs;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::Repo;

/// point `name` at `hash`, creating intermediate directories
///
/// names may be hierarchical, like "torizon/6.1/base".
pub fn write_ref(repo: &Repo, name: &str, hash: &Hash) -> Result<()> {
    let path = ref_path(repo, name)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    crate::fs::write_atomic(&path, format!("{}\n", hash).as_bytes())?;
    tracing::debug!(reference = name, checksum = %hash, "updated ref");
    Ok(())
}

/// read the checksum a ref points at
pub fn read_ref(repo: &Repo, name: &str) -> Result<Hash> {
    read_ref_opt(repo, name)?.ok_or_else(|| Error::RefNotFound(name.to_string()))
}

/// like [`read_ref`] but absent refs are `None`
pub fn read_ref_opt(repo: &Repo, name: &str) -> Result<Option<Hash>> {
    let path = ref_path(repo, name)?;
    match fs::read_to_string(&path) {
        Ok(content) => Hash::from_hex(content.trim()).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        // a ref that is a directory of further refs is not itself a ref
        Err(_) if path.is_dir() => Ok(None),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

/// a full checksum is taken as is, anything else is looked up as a ref
pub fn resolve_rev(repo: &Repo, rev: &str) -> Result<Hash> {
    if Hash::looks_like_hex(rev) {
        return Hash::from_hex(&rev.to_ascii_lowercase());
    }
    read_ref(repo, rev)
}

/// every ref name in the store, sorted
pub fn list_refs(repo: &Repo) -> Result<Vec<(String, Hash)>> {
    let base = repo.refs_path();
    let mut refs = Vec::new();

    for entry in WalkDir::new(&base).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io {
            path: base.clone(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&base) else {
            continue;
        };
        let name = rel.to_string_lossy().into_owned();
        refs.push((name.clone(), read_ref(repo, &name)?));
    }

    refs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(refs)
}

fn ref_path(repo: &Repo, name: &str) -> Result<PathBuf> {
    validate_ref_name(name)?;
    Ok(repo.refs_path().join(name))
}

fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }
    if name.contains('\0') {
        return Err(Error::InvalidRef(format!("{:?}", name)));
    }
    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::InvalidRef(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const A: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_write_and_read_ref() {
        let (_dir, repo) = test_repo();
        let hash = Hash::from_hex(A).unwrap();

        write_ref(&repo, "torizon/base", &hash).unwrap();

        assert_eq!(read_ref(&repo, "torizon/base").unwrap(), hash);
        let on_disk = fs::read_to_string(repo.refs_path().join("torizon/base")).unwrap();
        assert_eq!(on_disk, format!("{}\n", A));
    }

    #[test]
    fn test_overwrite_ref() {
        let (_dir, repo) = test_repo();
        write_ref(&repo, "base", &Hash::from_hex(A).unwrap()).unwrap();
        write_ref(&repo, "base", &Hash::from_hex(B).unwrap()).unwrap();
        assert_eq!(read_ref(&repo, "base").unwrap().to_hex(), B);
    }

    #[test]
    fn test_missing_ref() {
        let (_dir, repo) = test_repo();
        assert!(matches!(read_ref(&repo, "base"), Err(Error::RefNotFound(_))));
        assert_eq!(read_ref_opt(&repo, "base").unwrap(), None);
    }

    #[test]
    fn test_resolve_rev() {
        let (_dir, repo) = test_repo();
        write_ref(&repo, "base", &Hash::from_hex(B).unwrap()).unwrap();

        assert_eq!(resolve_rev(&repo, A).unwrap().to_hex(), A);
        assert_eq!(resolve_rev(&repo, &A.to_uppercase()).unwrap().to_hex(), A);
        assert_eq!(resolve_rev(&repo, "base").unwrap().to_hex(), B);
    }

    #[test]
    fn test_list_refs_sorted() {
        let (_dir, repo) = test_repo();
        write_ref(&repo, "z", &Hash::ZERO).unwrap();
        write_ref(&repo, "a/b/c", &Hash::ZERO).unwrap();
        write_ref(&repo, "a/d", &Hash::ZERO).unwrap();

        let names: Vec<_> = list_refs(&repo).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a/b/c", "a/d", "z"]);
    }

    #[test]
    fn test_invalid_ref_names() {
        for name in ["", "/start", "end/", "double//slash", "a/./b", "a/../b", "nul\0"] {
            assert!(validate_ref_name(name).is_err(), "accepted {:?}", name);
        }
        assert!(validate_ref_name("deep/nested/ref").is_ok());
    }
}
