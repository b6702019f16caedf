//! installer image output: template copy plus rootfs archive

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

/// compression implied by the archive's file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.xz") {
            Some(Compression::Xz)
        } else if name.ends_with(".tar.zst") {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    fn tar_flag(self) -> &'static str {
        match self {
            Compression::Xz => "--xz",
            Compression::Zstd => "--zstd",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    /// xz preset, ignored for zstd
    pub xz_level: u32,
    pub tar_program: String,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            xz_level: 1,
            tar_program: "tar".to_string(),
        }
    }
}

/// copy the installer template at `src` to a new directory `dst`
///
/// modes and symlinks are kept; ownership is not. fifos, sockets and
/// device nodes are refused.
pub fn copy_template(src: &Path, dst: &Path) -> Result<()> {
    if dst.symlink_metadata().is_ok() {
        return Err(Error::Precondition(format!(
            "Output directory {} must not exist.",
            dst.display()
        )));
    }
    if !src.is_dir() {
        return Err(Error::Precondition(format!(
            "Installer template {} does not exist.",
            src.display()
        )));
    }

    let mut dirs = Vec::new();
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Io {
            path: e.path().unwrap_or(src).to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dst.join(rel);
        let ft = entry.file_type();

        if ft.is_dir() {
            fs::create_dir_all(&target).with_path(&target)?;
            let meta = entry.metadata().map_err(|e| Error::Io {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            dirs.push((target, meta.permissions()));
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path()).with_path(entry.path())?;
            std::os::unix::fs::symlink(&link, &target).with_path(&target)?;
        } else if ft.is_file() {
            // fs::copy carries the permission bits
            fs::copy(entry.path(), &target).with_path(&target)?;
        } else {
            return Err(Error::Packaging {
                stage: "copy template",
                message: format!(
                    "{} is not a regular file, directory or symlink",
                    entry.path().display()
                ),
            });
        }
    }
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, perms).with_path(&dir)?;
    }

    tracing::debug!(from = %src.display(), to = %dst.display(), "copied installer template");
    Ok(())
}

/// the archive in `output_dir` the installer will unpack as rootfs
///
/// among several candidates, names containing `.ota.` win.
pub fn find_rootfs_archive(output_dir: &Path) -> Result<(PathBuf, Compression)> {
    let missing = || Error::Packaging {
        stage: "locate archive",
        message: format!("no *.tar.xz or *.tar.zst in {}", output_dir.display()),
    };

    let base = glob::Pattern::escape(&output_dir.to_string_lossy());
    let mut candidates = Vec::new();
    for suffix in ["*.tar.xz", "*.tar.zst"] {
        let paths = glob::glob(&format!("{}/{}", base, suffix))
            .map_err(|e| Error::Packaging {
                stage: "locate archive",
                message: e.to_string(),
            })?;
        candidates.extend(paths.filter_map(|p| p.ok()).filter(|p| p.is_file()));
    }
    candidates.sort();

    let name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let chosen = candidates
        .iter()
        .find(|p| name(p).contains(".ota."))
        .or_else(|| candidates.first())
        .ok_or_else(missing)?;
    if candidates.len() > 1 {
        tracing::warn!(chosen = %chosen.display(), count = candidates.len(), "several rootfs archives");
    }

    let compression = Compression::from_file_name(&name(chosen)).ok_or_else(missing)?;
    Ok((chosen.clone(), compression))
}

/// pack `sysroot` into the rootfs archive inside `output_dir`
///
/// one tar pass: xattrs, sparse files, permissions and hard links kept.
pub fn pack_root(sysroot: &Path, output_dir: &Path, opts: &PackOptions) -> Result<PathBuf> {
    let (archive, compression) = find_rootfs_archive(output_dir)?;

    let mut cmd = Command::new(&opts.tar_program);
    cmd.arg("--xattrs")
        .arg("--xattrs-include=*")
        .arg("-cf")
        .arg(&archive)
        .arg(compression.tar_flag())
        .arg("-S")
        .arg("-C")
        .arg(sysroot)
        .arg("-p")
        .arg(".");
    if compression == Compression::Xz {
        cmd.env("XZ_OPT", format!("-{}", opts.xz_level));
    }

    tracing::info!(archive = %archive.display(), "packing sysroot");
    let output = cmd.output().map_err(|e| Error::Packaging {
        stage: "tar",
        message: format!("cannot run {}: {}", opts.tar_program, e),
    })?;
    if !output.status.success() {
        return Err(Error::Packaging {
            stage: "tar",
            message: format!(
                "{} exited with {}: {}",
                opts.tar_program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn have(program: &str, arg: &str) -> bool {
        Command::new(program)
            .arg(arg)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn template(root: &Path) -> PathBuf {
        let tezi = root.join("tezi");
        fs::create_dir_all(tezi.join("prepare.d")).unwrap();
        fs::write(tezi.join("image.json"), "{}").unwrap();
        fs::write(tezi.join("prepare.d/run.sh"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(tezi.join("prepare.d/run.sh"), fs::Permissions::from_mode(0o755))
            .unwrap();
        std::os::unix::fs::symlink("image.json", tezi.join("image-latest.json")).unwrap();
        fs::write(tezi.join("torizon-core.ota.tar.xz"), "").unwrap();
        tezi
    }

    #[test]
    fn test_compression_from_name() {
        assert_eq!(Compression::from_file_name("a.ota.tar.xz"), Some(Compression::Xz));
        assert_eq!(Compression::from_file_name("a.tar.zst"), Some(Compression::Zstd));
        assert_eq!(Compression::from_file_name("a.tar.gz"), None);
    }

    #[test]
    fn test_copy_template() {
        let dir = tempdir().unwrap();
        let src = template(dir.path());
        let dst = dir.path().join("out");

        copy_template(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("image.json")).unwrap(), "{}");
        assert_eq!(
            fs::metadata(dst.join("prepare.d/run.sh")).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(
            fs::read_link(dst.join("image-latest.json")).unwrap(),
            Path::new("image.json")
        );
    }

    #[test]
    fn test_copy_template_refuses_fifo() {
        let dir = tempdir().unwrap();
        let src = template(dir.path());
        nix::unistd::mkfifo(
            &src.join("prepare.d/pipe"),
            nix::sys::stat::Mode::from_bits_truncate(0o600),
        )
        .unwrap();
        let dst = dir.path().join("out");

        let err = copy_template(&src, &dst).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Packaging);
        assert!(err.to_string().contains("prepare.d/pipe"));
    }

    #[test]
    fn test_copy_template_refuses_existing() {
        let dir = tempdir().unwrap();
        let src = template(dir.path());
        let dst = dir.path().join("out");
        fs::create_dir(&dst).unwrap();

        let err = copy_template(&src, &dst).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
    }

    #[test]
    fn test_find_archive_prefers_ota() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a-rootfs.tar.zst"), "").unwrap();
        fs::write(dir.path().join("b.ota.tar.xz"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let (path, compression) = find_rootfs_archive(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("b.ota.tar.xz"));
        assert_eq!(compression, Compression::Xz);
    }

    #[test]
    fn test_find_archive_missing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("image.json"), "{}").unwrap();
        assert!(matches!(
            find_rootfs_archive(dir.path()),
            Err(Error::Packaging { .. })
        ));
    }

    #[test]
    fn test_pack_root() {
        if !have("tar", "--version") || !have("xz", "--version") {
            return;
        }
        let dir = tempdir().unwrap();
        let sysroot = dir.path().join("sysroot");
        fs::create_dir_all(sysroot.join("ostree/deploy")).unwrap();
        fs::write(sysroot.join("ostree/deploy/marker"), "rootfs").unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("image.ota.tar.xz"), "").unwrap();

        let archive = pack_root(&sysroot, &out, &PackOptions::default()).unwrap();

        let listing = Command::new("tar").arg("-tJf").arg(&archive).output().unwrap();
        assert!(String::from_utf8_lossy(&listing.stdout).contains("./ostree/deploy/marker"));
    }

    #[test]
    fn test_pack_root_reports_stderr() {
        if !have("tar", "--version") {
            return;
        }
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("image.ota.tar.xz"), "").unwrap();

        let err = pack_root(&dir.path().join("absent"), &out, &PackOptions::default()).unwrap_err();
        let Error::Packaging { stage, message } = err else {
            panic!("expected packaging error");
        };
        assert_eq!(stage, "tar");
        assert!(message.contains("absent"));
    }
}
