//! Local artifact store for rendered configuration.
//!
//! Artifacts land under `{root}/nginx/{name}.conf`,
//! `{root}/systemd/{name}.service` and `{root}/env/{name}.env`. A file is
//! rewritten only when its content differs, so re-rendering an unchanged
//! service leaves the tree untouched.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while writing artifacts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to write artifact {path}: {message}")]
pub struct ArtifactError {
    /// Path that could not be read or written.
    pub path: Utf8PathBuf,
    /// Underlying I/O message.
    pub message: String,
}

/// Compiled configuration for one service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenderedArtifacts {
    /// Service name the files are keyed by.
    pub service: String,
    /// Reverse-proxy site configuration.
    pub proxy_config: String,
    /// Supervision unit.
    pub unit: String,
    /// Environment drop-in.
    pub env_drop_in: String,
}

/// Where each artifact of a service was written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactPaths {
    /// Proxy site file.
    pub proxy_config: Utf8PathBuf,
    /// Unit file.
    pub unit: Utf8PathBuf,
    /// Env drop-in.
    pub env_drop_in: Utf8PathBuf,
}

/// Outcome of [`ArtifactStore::write`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteOutcome {
    /// Paths of the three artifacts.
    pub paths: ArtifactPaths,
    /// Files whose content changed.
    pub changed: Vec<Utf8PathBuf>,
}

/// Directory tree receiving rendered artifacts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`. Nothing is created until the first
    /// write.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the paths artifacts for `service` are written to.
    #[must_use]
    pub fn paths_for(&self, service: &str) -> ArtifactPaths {
        ArtifactPaths {
            proxy_config: self.root.join("nginx").join(format!("{service}.conf")),
            unit: self.root.join("systemd").join(format!("{service}.service")),
            env_drop_in: self.root.join("env").join(format!("{service}.env")),
        }
    }

    /// Writes every artifact whose content differs from what is on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] naming the first path that could not be
    /// created, read, or written.
    pub fn write(&self, artifacts: &RenderedArtifacts) -> Result<WriteOutcome, ArtifactError> {
        let paths = self.paths_for(&artifacts.service);
        let mut changed = Vec::new();
        for (path, content) in [
            (&paths.proxy_config, &artifacts.proxy_config),
            (&paths.unit, &artifacts.unit),
            (&paths.env_drop_in, &artifacts.env_drop_in),
        ] {
            if write_if_changed(path, content)? {
                changed.push(path.clone());
            }
        }
        Ok(WriteOutcome { paths, changed })
    }
}

fn write_if_changed(path: &Utf8Path, content: &str) -> Result<bool, ArtifactError> {
    let io_error = |at: &Utf8Path, err: &io::Error| ArtifactError {
        path: at.to_path_buf(),
        message: err.to_string(),
    };
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ArtifactError {
        path: path.to_path_buf(),
        message: String::from("artifact path is missing a filename"),
    })?;

    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;

    match dir.read_to_string(file_name) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error(path, &err)),
    }

    dir.write(file_name, content)
        .map_err(|err| io_error(path, &err))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn artifacts() -> RenderedArtifacts {
        RenderedArtifacts {
            service: String::from("demo"),
            proxy_config: String::from("server {}\n"),
            unit: String::from("[Unit]\n"),
            env_drop_in: String::from("# env\n"),
        }
    }

    fn store_in(dir: &TempDir) -> ArtifactStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().join("generated"))
            .unwrap_or_else(|path| panic!("non utf-8 temp path: {}", path.display()));
        ArtifactStore::new(root)
    }

    #[rstest]
    fn first_write_creates_every_file(artifacts: RenderedArtifacts) {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        let outcome = store.write(&artifacts).expect("write");

        assert_eq!(outcome.changed.len(), 3);
        assert!(outcome.paths.proxy_config.ends_with("nginx/demo.conf"));
        assert!(outcome.paths.unit.ends_with("systemd/demo.service"));
        assert!(outcome.paths.env_drop_in.ends_with("env/demo.env"));
        let written =
            std::fs::read_to_string(&outcome.paths.proxy_config).expect("proxy config exists");
        assert_eq!(written, artifacts.proxy_config);
    }

    #[rstest]
    fn identical_rewrite_changes_nothing(artifacts: RenderedArtifacts) {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store.write(&artifacts).expect("first write");

        let outcome = store.write(&artifacts).expect("second write");

        assert!(outcome.changed.is_empty());
    }

    #[rstest]
    fn only_differing_files_are_rewritten(artifacts: RenderedArtifacts) {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store.write(&artifacts).expect("first write");
        let updated = RenderedArtifacts {
            unit: String::from("[Unit]\nDescription=demo\n"),
            ..artifacts
        };

        let outcome = store.write(&updated).expect("second write");

        assert_eq!(outcome.changed, [outcome.paths.unit.clone()]);
    }
}
