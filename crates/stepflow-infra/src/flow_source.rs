//! Filesystem-backed [`FlowSource`] for subflow resolution.
//!
//! A name is probed in every configured directory, in order, as
//! `{dir}/{name}.yaml`, `{dir}/{name}.yml` and `{dir}/{name}/flow.yaml`.
//! The first readable file wins; its canonical path is the cache key, so two
//! names resolving to the same file share one parsed definition.

use std::path::{Path, PathBuf};

use stepflow_core::flow::subflow::{FlowSource, ResolvedFlow, SourceError};

#[derive(Debug, Clone)]
pub struct FileSystemFlowSource {
    dirs: Vec<PathBuf>,
}

impl FileSystemFlowSource {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Paths tried for `name`, in probe order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        self.dirs
            .iter()
            .flat_map(|dir| {
                [
                    dir.join(format!("{name}.yaml")),
                    dir.join(format!("{name}.yml")),
                    dir.join(name).join("flow.yaml"),
                ]
            })
            .collect()
    }
}

/// Flow names are single path components; anything that could escape the
/// flow directories is rejected.
fn check_name(name: &str) -> Result<(), SourceError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
        || Path::new(name).is_absolute();
    if bad {
        return Err(SourceError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl FlowSource for FileSystemFlowSource {
    async fn resolve(&self, name: &str) -> Result<ResolvedFlow, SourceError> {
        check_name(name)?;
        for path in self.candidates(name) {
            match tokio::fs::read_to_string(&path).await {
                Ok(yaml) => {
                    let key = tokio::fs::canonicalize(&path).await.unwrap_or(path);
                    tracing::debug!(flow = name, path = %key.display(), "resolved subflow");
                    return Ok(ResolvedFlow {
                        key: key.display().to_string(),
                        yaml,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SourceError::Io {
                        name: name.to_string(),
                        message: format!("{}: {e}", path.display()),
                    });
                }
            }
        }
        Err(SourceError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FLOW: &str = "name: notify\nsteps:\n  - { type: task, task: noop }\n";

    #[tokio::test]
    async fn probes_each_layout() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), FLOW).unwrap();
        std::fs::write(tmp.path().join("b.yml"), FLOW).unwrap();
        std::fs::create_dir(tmp.path().join("c")).unwrap();
        std::fs::write(tmp.path().join("c").join("flow.yaml"), FLOW).unwrap();

        let source = FileSystemFlowSource::new(vec![tmp.path().to_path_buf()]);
        for name in ["a", "b", "c"] {
            let resolved = source.resolve(name).await.unwrap();
            assert_eq!(resolved.yaml, FLOW);
        }
        assert!(matches!(
            source.resolve("d").await,
            Err(SourceError::NotFound(n)) if n == "d"
        ));
    }

    #[tokio::test]
    async fn earlier_directories_win() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join("x.yaml"), "name: first\n").unwrap();
        std::fs::write(second.path().join("x.yaml"), "name: second\n").unwrap();

        let source = FileSystemFlowSource::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        assert_eq!(source.resolve("x").await.unwrap().yaml, "name: first\n");
    }

    #[tokio::test]
    async fn rejects_names_escaping_the_directory() {
        let source = FileSystemFlowSource::new(vec![PathBuf::from("flows")]);
        for name in ["../secret", "a/b", ".hidden", "", "..", "a\\b"] {
            assert!(
                matches!(source.resolve(name).await, Err(SourceError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn candidate_order() {
        let source = FileSystemFlowSource::new(vec![PathBuf::from("/f")]);
        assert_eq!(
            source.candidates("n"),
            [
                PathBuf::from("/f/n.yaml"),
                PathBuf::from("/f/n.yml"),
                PathBuf::from("/f/n/flow.yaml"),
            ]
        );
    }
}
