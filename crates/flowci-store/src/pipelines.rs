use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use flowci_core::error::{FlowError, Result};
use flowci_core::node::{root_path, NodeSpec};
use flowci_core::traits::PipelineService;

/// Pipeline registry backed by a directory of `<name>.toml` files.
///
/// Each file holds one serialized root [`NodeSpec`]; its raw text is the
/// definition content snapshotted into new jobs.
pub struct FilePipelines {
    dir: PathBuf,
}

impl FilePipelines {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, path: &str) -> Option<PathBuf> {
        let root = root_path(path);
        if root.is_empty() || root.starts_with('.') {
            return None;
        }
        Some(self.dir.join(format!("{}.toml", root)))
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        let Some(file) = self.file_for(path) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PipelineService for FilePipelines {
    fn find(&self, path: &str) -> BoxFuture<'_, Result<Option<NodeSpec>>> {
        let path = path.to_string();

        Box::pin(async move {
            let Some(content) = self.read(&path).await? else {
                debug!(path = %path, "Pipeline not found");
                return Ok(None);
            };

            let spec: NodeSpec = toml::from_str(&content).map_err(|e| {
                FlowError::IllegalParameter(format!("Invalid pipeline '{}': {}", path, e))
            })?;

            let root = root_path(&path);
            if spec.name != root {
                return Err(FlowError::IllegalParameter(format!(
                    "Pipeline file '{}' declares root '{}'",
                    root, spec.name
                )));
            }
            Ok(Some(spec))
        })
    }

    fn definition(&self, path: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let path = path.to_string();
        Box::pin(async move { self.read(&path).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::node::NodeKind;

    const FLOW1: &str = r#"
name = "flow1"
kind = "flow"

[[children]]
name = "step1"
script = "echo 1"

[[children]]
name = "step2"
script = "echo 2"
allow_failure = true
"#;

    fn registry() -> (tempfile::TempDir, FilePipelines) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flow1.toml"), FLOW1).unwrap();
        std::fs::write(dir.path().join("renamed.toml"), FLOW1).unwrap();
        let pipelines = FilePipelines::new(dir.path());
        (dir, pipelines)
    }

    #[tokio::test]
    async fn finds_root_by_nested_path() {
        let (_dir, pipelines) = registry();
        let spec = pipelines.find("flow1/step1").await.unwrap().unwrap();
        assert_eq!(spec.name, "flow1");
        assert_eq!(spec.kind, NodeKind::Flow);
        assert_eq!(spec.children.len(), 2);
        assert!(spec.children[1].allow_failure);

        let content = pipelines.definition("flow1").await.unwrap().unwrap();
        assert_eq!(content, FLOW1);
    }

    #[tokio::test]
    async fn missing_pipeline_is_none() {
        let (_dir, pipelines) = registry();
        assert!(pipelines.find("nope").await.unwrap().is_none());
        assert!(pipelines.definition("nope").await.unwrap().is_none());
        assert!(pipelines.find("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_root_name_is_rejected() {
        let (_dir, pipelines) = registry();
        let err = pipelines.find("renamed").await.unwrap_err();
        assert!(err.is_client_error());
    }
}
