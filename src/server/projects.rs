//! Project existence checks.
//!
//! The relay does not own project storage. It only asks whether a project id
//! names a real project before accepting sockets or tasks for it.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::ProjectId;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn exists(&self, project_id: &ProjectId) -> Result<bool>;
}

/// Accepts every well-formed project id.
#[derive(Debug, Default, Clone)]
pub struct AnyProject;

#[async_trait]
impl ProjectStore for AnyProject {
    async fn exists(&self, _project_id: &ProjectId) -> Result<bool> {
        Ok(true)
    }
}

/// Projects are directories under a root.
#[derive(Debug, Clone)]
pub struct DirectoryProjects {
    root: PathBuf,
}

impl DirectoryProjects {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProjectStore for DirectoryProjects {
    async fn exists(&self, project_id: &ProjectId) -> Result<bool> {
        // ProjectId excludes path separators, but not "." and "..".
        if matches!(project_id.as_str(), "." | "..") {
            return Ok(false);
        }
        match tokio::fs::metadata(self.root.join(project_id.as_str())).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
