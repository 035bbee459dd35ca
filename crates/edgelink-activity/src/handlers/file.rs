//! File activity handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActivityError, Result};
use crate::handlers::{tags, ActivityHandler};

/// Forward payload: create a file with the given contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFilePayload {
    /// Target path.
    pub path: String,
    /// File contents.
    pub contents: String,
    /// Unix permission bits.
    #[serde(default = "default_mode")]
    pub mode: u32,
}

/// Undo payload of `write_file`: remove the created file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveFilePayload {
    /// Path to remove.
    pub path: String,
}

/// Payload half of `update_file`: the contents a path should hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFilePayload {
    /// Target path.
    pub path: String,
    /// Contents this half installs.
    pub contents: String,
    /// Unix permission bits.
    #[serde(default = "default_mode")]
    pub mode: u32,
}

const fn default_mode() -> u32 {
    0o644
}

/// Build the `(forward, undo)` pair for replacing a file's contents.
#[must_use]
pub fn update_file_pair(path: &str, new_contents: &str, old_contents: &str, mode: u32) -> (Value, Value) {
    (
        serde_json::json!({ "path": path, "contents": new_contents, "mode": mode }),
        serde_json::json!({ "path": path, "contents": old_contents, "mode": mode }),
    )
}

fn write(path: &str, contents: &str, mode: u32) -> Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Creates a file; undo removes it.
///
/// The undo tolerates an absent file so it stays runnable against a partial
/// forward state.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFileHandler;

impl WriteFileHandler {
    /// Create the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActivityHandler for WriteFileHandler {
    fn activity_type(&self) -> &'static str {
        tags::WRITE_FILE
    }

    async fn forward(&self, payload: &Value) -> Result<()> {
        let payload: WriteFilePayload =
            serde_json::from_value(payload.clone()).map_err(|e| ActivityError::Payload {
                activity: tags::WRITE_FILE.to_string(),
                message: e.to_string(),
            })?;

        write(&payload.path, &payload.contents, payload.mode)
    }

    async fn undo(&self, payload: &Value) -> Result<()> {
        let payload: RemoveFilePayload =
            serde_json::from_value(payload.clone()).map_err(|e| ActivityError::Payload {
                activity: tags::WRITE_FILE.to_string(),
                message: e.to_string(),
            })?;

        match std::fs::remove_file(&payload.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replaces file contents; undo restores the previous contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateFileHandler;

impl UpdateFileHandler {
    /// Create the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply(payload: &Value) -> Result<()> {
        let payload: UpdateFilePayload =
            serde_json::from_value(payload.clone()).map_err(|e| ActivityError::Payload {
                activity: tags::UPDATE_FILE.to_string(),
                message: e.to_string(),
            })?;

        write(&payload.path, &payload.contents, payload.mode)
    }
}

#[async_trait]
impl ActivityHandler for UpdateFileHandler {
    fn activity_type(&self) -> &'static str {
        tags::UPDATE_FILE
    }

    async fn forward(&self, payload: &Value) -> Result<()> {
        Self::apply(payload)
    }

    async fn undo(&self, payload: &Value) -> Result<()> {
        Self::apply(payload)
    }
}
