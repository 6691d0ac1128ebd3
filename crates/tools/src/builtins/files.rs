//! Host-side file tools confined to the conversation workspace.

use std::fs;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::registry::{ProviderInit, StateMap, ToolCallState, ToolProvider, ToolReply};
use crate::sandbox::resolve_path;
use crate::schema::{Param, ParamKind, ToolDescriptor};

/// `list_files` / `read_file` / `write_file`, all routed through the path
/// sandbox. These operate on the conversation's isolated workspace, not the
/// host at large.
#[derive(Debug, Default)]
pub struct FileSystemProvider;

#[async_trait]
impl ToolProvider for FileSystemProvider {
    fn init(&self) -> Result<ProviderInit> {
        let tools = vec![
            ToolDescriptor::new(
                "list_files",
                "List Files",
                "List files and directories in the sandboxed working directory. Operates \
                 within the conversation's isolated workspace, not on the host machine.",
            )
            .with_param(
                "directory",
                Param::optional(ParamKind::String, "Directory path (use '.' for the workspace root)")
                    .with_default(json!(".")),
            ),
            ToolDescriptor::new(
                "read_file",
                "Read File",
                "Read a text file from the sandboxed working directory.",
            )
            .with_param("path", Param::required(ParamKind::String, "File path")),
            ToolDescriptor::new(
                "write_file",
                "Write File",
                "Write a text file inside the sandboxed working directory, creating parent \
                 directories as needed.",
            )
            .with_param("path", Param::required(ParamKind::String, "File path"))
            .with_param("content", Param::required(ParamKind::String, "File content")),
        ];

        Ok(ProviderInit {
            tools,
            global_state: StateMap::new(),
            conversation_template: StateMap::new(),
        })
    }

    async fn call(
        &self,
        tool_id: &str,
        args: &Value,
        state: ToolCallState,
    ) -> Result<ToolReply, String> {
        let Some(workspace) = state.working_directory().await else {
            return Err("Error: Working directory not available for this conversation".to_string());
        };

        match tool_id {
            "list_files" => list_files(args, &workspace),
            "read_file" => read_file(args, &workspace),
            "write_file" => write_file(args, &workspace),
            other => Err(format!("Unknown tool: {other}")),
        }
    }
}

fn list_files(args: &Value, workspace: &Path) -> Result<ToolReply, String> {
    let directory = args.get("directory").and_then(Value::as_str).unwrap_or(".");
    let target = resolve_path(directory, workspace)?;

    if !target.exists() {
        return Err(format!("Error: Directory does not exist: {directory}"));
    }
    if !target.is_dir() {
        return Err(format!("Error: Path is not a directory: {directory}"));
    }

    let mut entries: Vec<_> = fs::read_dir(&target)
        .map_err(|err| format!("Error listing directory: {err}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let rel = path
            .strip_prefix(workspace)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| {
                if directory == "." {
                    name.clone()
                } else {
                    format!("{directory}/{name}")
                }
            });
        let item = if path.is_symlink() {
            json!({
                "name": name,
                "type": "symlink",
                "path": rel,
                "target": fs::read_link(&path).ok().map(|t| t.display().to_string()),
            })
        } else if path.is_dir() {
            json!({"name": name, "type": "directory", "path": rel})
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            json!({"name": name, "type": "file", "path": rel, "size": size})
        };
        items.push(item);
    }

    Ok(ToolReply::Json(json!({
        "directory": directory,
        "working_directory": workspace.display().to_string(),
        "item_count": items.len(),
        "items": items,
    })))
}

fn read_file(args: &Value, workspace: &Path) -> Result<ToolReply, String> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| "Error: path parameter is required".to_string())?;
    let target = resolve_path(path, workspace)?;

    if !target.is_file() {
        return Err(format!("Error: File does not exist: {path}"));
    }
    let content =
        fs::read_to_string(&target).map_err(|err| format!("Error reading file {path}: {err}"))?;
    Ok(ToolReply::Json(json!({
        "path": path,
        "size": content.len(),
        "content": content,
    })))
}

fn write_file(args: &Value, workspace: &Path) -> Result<ToolReply, String> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| "Error: path parameter is required".to_string())?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| "Error: content parameter is required".to_string())?;
    let target = resolve_path(path, workspace)?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Error creating parent directories for {path}: {err}"))?;
    }
    fs::write(&target, content).map_err(|err| format!("Error writing file {path}: {err}"))?;
    Ok(ToolReply::Json(json!({
        "path": path,
        "bytes_written": content.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::registry::{CONVERSATION_ID_KEY, WORKING_DIRECTORY_KEY};

    fn call_state(workspace: &Path) -> ToolCallState {
        ToolCallState {
            conversation: Arc::new(Mutex::new(StateMap::from([
                (CONVERSATION_ID_KEY.to_string(), json!("conv-1")),
                (
                    WORKING_DIRECTORY_KEY.to_string(),
                    json!(workspace.display().to_string()),
                ),
            ]))),
            global: Arc::new(Mutex::new(StateMap::new())),
        }
    }

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("conv-1");
        fs::create_dir_all(ws.join("temp")).unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn write_then_read_then_list() {
        let (_dir, ws) = workspace();
        let provider = FileSystemProvider;
        let state = call_state(&ws);

        provider
            .call(
                "write_file",
                &json!({"path": "notes/todo.txt", "content": "ship it"}),
                state.clone(),
            )
            .await
            .unwrap();

        let reply = provider
            .call("read_file", &json!({"path": "notes/todo.txt"}), state.clone())
            .await
            .unwrap();
        let ToolReply::Json(value) = reply else {
            panic!("expected json")
        };
        assert_eq!(value["content"], "ship it");

        let reply = provider
            .call("list_files", &json!({"directory": "notes"}), state)
            .await
            .unwrap();
        let ToolReply::Json(value) = reply else {
            panic!("expected json")
        };
        assert_eq!(value["item_count"], 1);
        assert_eq!(value["items"][0]["name"], "todo.txt");
        assert_eq!(value["items"][0]["type"], "file");
    }

    #[tokio::test]
    async fn escape_attempt_is_refused_with_outside() {
        let (_dir, ws) = workspace();
        let provider = FileSystemProvider;
        let err = provider
            .call("list_files", &json!({"directory": "../.."}), call_state(&ws))
            .await
            .unwrap_err();
        assert!(err.contains("outside"));
    }

    #[tokio::test]
    async fn mnt_prefixed_paths_work() {
        let (_dir, ws) = workspace();
        fs::write(ws.join("a.txt"), "hello").unwrap();
        let provider = FileSystemProvider;
        let reply = provider
            .call("read_file", &json!({"path": "/mnt/a.txt"}), call_state(&ws))
            .await
            .unwrap();
        let ToolReply::Json(value) = reply else {
            panic!("expected json")
        };
        assert_eq!(value["content"], "hello");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (_dir, ws) = workspace();
        let provider = FileSystemProvider;
        let err = provider
            .call("read_file", &json!({"path": "nope.txt"}), call_state(&ws))
            .await
            .unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[tokio::test]
    async fn missing_working_directory_is_an_error() {
        let provider = FileSystemProvider;
        let state = ToolCallState {
            conversation: Arc::new(Mutex::new(StateMap::new())),
            global: Arc::new(Mutex::new(StateMap::new())),
        };
        let err = provider
            .call("list_files", &json!({}), state)
            .await
            .unwrap_err();
        assert!(err.contains("Working directory not available"));
    }
}
