//! Load an image from the workspace into the model's vision input.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::registry::{ProviderInit, StateMap, ToolCallState, ToolProvider, ToolReply};
use crate::sandbox::resolve_path;
use crate::schema::{Param, ParamKind, ToolDescriptor};

const MEDIA_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
];

/// `view_photo`: reads an image file and returns it as a tagged image reply,
/// which the driver packages as an image content block.
#[derive(Debug, Default)]
pub struct ViewPhotoProvider;

#[async_trait]
impl ToolProvider for ViewPhotoProvider {
    fn init(&self) -> Result<ProviderInit> {
        let tools = vec![
            ToolDescriptor::new(
                "view_photo",
                "View Photo",
                "Load a photo from the workspace into the conversation so the model can see it.",
            )
            .with_param(
                "photo_path",
                Param::required(ParamKind::String, "Path to the image file"),
            ),
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
        if tool_id != "view_photo" {
            return Err(format!("Unknown tool: {tool_id}"));
        }
        let Some(workspace) = state.working_directory().await else {
            return Err("Error: Working directory not available for this conversation".to_string());
        };
        let photo_path = args
            .get("photo_path")
            .and_then(Value::as_str)
            .ok_or_else(|| "Error: photo_path parameter is required".to_string())?;

        let target = resolve_path(photo_path, &workspace)?;
        if !target.is_file() {
            return Err(format!("Error: Photo file not found at path: {photo_path}"));
        }

        let extension = target
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let Some((_, media_type)) = MEDIA_TYPES.iter().find(|(ext, _)| *ext == extension) else {
            let supported: Vec<&str> = MEDIA_TYPES.iter().map(|(ext, _)| *ext).collect();
            return Err(format!(
                "Error: File does not appear to be an image. Supported formats: {}",
                supported.join(", ")
            ));
        };

        let bytes =
            std::fs::read(&target).map_err(|err| format!("Error reading photo file: {err}"))?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| photo_path.to_string());

        // Keep a record of what the model has seen this conversation.
        {
            let mut store = state.conversation.lock().await;
            let viewed = store
                .entry("viewed_photos".to_string())
                .or_insert_with(|| json!([]));
            if let Some(list) = viewed.as_array_mut() {
                list.push(json!({"path": target.display().to_string(), "name": name}));
            }
        }

        Ok(ToolReply::Image {
            media_type: media_type.to_string(),
            data: BASE64.encode(&bytes),
            name,
        })
    }
}
