//! Runtime directory layout shared by every conversation.
//!
//! ```text
//! <runtime>/agent-memory/                      shared across conversations
//! <runtime>/conversation-data/<id>/            per-conversation persistent data
//! <runtime>/agent-working-directory/<id>/      workspace, bound at /mnt
//!     temp/
//!     agent-memory      -> ../../agent-memory
//!     conversation_data -> ../../conversation-data/<id>
//! ```
//!
//! The symlinks serve host-side tools; containers see the workspace through
//! the /mnt bind mount.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

pub const AGENT_MEMORY_DIR: &str = "agent-memory";
pub const CONVERSATION_DATA_DIR: &str = "conversation-data";
pub const WORKING_DIR_BASE: &str = "agent-working-directory";

#[derive(Debug, Clone)]
pub struct ConversationDirs {
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    /// Ensure the base directories exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [AGENT_MEMORY_DIR, CONVERSATION_DATA_DIR, WORKING_DIR_BASE] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("cannot create runtime directory {dir}"))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agent_memory_dir(&self) -> PathBuf {
        self.root.join(AGENT_MEMORY_DIR)
    }

    pub fn working_dir_base(&self) -> PathBuf {
        self.root.join(WORKING_DIR_BASE)
    }

    pub fn conversation_data_dir(&self, conversation_id: &str) -> PathBuf {
        self.root.join(CONVERSATION_DATA_DIR).join(conversation_id)
    }

    pub fn working_dir(&self, conversation_id: &str) -> PathBuf {
        self.working_dir_base().join(conversation_id)
    }

    /// Create the directories and symlinks for a conversation. Idempotent.
    pub fn setup_conversation(&self, conversation_id: &str) -> Result<ConversationDirs> {
        let data_dir = self.conversation_data_dir(conversation_id);
        let working_dir = self.working_dir(conversation_id);
        let temp_dir = working_dir.join("temp");

        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&temp_dir)?;

        // Relative targets so the runtime directory can be relocated whole.
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;

            let memory_link = working_dir.join("agent-memory");
            if !memory_link.is_symlink() {
                symlink(Path::new("../../agent-memory"), &memory_link)?;
            }
            let data_link = working_dir.join("conversation_data");
            if !data_link.is_symlink() {
                symlink(
                    PathBuf::from(format!("../../conversation-data/{conversation_id}")),
                    &data_link,
                )?;
            }
        }

        info!(conversation = %conversation_id, dir = %working_dir.display(), "conversation directories ready");
        Ok(ConversationDirs {
            working_dir,
            data_dir,
            temp_dir,
        })
    }

    /// Drop every file in the conversation's temp directory, keeping the
    /// directory itself.
    pub fn clean_temp(&self, conversation_id: &str) -> Result<()> {
        let temp_dir = self.working_dir(conversation_id).join("temp");
        if !temp_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&temp_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Remove a conversation's data and workspace entirely.
    pub fn remove_conversation(&self, conversation_id: &str) -> Result<()> {
        let data_dir = self.conversation_data_dir(conversation_id);
        if data_dir.exists() {
            fs::remove_dir_all(&data_dir)?;
        }
        let working_dir = self.working_dir(conversation_id);
        if working_dir.exists() {
            // Unlink the symlinks first so remove_dir_all never follows them
            // into shared directories.
            for link in ["agent-memory", "conversation_data"] {
                let path = working_dir.join(link);
                if path.is_symlink() {
                    fs::remove_file(path)?;
                }
            }
            fs::remove_dir_all(&working_dir)?;
        }
        info!(conversation = %conversation_id, "conversation directories removed");
        Ok(())
    }

    /// Conversation ids that have data directories on disk.
    pub fn list_conversations(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(CONVERSATION_DATA_DIR)) else {
            return vec![];
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_base_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path()).unwrap();
        assert!(layout.agent_memory_dir().is_dir());
        assert!(dir.path().join(CONVERSATION_DATA_DIR).is_dir());
        assert!(layout.working_dir_base().is_dir());
    }

    #[test]
    fn setup_is_idempotent_and_links_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path()).unwrap();

        let dirs = layout.setup_conversation("conv-1").unwrap();
        let again = layout.setup_conversation("conv-1").unwrap();
        assert_eq!(dirs.working_dir, again.working_dir);
        assert!(dirs.temp_dir.is_dir());
        assert!(dirs.data_dir.is_dir());

        #[cfg(unix)]
        {
            let memory_link = dirs.working_dir.join("agent-memory");
            assert!(memory_link.is_symlink());
            // Following the link lands in the shared memory directory.
            assert_eq!(
                memory_link.canonicalize().unwrap(),
                layout.agent_memory_dir().canonicalize().unwrap()
            );
            let data_link = dirs.working_dir.join("conversation_data");
            assert_eq!(
                data_link.canonicalize().unwrap(),
                dirs.data_dir.canonicalize().unwrap()
            );
        }
    }

    #[test]
    fn remove_conversation_keeps_shared_memory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path()).unwrap();
        layout.setup_conversation("conv-1").unwrap();
        fs::write(layout.agent_memory_dir().join("keep.md"), "shared").unwrap();

        layout.remove_conversation("conv-1").unwrap();
        assert!(!layout.working_dir("conv-1").exists());
        assert!(!layout.conversation_data_dir("conv-1").exists());
        // Removing a conversation never touches the shared memory target.
        assert!(layout.agent_memory_dir().join("keep.md").exists());
    }

    #[test]
    fn clean_temp_empties_but_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path()).unwrap();
        let dirs = layout.setup_conversation("conv-1").unwrap();
        fs::write(dirs.temp_dir.join("scratch.txt"), "x").unwrap();
        fs::create_dir_all(dirs.temp_dir.join("nested")).unwrap();

        layout.clean_temp("conv-1").unwrap();
        assert!(dirs.temp_dir.is_dir());
        assert_eq!(fs::read_dir(&dirs.temp_dir).unwrap().count(), 0);
    }

    #[test]
    fn lists_conversations_from_data_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path()).unwrap();
        layout.setup_conversation("conv-b").unwrap();
        layout.setup_conversation("conv-a").unwrap();
        assert_eq!(layout.list_conversations(), vec!["conv-a", "conv-b"]);
    }
}
