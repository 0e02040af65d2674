use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use trellis_core::Chat;

use super::error::{
    DecodeJsonSnafu, EncodeJsonSnafu, ReadDumpSnafu, StorageResult, UnsupportedDumpVersionSnafu,
    WriteDumpSnafu,
};

pub const DUMP_VERSION: u32 = 1;

/// Portable export of one or more chats, including their full branch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDump {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub chats: Vec<Chat>,
}

impl ChatDump {
    pub fn new(chats: Vec<Chat>) -> Self {
        Self {
            version: DUMP_VERSION,
            exported_at: Utc::now(),
            chats,
        }
    }

    pub fn to_json(&self) -> StorageResult<String> {
        serde_json::to_string_pretty(self).context(EncodeJsonSnafu {
            stage: "dump-encode",
            entity: "chat dump",
        })
    }

    pub fn from_json(raw: &str) -> StorageResult<Self> {
        let mut dump: Self = serde_json::from_str(raw).context(DecodeJsonSnafu {
            stage: "dump-decode",
            entity: "chat dump",
        })?;
        ensure!(
            dump.version == DUMP_VERSION,
            UnsupportedDumpVersionSnafu {
                stage: "dump-check-version",
                found: dump.version,
                expected: DUMP_VERSION,
            }
        );
        for chat in &mut dump.chats {
            chat.branches.normalize();
        }
        Ok(dump)
    }

    /// Writes through a sibling temp file so a crash never leaves a half-written dump.
    pub fn write_to_path(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(WriteDumpSnafu {
                stage: "dump-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = self.to_json()?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteDumpSnafu {
            stage: "dump-write-temporary-file",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, path).context(WriteDumpSnafu {
            stage: "dump-rename-temporary-file",
            path: path.to_path_buf(),
        })?;

        tracing::info!(path = ?path, chat_count = self.chats.len(), "wrote chat dump");
        Ok(())
    }

    pub fn read_from_path(path: &Path) -> StorageResult<Self> {
        let raw = std::fs::read_to_string(path).context(ReadDumpSnafu {
            stage: "dump-read-file",
            path: path.to_path_buf(),
        })?;
        Self::from_json(&raw)
    }
}
