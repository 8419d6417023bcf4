//! In-memory conversation history, optionally mirrored to a JSON Lines file.

use std::path::{Path, PathBuf};

use parley_types::{BoxFuture, Message, PersistenceSink, SinkError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only message list for one interactive session.
///
/// Messages are only removed by [`Conversation::clear`].
pub struct Conversation {
    messages: Mutex<Vec<Message>>,
    transcript: Option<PathBuf>,
}

impl Conversation {
    pub fn in_memory() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            transcript: None,
        }
    }

    /// Open a conversation mirrored to `path`, resuming any messages already
    /// recorded there.
    pub async fn open(path: PathBuf) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let messages = match tokio::fs::read_to_string(&path).await {
            Ok(data) => parse_transcript(&data, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            messages: Mutex::new(messages),
            transcript: Some(path),
        })
    }

    pub async fn push(&self, message: Message) -> Result<(), SinkError> {
        let mut messages = self.messages.lock().await;
        if let Some(path) = &self.transcript {
            let mut line = serde_json::to_string(&message)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        messages.push(message);
        Ok(())
    }

    /// Snapshot of the history, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Drop every message, truncating the transcript if there is one.
    pub async fn clear(&self) -> Result<(), SinkError> {
        let mut messages = self.messages.lock().await;
        if let Some(path) = &self.transcript {
            tokio::fs::write(path, b"").await?;
        }
        messages.clear();
        Ok(())
    }
}

impl PersistenceSink for Conversation {
    fn append_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(self.push(message.clone()))
    }
}

fn parse_transcript(data: &str, path: &Path) -> Vec<Message> {
    data.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("Skipping bad transcript line in {}: {e}", path.display());
                None
            }
        })
        .collect()
}
