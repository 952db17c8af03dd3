//! Persistencia del chat activo del asesor.
//!
//! Es un puerto inyectado con ciclo de vida explícito `load`/`save`/`clear`,
//! implementado sobre un fichero JSON (y en memoria para los tests).

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[async_trait]
pub trait ActiveChatStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn save(&self, chat_id: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    active: RwLock<Option<String>>,
}

#[cfg(test)]
impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl ActiveChatStore for MemoryChatStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.active.read().await.clone())
    }

    async fn save(&self, chat_id: &str) -> Result<()> {
        *self.active.write().await = Some(chat_id.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.active.write().await = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveChatFile {
    active_chat_id: String,
    updated_at: DateTime<Utc>,
}

/// Guarda el chat activo en un fichero JSON en disco.
#[derive(Debug, Clone)]
pub struct FileChatStore {
    path: PathBuf,
}

impl FileChatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ActiveChatStore for FileChatStore {
    async fn load(&self) -> Result<Option<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("No se pudo leer el chat activo de {}", self.path.display())
                })
            }
        };

        match serde_json::from_str::<ActiveChatFile>(&raw) {
            Ok(file) => Ok(Some(file.active_chat_id)),
            Err(e) => {
                // Un fichero corrupto equivale a no tener chat activo.
                warn!(
                    "Fichero de chat activo corrupto en {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, chat_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("No se pudo crear el directorio {}", parent.display())
                })?;
            }
        }

        let contents = serde_json::to_string_pretty(&ActiveChatFile {
            active_chat_id: chat_id.to_string(),
            updated_at: Utc::now(),
        })?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("No se pudo guardar el chat activo en {}", self.path.display()))?;
        info!("Chat activo guardado: {}", chat_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("No se pudo borrar el chat activo de {}", self.path.display())
            }),
        }
    }
}
