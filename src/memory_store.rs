//! Implementación en memoria del catálogo y del historial de chat. Se usa
//! cuando no hay Supabase configurado y en los tests.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    catalog::{
        CatalogStore, StoreError, TechnologyListing, FAVORITES_TABLE, REJECTED_TABLE,
        SCOUTING_QUEUE_TABLE, TECHNOLOGIES_TABLE,
    },
    chat_history::{ChatHistorySource, ChatMessage},
    models::{NewRejection, NewTechnology, QueueStatus, ScoutingQueueItem, TechnologyRecord},
};

#[derive(Debug, Clone)]
struct StoredTechnology {
    record: TechnologyRecord,
    scouting_queue_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Tables {
    technologies: Vec<StoredTechnology>,
    queue: HashMap<Uuid, ScoutingQueueItem>,
    rejections: Vec<(Uuid, NewRejection)>,
    favorites: HashSet<(Uuid, Uuid)>,
    messages: HashMap<String, Vec<ChatMessage>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Carga de datos de prueba; en producción las filas llegan del backend.
#[cfg(test)]
impl MemoryStore {
    pub async fn add_technology(&self, record: TechnologyRecord) {
        self.tables.write().await.technologies.push(StoredTechnology {
            record,
            scouting_queue_id: None,
        });
    }

    /// Encola una candidata pendiente y devuelve su id.
    pub async fn enqueue(&self, data: crate::models::TechnologyData, source_url: Option<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.write().await.queue.insert(
            id,
            ScoutingQueueItem {
                id,
                queue_status: QueueStatus::Pending,
                source_url,
                data,
            },
        );
        id
    }

    pub async fn add_message(&self, chat_id: &str, message: ChatMessage) {
        self.tables
            .write()
            .await
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
    }

    pub async fn technology_count(&self) -> usize {
        self.tables.read().await.technologies.len()
    }

    pub async fn rejection_count(&self) -> usize {
        self.tables.read().await.rejections.len()
    }
}

fn sample_columns(row: Option<Value>) -> Vec<String> {
    match row {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_technologies(&self) -> Result<TechnologyListing, StoreError> {
        let tables = self.tables.read().await;
        Ok(TechnologyListing {
            records: tables
                .technologies
                .iter()
                .map(|t| t.record.clone())
                .collect(),
            rejected_rows: 0,
        })
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<ScoutingQueueItem>, StoreError> {
        Ok(self.tables.read().await.queue.get(&id).cloned())
    }

    async fn find_technology_by_queue_id(
        &self,
        queue_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .technologies
            .iter()
            .find(|t| t.scouting_queue_id == Some(queue_id))
            .map(|t| t.record.id))
    }

    async fn insert_technology(&self, row: &NewTechnology) -> Result<Uuid, StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .technologies
            .iter()
            .any(|t| t.scouting_queue_id == Some(row.scouting_queue_id))
        {
            return Err(StoreError::AlreadyExists(format!(
                "technologies.scouting_queue_id = {}",
                row.scouting_queue_id
            )));
        }
        let id = Uuid::new_v4();
        tables.technologies.push(StoredTechnology {
            record: TechnologyRecord::new(id, row.data.clone()),
            scouting_queue_id: Some(row.scouting_queue_id),
        });
        Ok(id)
    }

    async fn find_rejection_by_queue_id(
        &self,
        queue_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .rejections
            .iter()
            .find(|(_, r)| r.original_queue_id == queue_id)
            .map(|(id, _)| *id))
    }

    async fn insert_rejection(&self, row: &NewRejection) -> Result<Uuid, StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .rejections
            .iter()
            .any(|(_, r)| r.original_queue_id == row.original_queue_id)
        {
            return Err(StoreError::AlreadyExists(format!(
                "rejected_technologies.original_queue_id = {}",
                row.original_queue_id
            )));
        }
        let id = Uuid::new_v4();
        tables.rejections.push((id, row.clone()));
        Ok(id)
    }

    async fn set_queue_status(&self, id: Uuid, status: QueueStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let item = tables
            .queue
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("scouting_queue {id}")))?;
        item.queue_status = status;
        Ok(())
    }

    async fn add_favorite(&self, user_id: Uuid, technology_id: Uuid) -> Result<(), StoreError> {
        if !self.tables.write().await.favorites.insert((user_id, technology_id)) {
            return Err(StoreError::AlreadyExists(format!(
                "user_favorites ({user_id}, {technology_id})"
            )));
        }
        Ok(())
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let sample = match table {
            TECHNOLOGIES_TABLE => tables
                .technologies
                .first()
                .and_then(|t| serde_json::to_value(&t.record).ok()),
            SCOUTING_QUEUE_TABLE => tables
                .queue
                .values()
                .next()
                .and_then(|q| serde_json::to_value(q).ok()),
            REJECTED_TABLE => tables
                .rejections
                .first()
                .and_then(|(_, r)| serde_json::to_value(r).ok()),
            FAVORITES_TABLE => Some(serde_json::json!({"user_id": null, "technology_id": null})),
            other => return Err(StoreError::NotFound(format!("tabla '{other}'"))),
        };
        Ok(sample_columns(sample))
    }
}

#[async_trait]
impl ChatHistorySource for MemoryStore {
    fn name(&self) -> &'static str {
        "memoria"
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TechnologyData;

    fn data(name: &str) -> TechnologyData {
        TechnologyData {
            name: name.to_string(),
            provider: Some("Hidro Sistemas".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_technology_is_unique_per_queue_id() {
        let store = MemoryStore::new();
        let row = NewTechnology {
            scouting_queue_id: Uuid::new_v4(),
            data: data("AquaClean"),
        };
        let id = store.insert_technology(&row).await.unwrap();
        assert_eq!(
            store
                .find_technology_by_queue_id(row.scouting_queue_id)
                .await
                .unwrap(),
            Some(id)
        );
        assert!(matches!(
            store.insert_technology(&row).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_favorite_is_rejected() {
        let store = MemoryStore::new();
        let (user, tech) = (Uuid::new_v4(), Uuid::new_v4());
        store.add_favorite(user, tech).await.unwrap();
        assert!(matches!(
            store.add_favorite(user, tech).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_column_names_come_from_a_sample_row() {
        let store = MemoryStore::new();
        assert!(store.column_names(TECHNOLOGIES_TABLE).await.unwrap().is_empty());

        store
            .add_technology(TechnologyRecord::new(Uuid::new_v4(), data("AquaClean")))
            .await;
        let columns = store.column_names(TECHNOLOGIES_TABLE).await.unwrap();
        assert!(columns.contains(&"id".to_string()));
        assert!(columns.contains(&"Nombre de la tecnología".to_string()));
        assert!(columns.contains(&"Proveedor".to_string()));

        assert!(matches!(
            store.column_names("no_existe").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_status_of_missing_item() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set_queue_status(Uuid::new_v4(), QueueStatus::Approved).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
