//! Aprobación y rechazo de candidatas de la cola de scouting.
//!
//! Cada decisión son dos escrituras sin transacción común: copiar la
//! candidata a la tabla destino y marcar su estado en la cola. El id de la
//! candidata actúa como clave de idempotencia en el destino, así que repetir
//! una operación a medias nunca duplica filas: antes de insertar se busca si
//! la copia ya existe.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{CatalogStore, StoreError},
    models::{NewRejection, NewTechnology, QueueStatus, ScoutingQueueItem},
};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("la candidata {0} no existe en la cola de scouting")]
    NotFound(Uuid),

    #[error("la candidata {id} ya está en estado '{}'", .status.as_str())]
    Conflict { id: Uuid, status: QueueStatus },

    /// La copia existe pero la cola no se pudo marcar; reintentar es seguro.
    #[error("la candidata {queue_id} se copió ({destination_id}) pero no se pudo actualizar su estado: {source}")]
    Incomplete {
        queue_id: Uuid,
        destination_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    pub queue_id: Uuid,
    pub status: QueueStatus,
    pub destination_id: Uuid,
    /// `false` si la fila destino ya existía de un intento anterior.
    pub inserted: bool,
}

/// Pasa una candidata al catálogo de tecnologías.
pub async fn approve_queue_item(
    store: &dyn CatalogStore,
    queue_id: Uuid,
) -> Result<ReviewOutcome, ReviewError> {
    let item = load_for_review(store, queue_id, QueueStatus::Approved).await?;

    let (destination_id, inserted) = match store.find_technology_by_queue_id(queue_id).await? {
        Some(existing) => {
            info!("La candidata {} ya tenía copia en el catálogo ({})", queue_id, existing);
            (existing, false)
        }
        None => {
            let row = NewTechnology {
                scouting_queue_id: queue_id,
                data: item.data.clone(),
            };
            match store.insert_technology(&row).await {
                Ok(id) => (id, true),
                Err(StoreError::AlreadyExists(_)) => {
                    let id = recheck(store.find_technology_by_queue_id(queue_id).await?, queue_id)?;
                    (id, false)
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    finish(store, item, QueueStatus::Approved, destination_id, inserted).await
}

/// Mueve una candidata a `rejected_technologies` con el motivo indicado.
pub async fn reject_queue_item(
    store: &dyn CatalogStore,
    queue_id: Uuid,
    reason: Option<String>,
) -> Result<ReviewOutcome, ReviewError> {
    let item = load_for_review(store, queue_id, QueueStatus::Rejected).await?;

    let (destination_id, inserted) = match store.find_rejection_by_queue_id(queue_id).await? {
        Some(existing) => (existing, false),
        None => {
            let row = NewRejection {
                original_queue_id: queue_id,
                rejection_reason: reason.filter(|r| !r.trim().is_empty()),
                rejected_at: Utc::now(),
                data: item.data.clone(),
            };
            match store.insert_rejection(&row).await {
                Ok(id) => (id, true),
                Err(StoreError::AlreadyExists(_)) => {
                    let id = recheck(store.find_rejection_by_queue_id(queue_id).await?, queue_id)?;
                    (id, false)
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    finish(store, item, QueueStatus::Rejected, destination_id, inserted).await
}

/// Carga la candidata. Si ya está en el estado pedido se devuelve igualmente
/// para que la operación sea idempotente; el estado contrario es conflicto.
async fn load_for_review(
    store: &dyn CatalogStore,
    queue_id: Uuid,
    target: QueueStatus,
) -> Result<ScoutingQueueItem, ReviewError> {
    let item = store
        .get_queue_item(queue_id)
        .await?
        .ok_or(ReviewError::NotFound(queue_id))?;

    match item.queue_status {
        QueueStatus::Pending => Ok(item),
        status if status == target => Ok(item),
        status => Err(ReviewError::Conflict {
            id: queue_id,
            status,
        }),
    }
}

fn recheck(found: Option<Uuid>, queue_id: Uuid) -> Result<Uuid, ReviewError> {
    found.ok_or_else(|| {
        ReviewError::Store(StoreError::Backend {
            code: "INCONSISTENT".to_string(),
            message: format!(
                "la base de datos informó de un duplicado para {queue_id} pero no se encuentra la fila"
            ),
        })
    })
}

async fn finish(
    store: &dyn CatalogStore,
    item: ScoutingQueueItem,
    status: QueueStatus,
    destination_id: Uuid,
    inserted: bool,
) -> Result<ReviewOutcome, ReviewError> {
    if item.queue_status != status {
        if let Err(source) = store.set_queue_status(item.id, status).await {
            warn!(
                "Candidata {} copiada a {} pero sin marcar como '{}': {}",
                item.id,
                destination_id,
                status.as_str(),
                source
            );
            return Err(ReviewError::Incomplete {
                queue_id: item.id,
                destination_id,
                source,
            });
        }
    }

    info!(
        "Candidata '{}' ({}) marcada como '{}'",
        item.data.name,
        item.id,
        status.as_str()
    );
    Ok(ReviewOutcome {
        queue_id: item.id,
        status,
        destination_id,
        inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TechnologyListing;
    use crate::memory_store::MemoryStore;
    use crate::models::{TechnologyData, TechnologyRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Envuelve un `MemoryStore` y hace fallar las primeras N
    /// actualizaciones de estado.
    struct FlakyStatusStore {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl CatalogStore for FlakyStatusStore {
        async fn list_technologies(&self) -> Result<TechnologyListing, StoreError> {
            self.inner.list_technologies().await
        }
        async fn get_queue_item(&self, id: Uuid) -> Result<Option<ScoutingQueueItem>, StoreError> {
            self.inner.get_queue_item(id).await
        }
        async fn find_technology_by_queue_id(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
            self.inner.find_technology_by_queue_id(id).await
        }
        async fn insert_technology(&self, row: &NewTechnology) -> Result<Uuid, StoreError> {
            self.inner.insert_technology(row).await
        }
        async fn find_rejection_by_queue_id(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
            self.inner.find_rejection_by_queue_id(id).await
        }
        async fn insert_rejection(&self, row: &NewRejection) -> Result<Uuid, StoreError> {
            self.inner.insert_rejection(row).await
        }
        async fn set_queue_status(&self, id: Uuid, status: QueueStatus) -> Result<(), StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend {
                    code: "08006".to_string(),
                    message: "conexión perdida".to_string(),
                });
            }
            self.inner.set_queue_status(id, status).await
        }
        async fn add_favorite(&self, user: Uuid, tech: Uuid) -> Result<(), StoreError> {
            self.inner.add_favorite(user, tech).await
        }
        async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
            self.inner.column_names(table).await
        }
    }

    fn candidate() -> TechnologyData {
        TechnologyData {
            name: "Membrana UF-200".to_string(),
            provider: Some("Hidro Sistemas".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_approve_copies_and_marks() {
        let store = MemoryStore::new();
        let queue_id = store.enqueue(candidate(), None).await;

        let outcome = approve_queue_item(&store, queue_id).await.unwrap();

        assert!(outcome.inserted);
        assert_eq!(outcome.status, QueueStatus::Approved);
        let listing = store.list_technologies().await.unwrap();
        assert_eq!(
            listing.records,
            vec![TechnologyRecord::new(outcome.destination_id, candidate())]
        );
        let item = store.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.queue_status, QueueStatus::Approved);
    }

    #[tokio::test]
    async fn test_approve_twice_is_idempotent() {
        let store = MemoryStore::new();
        let queue_id = store.enqueue(candidate(), None).await;

        let first = approve_queue_item(&store, queue_id).await.unwrap();
        let second = approve_queue_item(&store, queue_id).await.unwrap();

        assert_eq!(first.destination_id, second.destination_id);
        assert!(!second.inserted);
        assert_eq!(store.technology_count().await, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_recovers_without_duplicates() {
        let store = FlakyStatusStore {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(1),
        };
        let queue_id = store.inner.enqueue(candidate(), None).await;

        let err = approve_queue_item(&store, queue_id).await.unwrap_err();
        let destination = match err {
            ReviewError::Incomplete { destination_id, .. } => destination_id,
            other => panic!("se esperaba Incomplete, llegó {other:?}"),
        };
        assert_eq!(store.inner.technology_count().await, 1);

        let outcome = approve_queue_item(&store, queue_id).await.unwrap();
        assert_eq!(outcome.destination_id, destination);
        assert!(!outcome.inserted);
        assert_eq!(store.inner.technology_count().await, 1);
        let item = store.get_queue_item(queue_id).await.unwrap().unwrap();
        assert_eq!(item.queue_status, QueueStatus::Approved);
    }

    #[tokio::test]
    async fn test_reject_records_reason_and_recovers() {
        let store = FlakyStatusStore {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(1),
        };
        let queue_id = store.inner.enqueue(candidate(), None).await;

        assert!(matches!(
            reject_queue_item(&store, queue_id, Some("Duplicada".into())).await,
            Err(ReviewError::Incomplete { .. })
        ));
        let outcome = reject_queue_item(&store, queue_id, Some("Duplicada".into()))
            .await
            .unwrap();

        assert_eq!(outcome.status, QueueStatus::Rejected);
        assert_eq!(store.inner.rejection_count().await, 1);
    }

    #[tokio::test]
    async fn test_opposite_decision_is_a_conflict() {
        let store = MemoryStore::new();
        let queue_id = store.enqueue(candidate(), None).await;
        approve_queue_item(&store, queue_id).await.unwrap();

        let err = reject_queue_item(&store, queue_id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ReviewError::Conflict {
                status: QueueStatus::Approved,
                ..
            }
        ));
        assert_eq!(store.rejection_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_candidate() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            approve_queue_item(&store, id).await,
            Err(ReviewError::NotFound(missing)) if missing == id
        ));
    }
}
