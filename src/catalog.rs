//! Acceso al catálogo de tecnologías y a la cola de scouting.
//!
//! `CatalogStore` es la costura entre la lógica de la aplicación y la base de
//! datos: `SupabaseStore` habla con PostgREST y `MemoryStore` sirve para
//! desarrollo local y tests.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    DecodeError, NewRejection, NewTechnology, QueueStatus, ScoutingQueueItem, TechnologyRecord,
};

/// Código de Postgres para violación de restricción única.
pub const UNIQUE_VIOLATION: &str = "23505";

pub const TECHNOLOGIES_TABLE: &str = "technologies";
pub const SCOUTING_QUEUE_TABLE: &str = "scouting_queue";
pub const REJECTED_TABLE: &str = "rejected_technologies";
pub const FAVORITES_TABLE: &str = "user_favorites";
pub const CHAT_MESSAGES_TABLE: &str = "advisor_chat_messages";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registro no encontrado: {0}")]
    NotFound(String),

    #[error("el registro ya existe: {0}")]
    AlreadyExists(String),

    #[error("error de la base de datos ({code}): {message}")]
    Backend { code: String, message: String },

    #[error("error HTTP con la base de datos: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl StoreError {
    /// Traduce un error de Postgres; las violaciones de unicidad se tratan
    /// aparte para poder dar un mensaje amable.
    pub fn from_postgres(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == UNIQUE_VIOLATION {
            Self::AlreadyExists(message)
        } else {
            Self::Backend {
                code: code.to_string(),
                message,
            }
        }
    }
}

/// Listado del catálogo tras la validación fila a fila.
#[derive(Debug, Clone, Default)]
pub struct TechnologyListing {
    pub records: Vec<TechnologyRecord>,
    pub rejected_rows: usize,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_technologies(&self) -> Result<TechnologyListing, StoreError>;

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<ScoutingQueueItem>, StoreError>;

    /// Busca la tecnología creada a partir de una candidata de la cola.
    async fn find_technology_by_queue_id(&self, queue_id: Uuid)
        -> Result<Option<Uuid>, StoreError>;

    async fn insert_technology(&self, row: &NewTechnology) -> Result<Uuid, StoreError>;

    /// Busca el rechazo registrado para una candidata de la cola.
    async fn find_rejection_by_queue_id(&self, queue_id: Uuid)
        -> Result<Option<Uuid>, StoreError>;

    async fn insert_rejection(&self, row: &NewRejection) -> Result<Uuid, StoreError>;

    async fn set_queue_status(&self, id: Uuid, status: QueueStatus) -> Result<(), StoreError>;

    async fn add_favorite(&self, user_id: Uuid, technology_id: Uuid) -> Result<(), StoreError>;

    /// Nombres de columna de una tabla, obtenidos de una fila de muestra.
    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError>;
}
