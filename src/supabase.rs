//! Cliente de Supabase (PostgREST) que implementa `CatalogStore` y sirve de
//! historial local del asesor.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header::HeaderValue, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::{
    catalog::{
        CatalogStore, StoreError, TechnologyListing, CHAT_MESSAGES_TABLE, FAVORITES_TABLE,
        REJECTED_TABLE, SCOUTING_QUEUE_TABLE, TECHNOLOGIES_TABLE,
    },
    chat_history::{ChatHistorySource, ChatMessage},
    models::{
        decode_rows, NewRejection, NewTechnology, QueueStatus, ScoutingQueueItem,
        TechnologyRecord,
    },
};

/// Filas por página al listar tablas grandes.
pub const PAGE_SIZE: usize = 1000;

/// Cuerpo de error estándar de PostgREST.
#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Deserialize)]
struct IdRow {
    id: Uuid,
}

#[derive(Serialize)]
struct FavoriteRow {
    user_id: Uuid,
    technology_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    http: reqwest::Client,
    rest_url: Url,
    api_key: String,
}

impl SupabaseStore {
    pub fn new(project_url: &Url, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let rest_url = project_url
            .join("rest/v1/")
            .with_context(|| format!("URL de Supabase no válida: {project_url}"))?;
        let api_key = api_key.into();
        HeaderValue::from_str(&api_key).map_err(|_| anyhow!("La clave de Supabase no es una cabecera válida"))?;
        let http = reqwest::Client::builder()
            .build()
            .context("No se pudo crear el cliente HTTP de Supabase")?;
        info!("Usando Supabase en {}", rest_url);
        Ok(Self {
            http,
            rest_url,
            api_key,
        })
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, StoreError> {
        let url = self.rest_url.join(table).map_err(|e| StoreError::Backend {
            code: "URL".to_string(),
            message: format!("tabla '{table}' no válida: {e}"),
        })?;
        Ok(self
            .http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json"))
    }

    /// Envía la petición y devuelve las filas JSON, traduciendo los errores
    /// de PostgREST.
    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Value>, StoreError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(Vec::new());
            }
            let value: Value = serde_json::from_str(&body).map_err(crate::models::DecodeError::from)?;
            return Ok(match value {
                Value::Array(rows) => rows,
                Value::Null => Vec::new(),
                other => vec![other],
            });
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<PostgrestError>(&body).ok();
        let code = error
            .as_ref()
            .and_then(|e| e.code.clone())
            .unwrap_or_else(|| status.as_u16().to_string());
        let message = error
            .map(|e| {
                let message = e.message.unwrap_or_default();
                match e.details {
                    Some(details) => format!("{message} ({details})"),
                    None => message,
                }
            })
            .unwrap_or(body);
        Err(StoreError::from_postgres(&code, message))
    }

    async fn find_id(&self, table: &str, column: &str, value: Uuid) -> Result<Option<Uuid>, StoreError> {
        let request = self
            .request(Method::GET, table)?
            .query(&[("select", "id".to_string()), (column, format!("eq.{value}")), ("limit", "1".to_string())]);
        let rows = self.rows(request).await?;
        first_id(rows)
    }

    async fn insert_returning_id(&self, table: &str, row: Value) -> Result<Uuid, StoreError> {
        let request = self
            .request(Method::POST, table)?
            .header("Prefer", "return=representation")
            .json(&row);
        let rows = self.rows(request).await?;
        first_id(rows)?.ok_or_else(|| StoreError::Backend {
            code: "EMPTY".to_string(),
            message: format!("la inserción en '{table}' no devolvió ninguna fila"),
        })
    }
}

fn first_id(rows: Vec<Value>) -> Result<Option<Uuid>, StoreError> {
    match rows.into_iter().next() {
        Some(row) => {
            let IdRow { id } = serde_json::from_value(row).map_err(crate::models::DecodeError::from)?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

fn to_row<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode(e.into()))
}

#[async_trait]
impl CatalogStore for SupabaseStore {
    async fn list_technologies(&self) -> Result<TechnologyListing, StoreError> {
        let mut all_rows = Vec::new();
        loop {
            let from = all_rows.len();
            let request = self
                .request(Method::GET, TECHNOLOGIES_TABLE)?
                .query(&[("select", "*"), ("order", "id.asc")])
                .header("Range-Unit", "items")
                .header("Range", format!("{}-{}", from, from + PAGE_SIZE - 1));
            let page = self.rows(request).await?;
            let page_len = page.len();
            all_rows.extend(page);
            debug!("Página de tecnologías: {} filas (total {})", page_len, all_rows.len());
            if page_len < PAGE_SIZE {
                break;
            }
        }

        let (records, rejected_rows) =
            decode_rows(TECHNOLOGIES_TABLE, all_rows, TechnologyRecord::decode);
        Ok(TechnologyListing {
            records,
            rejected_rows,
        })
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<ScoutingQueueItem>, StoreError> {
        let request = self
            .request(Method::GET, SCOUTING_QUEUE_TABLE)?
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))]);
        match self.rows(request).await?.into_iter().next() {
            Some(row) => Ok(Some(ScoutingQueueItem::decode(row)?)),
            None => Ok(None),
        }
    }

    async fn find_technology_by_queue_id(
        &self,
        queue_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        self.find_id(TECHNOLOGIES_TABLE, "scouting_queue_id", queue_id)
            .await
    }

    async fn insert_technology(&self, row: &NewTechnology) -> Result<Uuid, StoreError> {
        self.insert_returning_id(TECHNOLOGIES_TABLE, to_row(row)?).await
    }

    async fn find_rejection_by_queue_id(
        &self,
        queue_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        self.find_id(REJECTED_TABLE, "original_queue_id", queue_id)
            .await
    }

    async fn insert_rejection(&self, row: &NewRejection) -> Result<Uuid, StoreError> {
        self.insert_returning_id(REJECTED_TABLE, to_row(row)?).await
    }

    async fn set_queue_status(&self, id: Uuid, status: QueueStatus) -> Result<(), StoreError> {
        let request = self
            .request(Method::PATCH, SCOUTING_QUEUE_TABLE)?
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&json!({
                "queue_status": status.as_str(),
                "reviewed_at": Utc::now(),
            }));
        if self.rows(request).await?.is_empty() {
            return Err(StoreError::NotFound(format!("scouting_queue {id}")));
        }
        Ok(())
    }

    async fn add_favorite(&self, user_id: Uuid, technology_id: Uuid) -> Result<(), StoreError> {
        let request = self
            .request(Method::POST, FAVORITES_TABLE)?
            .header("Prefer", "return=minimal")
            .json(&FavoriteRow {
                user_id,
                technology_id,
            });
        self.rows(request).await?;
        Ok(())
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let request = self
            .request(Method::GET, table)?
            .query(&[("select", "*"), ("limit", "1")]);
        Ok(match self.rows(request).await?.into_iter().next() {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }
}

#[async_trait]
impl ChatHistorySource for SupabaseStore {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn messages(&self, chat_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let request = self
            .request(Method::GET, CHAT_MESSAGES_TABLE)?
            .query(&[
                ("select", "role,content,created_at".to_string()),
                ("chat_id", format!("eq.{chat_id}")),
                ("order", "created_at.asc".to_string()),
            ]);
        let rows = self.rows(request).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).context("Mensaje de chat no válido"))
            .collect()
    }
}
