//! Carga del historial de un chat del asesor desde dos orígenes en paralelo
//! (base de datos local y backend externo). Se prefiere el externo cuando
//! trae mensajes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ChatHistorySource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOrigin {
    External,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedChat {
    pub chat_id: String,
    pub origin: HistoryOrigin,
    pub messages: Vec<ChatMessage>,
}

/// Lanza las dos lecturas a la vez y elige resultado: el externo si no está
/// vacío, si no el local. Sólo falla si fallan ambos orígenes.
pub async fn load_chat(
    local: &dyn ChatHistorySource,
    external: &dyn ChatHistorySource,
    chat_id: &str,
) -> Result<LoadedChat> {
    let (local_result, external_result) =
        tokio::join!(local.messages(chat_id), external.messages(chat_id));

    let (origin, messages) = match (local_result, external_result) {
        (local_result, Ok(messages)) if !messages.is_empty() => {
            if let Err(e) = local_result {
                warn!("Historial local ({}) no disponible: {:#}", local.name(), e);
            }
            (HistoryOrigin::External, messages)
        }
        (Ok(messages), external_result) => {
            if let Err(e) = external_result {
                warn!("Historial externo ({}) no disponible: {:#}", external.name(), e);
            }
            (HistoryOrigin::Local, messages)
        }
        (Err(e), Ok(messages)) => {
            warn!("Historial local ({}) no disponible: {:#}", local.name(), e);
            (HistoryOrigin::External, messages)
        }
        (Err(local_err), Err(external_err)) => {
            return Err(anyhow!(
                "No se pudo cargar el chat {chat_id}: local ({local_err:#}), externo ({external_err:#})"
            ));
        }
    };

    info!(
        "Chat {} cargado desde {:?} con {} mensajes.",
        chat_id,
        origin,
        messages.len()
    );
    Ok(LoadedChat {
        chat_id: chat_id.to_string(),
        origin,
        messages,
    })
}

/// Historial guardado en el backend externo.
#[derive(Debug, Clone)]
pub struct RailwayChatHistory {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MessagesBody {
    Bare(Vec<ChatMessage>),
    Wrapped { messages: Vec<ChatMessage> },
}

impl RailwayChatHistory {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("No se pudo crear el cliente HTTP del historial")?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl ChatHistorySource for RailwayChatHistory {
    fn name(&self) -> &'static str {
        "railway"
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("URL base no válida: {}", self.base_url))?
            .pop_if_empty()
            .extend(["api", "advisor", "chats", chat_id, "messages"]);

        let body = self
            .http
            .get(url)
            .send()
            .await
            .context("Fallo al pedir el historial al backend")?
            .error_for_status()
            .context("El backend devolvió un error al pedir el historial")?
            .json::<MessagesBody>()
            .await
            .context("Respuesta de historial no válida")?;

        Ok(match body {
            MessagesBody::Bare(messages) => messages,
            MessagesBody::Wrapped { messages } => messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_server;
    use axum::{extract::Path, routing::get, Json, Router};
    use serde_json::json;

    struct FixedSource {
        name: &'static str,
        result: std::result::Result<Vec<ChatMessage>, &'static str>,
    }

    #[async_trait]
    impl ChatHistorySource for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn messages(&self, _chat_id: &str) -> Result<Vec<ChatMessage>> {
            self.result.clone().map_err(|e| anyhow!(e))
        }
    }

    fn msg(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
            created_at: None,
        }
    }

    fn source(name: &'static str, result: std::result::Result<Vec<ChatMessage>, &'static str>) -> FixedSource {
        FixedSource { name, result }
    }

    #[tokio::test]
    async fn test_prefers_non_empty_external() {
        let local = source("local", Ok(vec![msg("local")]));
        let external = source("externo", Ok(vec![msg("externo")]));
        let chat = load_chat(&local, &external, "c1").await.unwrap();
        assert_eq!(chat.origin, HistoryOrigin::External);
        assert_eq!(chat.messages, vec![msg("externo")]);
    }

    #[tokio::test]
    async fn test_falls_back_to_local_when_external_is_empty() {
        let local = source("local", Ok(vec![msg("local")]));
        let external = source("externo", Ok(vec![]));
        let chat = load_chat(&local, &external, "c1").await.unwrap();
        assert_eq!(chat.origin, HistoryOrigin::Local);
        assert_eq!(chat.messages, vec![msg("local")]);
    }

    #[tokio::test]
    async fn test_one_failing_side_is_tolerated() {
        let local = source("local", Ok(vec![msg("local")]));
        let external = source("externo", Err("caído"));
        let chat = load_chat(&local, &external, "c1").await.unwrap();
        assert_eq!(chat.origin, HistoryOrigin::Local);

        let local = source("local", Err("caído"));
        let external = source("externo", Ok(vec![]));
        let chat = load_chat(&local, &external, "c1").await.unwrap();
        assert_eq!(chat.origin, HistoryOrigin::External);
        assert!(chat.messages.is_empty());
    }

    #[tokio::test]
    async fn test_both_failing_is_an_error() {
        let local = source("local", Err("sin red"));
        let external = source("externo", Err("timeout"));
        let err = load_chat(&local, &external, "c1").await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("sin red") && text.contains("timeout"));
    }

    #[tokio::test]
    async fn test_railway_history_accepts_both_body_shapes() {
        let router = Router::new().route(
            "/api/advisor/chats/:id/messages",
            get(|Path(id): Path<String>| async move {
                if id == "envuelto" {
                    Json(json!({"messages": [{"role": "assistant", "content": "hola"}]}))
                } else {
                    Json(json!([{"role": "user", "content": id}]))
                }
            }),
        );
        let addr = spawn_server(router).await;
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let history = RailwayChatHistory::new(base, Duration::from_secs(5)).unwrap();

        let wrapped = history.messages("envuelto").await.unwrap();
        assert_eq!(wrapped[0].content, "hola");
        let bare = history.messages("c-42").await.unwrap();
        assert_eq!(bare[0].content, "c-42");
    }
}
