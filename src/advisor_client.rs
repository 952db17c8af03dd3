//! Cliente del Deep Advisor: envía un turno de chat, consume la respuesta
//! SSE y va publicando el estado proyectado.
//!
//! - Un único reintento si el backend responde con un código reintentable
//!   (`TIMEOUT`, `SSE_TIMEOUT`, `CONNECTION_FAILED`) o no se puede conectar.
//! - Cancelación cooperativa con `CancellationToken`: se comprueba mientras
//!   se esperan las cabeceras y entre trozos del cuerpo.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::advisor_state::{AdvisorStreamReducer, StreamState};

/// Códigos de error del backend que justifican un reintento.
pub const RETRYABLE_CODES: [&str; 3] = ["TIMEOUT", "SSE_TIMEOUT", "CONNECTION_FAILED"];

const EVENT_STREAM: &str = "text/event-stream";

/// Turno de chat enviado al asesor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub deep_mode: bool,
}

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("operación cancelada por el usuario")]
    Cancelled,

    #[error("no se pudo conectar con el asesor: {0}")]
    Connection(#[source] reqwest::Error),

    #[error("error leyendo el flujo del asesor: {0}")]
    Stream(#[source] reqwest::Error),

    #[error("{message}")]
    Backend {
        code: Option<String>,
        message: String,
    },
}

impl AdvisorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Backend {
                code: Some(code), ..
            } => RETRYABLE_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeepAdvisorClient {
    http: reqwest::Client,
    endpoint: Url,
    header_timeout: Duration,
}

impl DeepAdvisorClient {
    pub fn new(endpoint: Url, header_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("No se pudo crear el cliente HTTP del asesor")?;
        Ok(Self {
            http,
            endpoint,
            header_timeout,
        })
    }

    /// Ejecuta un turno completo y devuelve el estado final. Cada evento
    /// aplicado se publica en `updates`; los errores acaban en `state.error`.
    pub async fn stream(
        &self,
        request: &AdvisorRequest,
        cancel: &CancellationToken,
        updates: &watch::Sender<StreamState>,
    ) -> StreamState {
        let mut reducer = AdvisorStreamReducer::new(StreamState::streaming());
        updates.send_replace(reducer.state().clone());

        let mut retried = false;
        loop {
            match self.attempt(request, cancel, &mut reducer, updates).await {
                Ok(()) => break,
                Err(AdvisorError::Cancelled) => {
                    info!("Flujo del asesor detenido por el usuario.");
                    reducer.state_mut().mark_stopped_by_user();
                    break;
                }
                Err(e) if !retried && e.is_retryable() => {
                    warn!("Error reintentable del asesor ({}), reintentando una vez...", e);
                    retried = true;
                }
                Err(e) => {
                    error!("Error en el flujo del asesor: {}", e);
                    reducer.state_mut().fail(e.to_string());
                    break;
                }
            }
        }

        let state = reducer.into_state();
        updates.send_replace(state.clone());
        state
    }

    async fn attempt(
        &self,
        request: &AdvisorRequest,
        cancel: &CancellationToken,
        reducer: &mut AdvisorStreamReducer,
        updates: &watch::Sender<StreamState>,
    ) -> Result<(), AdvisorError> {
        let send = self
            .http
            .post(self.endpoint.clone())
            .header(ACCEPT, EVENT_STREAM)
            .json(request)
            .send();

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdvisorError::Cancelled),
            sent = tokio::time::timeout(self.header_timeout, send) => match sent {
                Err(_) => {
                    return Err(AdvisorError::Backend {
                        code: Some("TIMEOUT".to_string()),
                        message: format!(
                            "El asesor no respondió en {} s",
                            self.header_timeout.as_secs()
                        ),
                    })
                }
                Ok(result) => result.map_err(AdvisorError::Connection)?,
            },
        };

        if !response.status().is_success() || !is_event_stream(&response) {
            return Err(backend_error(response).await);
        }

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AdvisorError::Cancelled),
                chunk = response.chunk() => chunk.map_err(AdvisorError::Stream)?,
            };
            let Some(bytes) = chunk else { break };

            let outcome = reducer.feed(&bytes);
            if outcome.events > 0 {
                updates.send_replace(reducer.state().clone());
            }
            if outcome.appended_text {
                // Deja respirar a quien observa el estado mientras llega texto.
                tokio::task::yield_now().await;
            }
        }

        reducer.finish();
        reducer.state_mut().is_streaming = false;
        Ok(())
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(EVENT_STREAM))
}

/// Convierte una respuesta no SSE en error, buscando un `code` en el JSON.
async fn backend_error(response: reqwest::Response) -> AdvisorError {
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return AdvisorError::Stream(e),
    };
    let parsed: Option<Value> = serde_json::from_str(&body).ok();

    let code = parsed.as_ref().and_then(|json| {
        json.get("code")
            .or_else(|| json.get("error").and_then(|e| e.get("code")))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let message = parsed
        .as_ref()
        .and_then(|json| {
            ["error", "message", "detail"]
                .iter()
                .find_map(|key| json.get(*key).and_then(Value::as_str))
                .or_else(|| {
                    json.get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                })
        })
        .map(str::to_string)
        .unwrap_or_else(|| format!("El asesor respondió con HTTP {}", status.as_u16()));

    AdvisorError::Backend { code, message }
}
