//! Funciones proxy hacia el backend de Railway.
//!
//! Cada función valida la petición, la reenvía a una ruta fija del backend
//! con un tiempo máximo propio y devuelve tal cual el estado, el tipo de
//! contenido y el cuerpo recibidos. Un timeout se traduce en 504 y un fallo
//! de transporte en 500, ambos con cuerpo JSON `{error, code}`.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Json, RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::AppState,
    audit::{self, TableNamingReport},
    config::ProxyTimeouts,
    models::TechnologyData,
};

/// Cabecera con el secreto compartido del webhook de scouting.
pub const SCOUTING_SECRET_HEADER: &str = "x-scouting-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFunction {
    DeepAdvisor,
    ReceiveScoutingTechnology,
    RunDatabaseAudit,
    SearchScoutingSources,
}

impl EdgeFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeepAdvisor => "deep-advisor",
            Self::ReceiveScoutingTechnology => "receive-scouting-technology",
            Self::RunDatabaseAudit => "run-database-audit",
            Self::SearchScoutingSources => "search-scouting-sources",
        }
    }

    pub fn upstream_path(&self) -> &'static str {
        match self {
            Self::DeepAdvisor => "/api/advisor/deep/stream",
            Self::ReceiveScoutingTechnology => "/api/scouting/technologies",
            Self::RunDatabaseAudit => "/api/database/audit",
            Self::SearchScoutingSources => "/api/scouting/sources/search",
        }
    }

    pub fn timeout(&self, timeouts: &ProxyTimeouts) -> Duration {
        match self {
            Self::DeepAdvisor => timeouts.deep_advisor,
            Self::ReceiveScoutingTechnology => timeouts.receive_technology,
            Self::RunDatabaseAudit => timeouts.database_audit,
            Self::SearchScoutingSources => timeouts.search_sources,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("El backend no respondió a tiempo en '{function}' ({} s)", .after.as_secs())]
    Timeout {
        function: &'static str,
        after: Duration,
    },

    #[error("No se pudo conectar con el backend en '{function}': {source}")]
    Connection {
        function: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Secreto de scouting no válido o ausente.")]
    Unauthorized,

    #[error("Petición no válida: {0}")]
    InvalidPayload(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            Self::Timeout { .. } | Self::Connection { .. } => error!("{}", self),
            _ => warn!("{}", self),
        }
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

/// Respuesta completa del backend, ya leída.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for UpstreamReply {
    fn into_response(self) -> Response {
        relay(self.status, self.content_type, Body::from(self.body))
    }
}

fn relay(status: StatusCode, content_type: Option<HeaderValue>, body: Body) -> Response {
    let mut response = (status, body).into_response();
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

/// Cliente HTTP compartido por todas las funciones proxy.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    http: reqwest::Client,
    base: Url,
    timeouts: ProxyTimeouts,
}

impl UpstreamProxy {
    pub fn new(base: Url, timeouts: ProxyTimeouts) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("No se pudo crear el cliente HTTP de los proxies")?;
        Ok(Self {
            http,
            base,
            timeouts,
        })
    }

    /// URL del backend para `function`, respetando la ruta base configurada.
    pub fn endpoint(&self, function: EdgeFunction, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let path = format!(
            "{}{}",
            self.base.path().trim_end_matches('/'),
            function.upstream_path()
        );
        url.set_path(&path);
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    fn request(
        &self,
        function: EdgeFunction,
        method: Method,
        query: Option<&str>,
        body: Bytes,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, self.endpoint(function, query));
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        request
    }

    /// Reenvía la petición y lee la respuesta entera dentro del tiempo
    /// máximo de la función.
    pub async fn forward(
        &self,
        function: EdgeFunction,
        method: Method,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<UpstreamReply, ProxyError> {
        let limit = function.timeout(&self.timeouts);
        let request = self.request(function, method, query, body);
        info!("Reenviando '{}' al backend", function.name());

        let exchange = async {
            let response = request.send().await?;
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response.headers().get(CONTENT_TYPE).cloned();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(UpstreamReply {
                status,
                content_type,
                body,
            })
        };

        match tokio::time::timeout(limit, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(source)) => Err(ProxyError::Connection {
                function: function.name(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout {
                function: function.name(),
                after: limit,
            }),
        }
    }

    /// Reenvía la petición y devuelve el cuerpo en streaming. El tiempo
    /// máximo cubre sólo la espera de las cabeceras.
    pub async fn forward_streaming(
        &self,
        function: EdgeFunction,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let limit = function.timeout(&self.timeouts);
        let request = self.request(function, Method::POST, None, body);
        info!("Reenviando '{}' al backend en streaming", function.name());

        let response = match tokio::time::timeout(limit, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(ProxyError::Connection {
                    function: function.name(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProxyError::Timeout {
                    function: function.name(),
                    after: limit,
                })
            }
        };

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        Ok(relay(
            status,
            content_type,
            Body::from_stream(response.bytes_stream()),
        ))
    }
}

// --- Handlers ---

#[axum::debug_handler]
pub async fn deep_advisor_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    state
        .proxy
        .forward_streaming(EdgeFunction::DeepAdvisor, body)
        .await
}

#[derive(Debug, Deserialize)]
pub struct ScoutingSubmission {
    pub technology: TechnologyData,
}

/// Valida el cuerpo del webhook de scouting y devuelve la tecnología
/// normalizada.
pub fn validate_submission(body: &[u8]) -> Result<TechnologyData, ProxyError> {
    let submission: ScoutingSubmission = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidPayload(format!("se esperaba {{\"technology\": {{...}}}}: {e}")))?;
    let technology = submission
        .technology
        .normalized()
        .map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;
    if technology.name.is_empty() {
        return Err(ProxyError::InvalidPayload(
            "la tecnología debe tener nombre".to_string(),
        ));
    }
    Ok(technology)
}

#[axum::debug_handler]
pub async fn receive_technology_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<UpstreamReply, ProxyError> {
    let authorized = headers
        .get(SCOUTING_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|secret| secret == state.config.scouting_webhook_secret);
    if !authorized {
        return Err(ProxyError::Unauthorized);
    }

    let technology = validate_submission(&body)?;
    info!("Tecnología recibida por webhook: '{}'", technology.name);
    let payload = json!({ "technology": technology });
    state
        .proxy
        .forward(
            EdgeFunction::ReceiveScoutingTechnology,
            Method::POST,
            None,
            Bytes::from(payload.to_string()),
        )
        .await
}

#[axum::debug_handler]
pub async fn database_audit_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let mut reply = state
        .proxy
        .forward(EdgeFunction::RunDatabaseAudit, Method::POST, None, body)
        .await?;
    if !reply.status.is_success() {
        return Ok(reply.into_response());
    }

    if let Ok(Value::Object(mut report)) = serde_json::from_slice::<Value>(&reply.body) {
        let naming = naming_audit(&state).await;
        report.insert("naming_audit".to_string(), json!(naming));
        reply.body = Bytes::from(Value::Object(report).to_string());
        reply.content_type = Some(HeaderValue::from_static("application/json"));
    }
    Ok(reply.into_response())
}

/// Audita los nombres de columna de las tablas configuradas. Una tabla que
/// no se puede leer se omite del informe.
async fn naming_audit(state: &AppState) -> Vec<TableNamingReport> {
    let mut reports = Vec::new();
    for table in &state.config.audit_tables {
        match state.store.column_names(table).await {
            Ok(columns) => {
                let report = audit::audit_table(table, &columns);
                if report.inconsistent {
                    warn!(
                        "La tabla '{}' mezcla estilos de nombre de columna ({} de {} en snake_case)",
                        table, report.snake_case_columns, report.total_columns
                    );
                }
                reports.push(report);
            }
            Err(e) => warn!("No se pudieron leer las columnas de '{}': {}", table, e),
        }
    }
    reports
}

#[axum::debug_handler]
pub async fn search_sources_handler(
    State(state): State<AppState>,
    method: Method,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<UpstreamReply, ProxyError> {
    state
        .proxy
        .forward(
            EdgeFunction::SearchScoutingSources,
            method,
            query.as_deref(),
            body,
        )
        .await
}
