use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    advisor_client::AdvisorRequest,
    advisor_state::{AgentStatus, StreamState},
    app_state::{lock, AppState, Status, TurnGuard},
    catalog::StoreError,
    chat_history::{load_chat, LoadedChat},
    proxy,
    quality::{self, QualityReport},
    review::{self, ReviewError, ReviewOutcome},
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

// --- Payloads y Respuestas de la API ---

#[derive(Debug, Default, Deserialize)]
pub struct RejectPayload {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FavoritePayload {
    user_id: Uuid,
    technology_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ActiveChatResponse {
    active_chat_id: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/quality-stats", get(quality_stats_handler))
        .route("/api/scouting-queue/:id/approve", post(approve_handler))
        .route("/api/scouting-queue/:id/reject", post(reject_handler))
        .route("/api/favorites", post(add_favorite_handler))
        .route("/api/advisor/ask", post(advisor_ask_handler))
        .route("/api/advisor/stop", post(advisor_stop_handler))
        .route(
            "/api/advisor/active-chat",
            get(get_active_chat_handler).delete(clear_active_chat_handler),
        )
        .route("/api/advisor/chats/:id", get(chat_history_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        // Funciones proxy hacia el backend externo.
        .route("/functions/deep-advisor", post(proxy::deep_advisor_handler))
        .route(
            "/functions/receive-scouting-technology",
            post(proxy::receive_technology_handler),
        )
        .route(
            "/functions/run-database-audit",
            post(proxy::database_audit_handler),
        )
        .route(
            "/functions/search-scouting-sources",
            get(proxy::search_sources_handler).post(proxy::search_sources_handler),
        )
        .with_state(app_state)
}

// --- Handlers de catálogo ---

#[axum::debug_handler]
async fn quality_stats_handler(
    State(state): State<AppState>,
) -> Result<Json<QualityReport>, ApiError> {
    let listing = state.store.list_technologies().await.map_err(|e| {
        error!("Error cargando el catálogo: {}", e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error al cargar las tecnologías: {}", e),
        )
    })?;

    let mut report = quality::analyze(&listing.records);
    report.rejected_rows = listing.rejected_rows;
    info!(
        "Calidad del catálogo: {} registros, {}% completos, {} posibles duplicados",
        report.total, report.completeness_score, report.potential_duplicates
    );
    Ok(Json(report))
}

fn review_error(err: ReviewError) -> ApiError {
    match &err {
        ReviewError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        ReviewError::Conflict { .. } => api_error(StatusCode::CONFLICT, err.to_string()),
        ReviewError::Incomplete { destination_id, .. } => {
            error!("{}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": err.to_string(),
                    "destination_id": destination_id,
                    "retryable": true,
                })),
            )
        }
        ReviewError::Store(_) => {
            error!("Error revisando candidata: {}", err);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[axum::debug_handler]
async fn approve_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    review::approve_queue_item(state.store.as_ref(), id)
        .await
        .map(Json)
        .map_err(review_error)
}

#[axum::debug_handler]
async fn reject_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RejectPayload>,
) -> Result<Json<ReviewOutcome>, ApiError> {
    review::reject_queue_item(state.store.as_ref(), id, payload.reason)
        .await
        .map(Json)
        .map_err(review_error)
}

#[axum::debug_handler]
async fn add_favorite_handler(
    State(state): State<AppState>,
    Json(payload): Json<FavoritePayload>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .store
        .add_favorite(payload.user_id, payload.technology_id)
        .await
    {
        Ok(()) => Ok((
            StatusCode::CREATED,
            Json(json!({"message": "Tecnología añadida a favoritos."})),
        )),
        Err(StoreError::AlreadyExists(_)) => Err(api_error(
            StatusCode::CONFLICT,
            "Esta tecnología ya está en tus favoritos.",
        )),
        Err(e) => {
            error!("Error guardando favorito: {}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error al guardar el favorito: {}", e),
            ))
        }
    }
}

// --- Handlers del asesor ---

/// Fracción de agentes terminados, o 0 si aún no hay reparto de agentes.
fn turn_progress(turn: &StreamState) -> f32 {
    if turn.agents.is_empty() {
        return 0.0;
    }
    let done = turn
        .agents
        .iter()
        .filter(|a| matches!(a.status, AgentStatus::Completed | AgentStatus::Failed))
        .count();
    done as f32 / turn.agents.len() as f32
}

#[axum::debug_handler]
async fn advisor_ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AdvisorRequest>,
) -> Result<Json<StreamState>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "El mensaje no puede estar vacío.",
        ));
    }

    // La guarda limpia el turno también si el cliente abandona la petición.
    let (guard, turn) = TurnGuard::begin(&state);

    let (updates, mut observer) = watch::channel(StreamState::default());
    let status = state.status.clone();
    let progress = tokio::spawn(async move {
        while observer.changed().await.is_ok() {
            let snapshot = observer.borrow_and_update().clone();
            let mut status = lock(&status);
            if !status.is_busy {
                break;
            }
            status.progress = turn_progress(&snapshot);
            if let Some(message) = snapshot.phase_message.or(snapshot.phase) {
                status.message = message;
            }
        }
    });

    let result = state.advisor.stream(&payload, &turn.cancel, &updates).await;
    drop(updates);
    let _ = progress.await;

    if let Some(chat_id) = result.chat_id.as_ref().or(payload.chat_id.as_ref()) {
        if let Err(e) = state.chat_store.save(chat_id).await {
            warn!("No se pudo guardar el chat activo {}: {:#}", chat_id, e);
        }
    }

    guard.finish(match &result.error {
        Some(e) => format!("Error del asesor: {}", e),
        None => "Respuesta del asesor completada.".to_string(),
    });
    Ok(Json(result))
}

#[axum::debug_handler]
async fn advisor_stop_handler(State(state): State<AppState>) -> Json<Value> {
    let stopped = match lock(&state.active_request).as_ref() {
        Some(turn) => {
            info!("Deteniendo el turno del asesor {}", turn.id);
            turn.cancel.cancel();
            true
        }
        None => false,
    };
    Json(json!({ "stopped": stopped }))
}

#[axum::debug_handler]
async fn get_active_chat_handler(
    State(state): State<AppState>,
) -> Result<Json<ActiveChatResponse>, ApiError> {
    match state.chat_store.load().await {
        Ok(active_chat_id) => Ok(Json(ActiveChatResponse { active_chat_id })),
        Err(e) => {
            error!("Error leyendo el chat activo: {:#}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error al leer el chat activo: {:#}", e),
            ))
        }
    }
}

#[axum::debug_handler]
async fn clear_active_chat_handler(
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.chat_store.clear().await.map_err(|e| {
        error!("Error borrando el chat activo: {:#}", e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error al borrar el chat activo: {:#}", e),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
async fn chat_history_handler(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<LoadedChat>, ApiError> {
    load_chat(
        state.local_history.as_ref(),
        state.external_history.as_ref(),
        &chat_id,
    )
    .await
    .map(Json)
    .map_err(|e| {
        error!("{:#}", e);
        api_error(StatusCode::BAD_GATEWAY, format!("{:#}", e))
    })
}

// --- Estado y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(lock(&state.status).clone())
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = lock(&state.shutdown_sender).take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
