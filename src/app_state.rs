use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;
use uuid::Uuid;

use crate::{
    advisor_client::DeepAdvisorClient, catalog::CatalogStore, chat_history::ChatHistorySource,
    chat_session::ActiveChatStore, config::AppConfig, proxy::UpstreamProxy,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn CatalogStore>,
    /// Historial de chat propio (Supabase o memoria).
    pub local_history: Arc<dyn ChatHistorySource>,
    /// Historial de chat del backend externo.
    pub external_history: Arc<dyn ChatHistorySource>,
    pub proxy: UpstreamProxy,
    pub advisor: DeepAdvisorClient,
    pub chat_store: Arc<dyn ActiveChatStore>,
    pub status: Arc<Mutex<Status>>,
    /// Turno del asesor en curso; uno nuevo reemplaza al anterior.
    pub active_request: Arc<Mutex<Option<ActiveTurn>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Turno del asesor en vuelo y su token de cancelación.
#[derive(Debug, Clone)]
pub struct ActiveTurn {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

impl Status {
    pub fn ready() -> Self {
        Self {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        }
    }
}

/// Mantiene registrado un turno del asesor mientras viva. Al soltarse
/// (respuesta enviada o cliente desconectado) cancela el turno, libera la
/// ranura si sigue siendo suya y devuelve `Status` a reposo.
pub struct TurnGuard {
    id: Uuid,
    active_request: Arc<Mutex<Option<ActiveTurn>>>,
    status: Arc<Mutex<Status>>,
    final_message: Option<String>,
    _cancel_on_drop: DropGuard,
}

impl TurnGuard {
    /// Registra un turno nuevo, sustituyendo al que hubiera, y marca el
    /// servidor como ocupado.
    pub fn begin(state: &AppState) -> (Self, ActiveTurn) {
        let turn = ActiveTurn {
            id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        };
        if lock(&state.active_request)
            .replace(turn.clone())
            .is_some()
        {
            warn!("Nuevo turno del asesor con otro aún en curso; el anterior deja de poder detenerse.");
        }
        {
            let mut status = lock(&state.status);
            status.is_busy = true;
            status.message = "Consultando al asesor...".to_string();
            status.progress = 0.0;
        }

        let guard = Self {
            id: turn.id,
            active_request: state.active_request.clone(),
            status: state.status.clone(),
            final_message: None,
            _cancel_on_drop: turn.cancel.clone().drop_guard(),
        };
        (guard, turn)
    }

    /// Cierra el turno con el mensaje de estado final.
    pub fn finish(mut self, message: String) {
        self.final_message = Some(message);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.active_request);
        if !active.as_ref().is_some_and(|t| t.id == self.id) {
            // Un turno posterior ocupa la ranura y el estado.
            return;
        }
        *active = None;
        drop(active);

        let message = self.final_message.take().unwrap_or_else(|| {
            warn!("Turno del asesor {} abandonado por el cliente.", self.id);
            "Consulta al asesor interrumpida.".to_string()
        });
        let mut status = lock(&self.status);
        status.is_busy = false;
        status.progress = 0.0;
        status.message = message;
    }
}

/// Bloquea un mutex del estado compartido. Ninguna sección crítica deja
/// datos a medias, así que un mutex envenenado se sigue usando.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Estado con almacén en memoria y backend externo en `railway`.
#[cfg(test)]
pub fn test_state(
    railway: url::Url,
    store: Arc<crate::memory_store::MemoryStore>,
) -> AppState {
    use crate::{
        chat_history::RailwayChatHistory, chat_session::MemoryChatStore, proxy::EdgeFunction,
    };
    use std::time::Duration;

    let config = AppConfig::from_lookup(|key| match key {
        "RAILWAY_API_URL" => Some(railway.to_string()),
        "SCOUTING_WEBHOOK_SECRET" => Some("s3cr3t".to_string()),
        _ => None,
    })
    .unwrap();
    let proxy = UpstreamProxy::new(railway.clone(), config.timeouts.clone()).unwrap();
    let advisor_endpoint = proxy.endpoint(EdgeFunction::DeepAdvisor, None);

    AppState {
        proxy,
        advisor: DeepAdvisorClient::new(advisor_endpoint, Duration::from_secs(5)).unwrap(),
        external_history: Arc::new(
            RailwayChatHistory::new(railway, Duration::from_secs(5)).unwrap(),
        ),
        local_history: store.clone(),
        store,
        chat_store: Arc::new(MemoryChatStore::new()),
        status: Arc::new(Mutex::new(Status::ready())),
        active_request: Arc::new(Mutex::new(None)),
        shutdown_sender: Arc::new(Mutex::new(None)),
        config,
    }
}
