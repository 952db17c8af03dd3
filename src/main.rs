// Módulos de la aplicación
mod advisor_client;
mod advisor_state;
mod api;
mod app_state;
mod audit;
mod catalog;
mod chat_history;
mod chat_session;
mod config;
mod memory_store;
mod models;
mod proxy;
mod quality;
mod review;
mod sse;
mod supabase;

#[cfg(test)]
mod test_support;

use crate::{
    advisor_client::DeepAdvisorClient,
    app_state::{AppState, Status},
    catalog::CatalogStore,
    chat_history::{ChatHistorySource, RailwayChatHistory},
    chat_session::FileChatStore,
    memory_store::MemoryStore,
    proxy::{EdgeFunction, UpstreamProxy},
    supabase::SupabaseStore,
};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Elegir almacén: Supabase si está configurado, si no memoria
    let (store, local_history): (Arc<dyn CatalogStore>, Arc<dyn ChatHistorySource>) =
        match &cfg.supabase {
            Some(supabase) => {
                let store = Arc::new(
                    SupabaseStore::new(&supabase.url, supabase.service_key.clone())
                        .expect("Error inicializando el cliente de Supabase"),
                );
                (
                    store.clone() as Arc<dyn CatalogStore>,
                    store as Arc<dyn ChatHistorySource>,
                )
            }
            None => {
                warn!("SUPABASE_URL no configurada: los datos se guardarán sólo en memoria.");
                let store = Arc::new(MemoryStore::new());
                (
                    store.clone() as Arc<dyn CatalogStore>,
                    store as Arc<dyn ChatHistorySource>,
                )
            }
        };

    // 4. Clientes del backend externo
    let proxy = UpstreamProxy::new(cfg.railway_api_url.clone(), cfg.timeouts.clone())
        .expect("Error inicializando los proxies");
    let advisor = DeepAdvisorClient::new(
        proxy.endpoint(EdgeFunction::DeepAdvisor, None),
        cfg.timeouts.deep_advisor,
    )
    .expect("Error inicializando el cliente del asesor");
    let external_history =
        RailwayChatHistory::new(cfg.railway_api_url.clone(), cfg.history_timeout)
            .expect("Error inicializando el historial externo");

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        store,
        local_history,
        external_history: Arc::new(external_history),
        proxy,
        advisor,
        chat_store: Arc::new(FileChatStore::new(cfg.chat_state_path.clone())),
        status: Arc::new(Mutex::new(Status::ready())),
        active_request: Arc::new(Mutex::new(None)),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new(&cfg.frontend_dir))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor HTTP");

    info!("✅ Servidor cerrado correctamente.");
}
