//! Carga y gestión de configuración de la aplicación (backend Railway,
//! Supabase y proxies).

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::catalog::{REJECTED_TABLE, SCOUTING_QUEUE_TABLE, TECHNOLOGIES_TABLE};

/// Tiempos máximos de espera de cada función proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyTimeouts {
    pub deep_advisor: Duration,
    pub receive_technology: Duration,
    pub database_audit: Duration,
    pub search_sources: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            deep_advisor: Duration::from_secs(300),
            receive_technology: Duration::from_secs(120),
            database_audit: Duration::from_secs(300),
            search_sources: Duration::from_secs(180),
        }
    }
}

/// Credenciales del proyecto Supabase.
#[derive(Clone, Debug)]
pub struct SupabaseConfig {
    pub url: Url,
    pub service_key: String,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub frontend_dir: PathBuf,

    pub railway_api_url: Url,
    /// `None` si no hay Supabase configurado: se usa el almacén en memoria.
    pub supabase: Option<SupabaseConfig>,
    pub scouting_webhook_secret: String,
    pub chat_state_path: PathBuf,

    pub timeouts: ProxyTimeouts,
    /// Tiempo máximo para leer el historial de un chat del backend.
    pub history_timeout: Duration,
    pub audit_tables: Vec<String>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo cada variable con `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_addr = var("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());
        let frontend_dir = PathBuf::from(var("FRONTEND_DIR").unwrap_or_else(|| "frontend".to_string()));

        let railway_raw =
            var("RAILWAY_API_URL").ok_or_else(|| anyhow!("Falta RAILWAY_API_URL en el entorno"))?;
        let railway_api_url = Url::parse(railway_raw.trim())
            .with_context(|| format!("RAILWAY_API_URL no es una URL válida: {railway_raw}"))?;

        let supabase = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => Some(SupabaseConfig {
                url: Url::parse(url.trim())
                    .with_context(|| format!("SUPABASE_URL no es una URL válida: {url}"))?,
                service_key,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("Falta SUPABASE_SERVICE_KEY en el entorno")),
            (None, Some(_)) => return Err(anyhow!("Falta SUPABASE_URL en el entorno")),
        };

        let scouting_webhook_secret = var("SCOUTING_WEBHOOK_SECRET")
            .ok_or_else(|| anyhow!("Falta SCOUTING_WEBHOOK_SECRET en el entorno"))?;

        let chat_state_path = PathBuf::from(
            var("CHAT_STATE_PATH").unwrap_or_else(|| ".scouting_hub/active_chat.json".to_string()),
        );

        let defaults = ProxyTimeouts::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(raw) => {
                    let value: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} debe ser un número de segundos: {raw}"))?;
                    if value == 0 {
                        return Err(anyhow!("{key} debe ser mayor que cero"));
                    }
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };
        let timeouts = ProxyTimeouts {
            deep_advisor: secs("DEEP_ADVISOR_TIMEOUT_SECS", defaults.deep_advisor)?,
            receive_technology: secs("RECEIVE_TECHNOLOGY_TIMEOUT_SECS", defaults.receive_technology)?,
            database_audit: secs("DATABASE_AUDIT_TIMEOUT_SECS", defaults.database_audit)?,
            search_sources: secs("SEARCH_SOURCES_TIMEOUT_SECS", defaults.search_sources)?,
        };
        let history_timeout = secs("CHAT_HISTORY_TIMEOUT_SECS", Duration::from_secs(30))?;

        let audit_tables = match var("AUDIT_TABLES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            None => [TECHNOLOGIES_TABLE, SCOUTING_QUEUE_TABLE, REJECTED_TABLE]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        };

        Ok(Self {
            server_addr,
            frontend_dir,
            railway_api_url,
            supabase,
            scouting_webhook_secret,
            chat_state_path,
            timeouts,
            history_timeout,
            audit_tables,
        })
    }
}
