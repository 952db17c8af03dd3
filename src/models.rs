//! Modelos de dominio: tecnologías del catálogo, cola de scouting y filas
//! de inserción. Las columnas de Supabase tienen nombres legibles en español,
//! así que el mapeo se hace con `serde(rename)` y la validación ocurre al
//! decodificar cada fila en la frontera.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Rango válido del Technology Readiness Level.
pub const TRL_RANGE: std::ops::RangeInclusive<i64> = 1..=9;

/// Errores al decodificar una fila recibida de la base de datos.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("la fila no tiene columna 'id'")]
    MissingId,

    #[error("id no válido '{0}': se esperaba un UUID")]
    InvalidId(String),

    #[error("TRL fuera de rango (1-9): {0}")]
    TrlOutOfRange(i64),

    #[error("fila mal formada: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Campos de negocio de una tecnología, tal y como viven en las tablas
/// `technologies`, `scouting_queue` y `rejected_technologies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnologyData {
    #[serde(
        rename = "Nombre de la tecnología",
        default,
        deserialize_with = "null_as_default"
    )]
    pub name: String,
    #[serde(rename = "Proveedor", default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "País de origen", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(rename = "Web de la empresa", default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(rename = "Email de contacto", default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "Descripción técnica breve", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "Grado de madurez (TRL)",
        default,
        deserialize_with = "deserialize_trl",
        skip_serializing_if = "Option::is_none"
    )]
    pub trl: Option<i64>,
    #[serde(rename = "Ventaja competitiva clave", default, skip_serializing_if = "Option::is_none")]
    pub competitive_advantage: Option<String>,
    #[serde(rename = "Porque es innovadora", default, skip_serializing_if = "Option::is_none")]
    pub innovation_rationale: Option<String>,
    #[serde(rename = "Casos de referencia", default, skip_serializing_if = "Option::is_none")]
    pub reference_cases: Option<String>,
    #[serde(rename = "Tipo de tecnología", default, skip_serializing_if = "Option::is_none")]
    pub technology_type: Option<String>,
    #[serde(rename = "Subcategoría", default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    #[serde(rename = "Sector y subsector", default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(rename = "Aplicación principal", default, skip_serializing_if = "Option::is_none")]
    pub main_application: Option<String>,
    #[serde(rename = "Comentarios del analista", default, skip_serializing_if = "Option::is_none")]
    pub analyst_comments: Option<String>,
    #[serde(rename = "Estado del seguimiento", default, skip_serializing_if = "Option::is_none")]
    pub tracking_status: Option<String>,
    #[serde(rename = "Fecha de scouting", default, skip_serializing_if = "Option::is_none")]
    pub scouting_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TechnologyData {
    /// Recorta el nombre y convierte en `None` los textos vacíos, y después
    /// valida el TRL.
    pub fn normalized(mut self) -> Result<Self, DecodeError> {
        self.name = self.name.trim().to_string();
        for field in [
            &mut self.provider,
            &mut self.country,
            &mut self.website,
            &mut self.email,
            &mut self.description,
            &mut self.competitive_advantage,
            &mut self.innovation_rationale,
            &mut self.reference_cases,
            &mut self.technology_type,
            &mut self.subcategory,
            &mut self.sector,
            &mut self.main_application,
            &mut self.analyst_comments,
            &mut self.tracking_status,
            &mut self.scouting_date,
        ] {
            *field = field
                .take()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }

        if let Some(trl) = self.trl {
            if !TRL_RANGE.contains(&trl) {
                return Err(DecodeError::TrlOutOfRange(trl));
            }
        }
        Ok(self)
    }
}

/// Una columna `null` cuenta como ausente.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// El TRL llega como número o, en filas antiguas, como texto ("7").
fn deserialize_trl<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("TRL no entero: {n}"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("TRL no numérico: '{s}'"))),
        Some(other) => Err(serde::de::Error::custom(format!("TRL con tipo inesperado: {other}"))),
    }
}

/// Fila validada de la tabla `technologies`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechnologyRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub data: TechnologyData,
}

impl TechnologyRecord {
    pub fn new(id: Uuid, data: TechnologyData) -> Self {
        Self { id, data }
    }

    /// Decodifica y valida una fila arbitraria de la tabla.
    pub fn decode(row: Value) -> Result<Self, DecodeError> {
        let id = extract_id(&row)?;
        let data: TechnologyData = serde_json::from_value(row)?;
        Ok(Self {
            id,
            data: data.normalized()?,
        })
    }
}

/// Estado de una candidata en la cola de scouting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Candidata pendiente de revisión humana antes de pasar al catálogo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoutingQueueItem {
    pub id: Uuid,
    pub queue_status: QueueStatus,
    pub source_url: Option<String>,
    #[serde(flatten)]
    pub data: TechnologyData,
}

#[derive(Deserialize)]
struct RawQueueRow {
    #[serde(default, deserialize_with = "null_as_default")]
    queue_status: QueueStatus,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(flatten)]
    data: TechnologyData,
}

impl ScoutingQueueItem {
    pub fn decode(row: Value) -> Result<Self, DecodeError> {
        let id = extract_id(&row)?;
        let raw: RawQueueRow = serde_json::from_value(row)?;
        Ok(Self {
            id,
            queue_status: raw.queue_status,
            source_url: raw.source_url.filter(|s| !s.trim().is_empty()),
            data: raw.data.normalized()?,
        })
    }
}

/// Fila a insertar en `technologies` al aprobar una candidata. La columna
/// `scouting_queue_id` es la clave de idempotencia de la aprobación.
#[derive(Debug, Clone, Serialize)]
pub struct NewTechnology {
    pub scouting_queue_id: Uuid,
    #[serde(flatten)]
    pub data: TechnologyData,
}

/// Fila a insertar en `rejected_technologies`. `original_queue_id` es la
/// clave de idempotencia del rechazo.
#[derive(Debug, Clone, Serialize)]
pub struct NewRejection {
    pub original_queue_id: Uuid,
    pub rejection_reason: Option<String>,
    pub rejected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: TechnologyData,
}

fn extract_id(row: &Value) -> Result<Uuid, DecodeError> {
    let id = row.get("id").ok_or(DecodeError::MissingId)?;
    let text = id
        .as_str()
        .ok_or_else(|| DecodeError::InvalidId(id.to_string()))?;
    Uuid::parse_str(text).map_err(|_| DecodeError::InvalidId(text.to_string()))
}

/// Decodifica filas una a una. Las que no validan se registran y se
/// descartan sin abortar el listado; devuelve también cuántas se rechazaron.
pub fn decode_rows<T>(
    table: &str,
    rows: Vec<Value>,
    decode: impl Fn(Value) -> Result<T, DecodeError>,
) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(rows.len());
    let mut rejected = 0;
    for row in rows {
        let id_hint = row
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "<sin id>".to_string());
        match decode(row) {
            Ok(item) => decoded.push(item),
            Err(e) => {
                rejected += 1;
                warn!("Fila {} de '{}' descartada: {}", id_hint, table, e);
            }
        }
    }
    (decoded, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_maps_spanish_columns() {
        let id = Uuid::new_v4();
        let record = TechnologyRecord::decode(json!({
            "id": id.to_string(),
            "Nombre de la tecnología": "  AquaPure X200 ",
            "Proveedor": "Hidro Sistemas S.L.",
            "Grado de madurez (TRL)": 7,
            "País de origen": "   ",
            "columna_desconocida": true
        }))
        .unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.data.name, "AquaPure X200");
        assert_eq!(record.data.provider.as_deref(), Some("Hidro Sistemas S.L."));
        assert_eq!(record.data.trl, Some(7));
        assert_eq!(record.data.country, None);
    }

    #[test]
    fn test_decode_accepts_trl_as_text() {
        let record = TechnologyRecord::decode(json!({
            "id": Uuid::new_v4().to_string(),
            "Nombre de la tecnología": "Filtro",
            "Grado de madurez (TRL)": " 4 "
        }))
        .unwrap();
        assert_eq!(record.data.trl, Some(4));
    }

    #[test]
    fn test_decode_rejects_out_of_range_trl() {
        let err = TechnologyRecord::decode(json!({
            "id": Uuid::new_v4().to_string(),
            "Grado de madurez (TRL)": 12
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::TrlOutOfRange(12)));
    }

    #[test]
    fn test_decode_rejects_bad_ids() {
        assert!(matches!(
            TechnologyRecord::decode(json!({"Nombre de la tecnología": "x"})),
            Err(DecodeError::MissingId)
        ));
        assert!(matches!(
            TechnologyRecord::decode(json!({"id": "abc"})),
            Err(DecodeError::InvalidId(_))
        ));
        assert!(matches!(
            TechnologyRecord::decode(json!({"id": 42})),
            Err(DecodeError::InvalidId(_))
        ));
    }

    #[test]
    fn test_decode_rows_skips_invalid_rows() {
        let rows = vec![
            json!({"id": Uuid::new_v4().to_string(), "Nombre de la tecnología": "Uno"}),
            json!({"id": "no-uuid"}),
            json!({"id": Uuid::new_v4().to_string(), "Grado de madurez (TRL)": 0}),
        ];
        let (records, rejected) = decode_rows("technologies", rows, TechnologyRecord::decode);
        assert_eq!(records.len(), 1);
        assert_eq!(rejected, 2);
    }

    #[test]
    fn test_decode_rows_keeps_null_name() {
        let rows = vec![json!({
            "id": Uuid::new_v4().to_string(),
            "Nombre de la tecnología": null,
            "Proveedor": "Hidro"
        })];
        let (records, rejected) = decode_rows("technologies", rows, TechnologyRecord::decode);
        assert_eq!(rejected, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data.name, "");
        assert_eq!(records[0].data.provider.as_deref(), Some("Hidro"));

        let item = ScoutingQueueItem::decode(json!({
            "id": Uuid::new_v4().to_string(),
            "queue_status": null
        }))
        .unwrap();
        assert_eq!(item.queue_status, QueueStatus::Pending);
    }

    #[test]
    fn test_queue_item_defaults_to_pending() {
        let item = ScoutingQueueItem::decode(json!({
            "id": Uuid::new_v4().to_string(),
            "Nombre de la tecnología": "Membrana UF-200",
            "source_url": ""
        }))
        .unwrap();
        assert_eq!(item.queue_status, QueueStatus::Pending);
        assert_eq!(item.source_url, None);
    }

    #[test]
    fn test_new_technology_serializes_with_idempotency_key() {
        let queue_id = Uuid::new_v4();
        let row = serde_json::to_value(NewTechnology {
            scouting_queue_id: queue_id,
            data: TechnologyData {
                name: "AquaClean".to_string(),
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(row["scouting_queue_id"], json!(queue_id.to_string()));
        assert_eq!(row["Nombre de la tecnología"], json!("AquaClean"));
        assert!(row.get("Proveedor").is_none());
    }
}
