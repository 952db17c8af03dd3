//! Escáner de calidad de datos del catálogo de tecnologías.
//!
//! Para cada registro calcula sus incidencias (campos vacíos, descripción
//! corta, nombre genérico), agrega los contadores por tipo y agrupa posibles
//! duplicados por nombre normalizado y por proveedor. Todo se recalcula en
//! cada llamada; no hay caché ni actualización incremental.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use uuid::Uuid;

use crate::models::TechnologyRecord;

/// Longitud mínima (en caracteres) de una descripción técnica aceptable.
pub const MIN_DESCRIPTION_CHARS: usize = 100;
/// Por debajo de esta longitud, un nombre se considera genérico.
pub const MIN_NAME_CHARS: usize = 5;
/// Longitud mínima de la clave normalizada para agrupar por nombre.
pub const MIN_NAME_KEY_CHARS: usize = 5;
/// Tamaño mínimo de un grupo por nombre normalizado.
pub const MIN_NAME_GROUP: usize = 2;
/// Tamaño mínimo de un grupo por proveedor.
pub const MIN_PROVIDER_GROUP: usize = 3;

/// Incidencia de calidad detectada en un registro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    SinProveedor,
    SinWeb,
    SinPais,
    SinEmail,
    DescripcionCorta,
    SinTrl,
    SinVentaja,
    SinInnovacion,
    SinCasosReferencia,
    SinAplicacion,
    SinClasificar,
    NombreGenerico,
}

impl QualityIssue {
    pub const ALL: [QualityIssue; 12] = [
        Self::SinProveedor,
        Self::SinWeb,
        Self::SinPais,
        Self::SinEmail,
        Self::DescripcionCorta,
        Self::SinTrl,
        Self::SinVentaja,
        Self::SinInnovacion,
        Self::SinCasosReferencia,
        Self::SinAplicacion,
        Self::SinClasificar,
        Self::NombreGenerico,
    ];

    /// Incidencias que hacen que un registro no cuente como completo.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::SinProveedor | Self::SinClasificar | Self::NombreGenerico
        )
    }
}

static GENERIC_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^tecnolog[ií]as?\s+(de|para)\b",
        r"(?i)^sistemas?\s+(de|para)\b",
        r"(?i)^soluci[oó]n(es)?\s+(de|para)\b",
        r"(?i)^proceso\s+(de|para)\b",
        r"(?i)^m[eé]todo\s+(de|para)\b",
        r"(?i)^equipos?\s+(de|para)\b",
        r"(?i)^tratamiento\s+de\b",
        r"(?i)^planta\s+de\b",
        r"(?i)^unidad\s+de\b",
        r"(?i)^dispositivo\s+(de|para)\b",
        r"(?i)^technolog(y|ies)\s+(for|of)\b",
        r"(?i)^systems?\s+(for|of)\b",
        r"(?i)^(n/?a|none|null|ninguno|sin nombre|desconocido)$",
        r"^\d+$",
        r"(?i)^(test|prueba)\s*\d*$",
        r"^[\p{P}\p{S}\s]+$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("patrón de nombre genérico válido"))
    .collect()
});

/// Indica si un nombre de tecnología es genérico: demasiado corto, con un
/// prefijo de plantilla ("Sistema de…") o un valor de relleno ("n/a", "test").
pub fn is_generic_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.chars().count() < MIN_NAME_CHARS {
        return true;
    }
    GENERIC_NAME_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

/// Clave de comparación: sin acentos, en minúsculas y sólo `[a-z0-9]`.
pub fn normalize_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// Calcula las incidencias de un registro, en el orden de `QualityIssue::ALL`.
pub fn scan_record(record: &TechnologyRecord) -> Vec<QualityIssue> {
    let d = &record.data;
    let description_ok = d
        .description
        .as_deref()
        .is_some_and(|s| s.chars().count() >= MIN_DESCRIPTION_CHARS);

    let checks = [
        (QualityIssue::SinProveedor, has_text(&d.provider)),
        (QualityIssue::SinWeb, has_text(&d.website)),
        (QualityIssue::SinPais, has_text(&d.country)),
        (QualityIssue::SinEmail, has_text(&d.email)),
        (QualityIssue::DescripcionCorta, description_ok),
        (QualityIssue::SinTrl, d.trl.is_some()),
        (QualityIssue::SinVentaja, has_text(&d.competitive_advantage)),
        (QualityIssue::SinInnovacion, has_text(&d.innovation_rationale)),
        (QualityIssue::SinCasosReferencia, has_text(&d.reference_cases)),
        (QualityIssue::SinAplicacion, has_text(&d.main_application)),
        (QualityIssue::SinClasificar, has_text(&d.technology_type)),
        (QualityIssue::NombreGenerico, !is_generic_name(&d.name)),
    ];

    checks
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(issue, _)| issue)
        .collect()
}

/// Tipo de similitud de un grupo de posibles duplicados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityType {
    /// Todos los miembros comparten exactamente el mismo nombre.
    Exact,
    Normalized,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMember {
    pub id: Uuid,
    pub name: String,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub key: String,
    pub similarity_type: SimilarityType,
    pub records: Vec<DuplicateMember>,
}

fn member(record: &TechnologyRecord) -> DuplicateMember {
    DuplicateMember {
        id: record.id,
        name: record.data.name.clone(),
        provider: record.data.provider.clone(),
    }
}

/// Agrupa por nombre normalizado y, de forma independiente, por proveedor.
///
/// Las dos pasadas no se cruzan: un registro puede aparecer a la vez en un
/// grupo por nombre y en otro por proveedor.
pub fn find_duplicate_groups(records: &[TechnologyRecord]) -> Vec<DuplicateGroup> {
    let mut by_name: BTreeMap<String, Vec<&TechnologyRecord>> = BTreeMap::new();
    let mut by_provider: BTreeMap<String, Vec<&TechnologyRecord>> = BTreeMap::new();

    for record in records {
        let name_key = normalize_name(&record.data.name);
        if name_key.chars().count() >= MIN_NAME_KEY_CHARS {
            by_name.entry(name_key).or_default().push(record);
        }

        if let Some(provider) = record.data.provider.as_deref() {
            let provider_key = normalize_name(provider);
            if !provider_key.is_empty() {
                by_provider.entry(provider_key).or_default().push(record);
            }
        }
    }

    let mut groups = Vec::new();

    for (key, members) in by_name {
        if members.len() < MIN_NAME_GROUP {
            continue;
        }
        let first = members[0].data.name.trim();
        let similarity_type = if members.iter().all(|r| r.data.name.trim() == first) {
            SimilarityType::Exact
        } else {
            SimilarityType::Normalized
        };
        groups.push(DuplicateGroup {
            key,
            similarity_type,
            records: members.into_iter().map(member).collect(),
        });
    }

    for (key, members) in by_provider {
        if members.len() < MIN_PROVIDER_GROUP {
            continue;
        }
        groups.push(DuplicateGroup {
            key,
            similarity_type: SimilarityType::Provider,
            records: members.into_iter().map(member).collect(),
        });
    }

    groups
}

/// Incidencias de un registro concreto.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordIssues {
    pub id: Uuid,
    pub name: String,
    pub issues: Vec<QualityIssue>,
}

/// Resultado completo de un escaneo de calidad.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: usize,
    pub issue_counts: BTreeMap<QualityIssue, usize>,
    pub records: Vec<RecordIssues>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Suma de los tamaños de todos los grupos, sin deduplicar registros
    /// que aparecen en ambas pasadas.
    pub potential_duplicates: usize,
    /// Porcentaje (0-100) de registros sin incidencias críticas.
    pub completeness_score: u8,
    /// Filas descartadas al decodificar; lo rellena quien carga los datos.
    pub rejected_rows: usize,
}

/// Escanea el conjunto completo de registros.
pub fn analyze(records: &[TechnologyRecord]) -> QualityReport {
    let mut issue_counts: BTreeMap<QualityIssue, usize> =
        QualityIssue::ALL.iter().map(|issue| (*issue, 0)).collect();
    let mut complete = 0usize;
    let mut per_record = Vec::with_capacity(records.len());

    for record in records {
        let issues = scan_record(record);
        for issue in &issues {
            *issue_counts.entry(*issue).or_insert(0) += 1;
        }
        if !issues.iter().any(QualityIssue::is_critical) {
            complete += 1;
        }
        per_record.push(RecordIssues {
            id: record.id,
            name: record.data.name.clone(),
            issues,
        });
    }

    let duplicate_groups = find_duplicate_groups(records);
    let potential_duplicates = duplicate_groups.iter().map(|g| g.records.len()).sum();

    QualityReport {
        total: records.len(),
        issue_counts,
        records: per_record,
        duplicate_groups,
        potential_duplicates,
        completeness_score: completeness_score(complete, records.len()),
        rejected_rows: 0,
    }
}

fn completeness_score(complete: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((complete as f64 / total as f64) * 100.0).round() as u8
}
