//! Auditoría puntual de nombres de columna: detecta tablas que mezclan
//! `snake_case` con nombres acentuados o con espacios y propone el nombre
//! equivalente en `snake_case`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

static SNAKE_CASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(_[a-z0-9]+)*$").expect("regex snake_case válida"));
static ACCENTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[áéíóúüñÁÉÍÓÚÜÑàèìòùÀÈÌÒÙ]").expect("regex de acentos válida"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s").expect("regex de espacios válida"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnStyle {
    SnakeCase,
    Accented,
    WithSpaces,
    Other,
}

/// Clasifica un nombre de columna. Los acentos tienen prioridad sobre los
/// espacios.
pub fn classify_column(name: &str) -> ColumnStyle {
    if SNAKE_CASE.is_match(name) {
        ColumnStyle::SnakeCase
    } else if ACCENTED.is_match(name) {
        ColumnStyle::Accented
    } else if WHITESPACE.is_match(name) {
        ColumnStyle::WithSpaces
    } else {
        ColumnStyle::Other
    }
}

/// Nombre `snake_case` equivalente: sin acentos ni símbolos, con `_` como
/// único separador.
pub fn snake_case_suggestion(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnFinding {
    pub column: String,
    pub style: ColumnStyle,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableNamingReport {
    pub table: String,
    pub total_columns: usize,
    pub snake_case_columns: usize,
    /// La tabla mezcla `snake_case` con otros estilos.
    pub inconsistent: bool,
    pub findings: Vec<ColumnFinding>,
}

pub fn audit_table(table: &str, columns: &[String]) -> TableNamingReport {
    let findings: Vec<ColumnFinding> = columns
        .iter()
        .filter_map(|column| match classify_column(column) {
            ColumnStyle::SnakeCase => None,
            style => Some(ColumnFinding {
                column: column.clone(),
                style,
                suggestion: snake_case_suggestion(column),
            }),
        })
        .collect();
    let snake_case_columns = columns.len() - findings.len();

    TableNamingReport {
        table: table.to_string(),
        total_columns: columns.len(),
        snake_case_columns,
        inconsistent: snake_case_columns > 0 && !findings.is_empty(),
        findings,
    }
}
