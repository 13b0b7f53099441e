//! Core ledger model: canonical columns, producer records and pure lookup helpers.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ledger-core";

/// One of the thirteen columns every monthly partition is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    Sequence,
    ExtractedAt,
    PublishedAt,
    Id,
    Title,
    Description,
    Kind,
    Amount,
    AmountKind,
    DetailLink,
    SiteVisitAt,
    MandatoryVisit,
    ClosingAt,
}

/// Canonical column order, used for new headers and for mapped rows.
pub const CANONICAL_COLUMNS: [Column; 13] = [
    Column::Sequence,
    Column::ExtractedAt,
    Column::PublishedAt,
    Column::Id,
    Column::Title,
    Column::Description,
    Column::Kind,
    Column::Amount,
    Column::AmountKind,
    Column::DetailLink,
    Column::SiteVisitAt,
    Column::MandatoryVisit,
    Column::ClosingAt,
];

pub const SEQUENCE_ALIASES: &[&str] = &["Número", "Numero", "Number", "N°", "Nro", "No.", "#", "Num"];
pub const ID_ALIASES: &[&str] = &["ID", "Id", "Identifier"];

impl Column {
    /// Header text as stored in the sheet.
    pub const fn header(self) -> &'static str {
        match self {
            Column::Sequence => "Número",
            Column::ExtractedAt => "FyH Extracción",
            Column::PublishedAt => "FyH Publicación",
            Column::Id => "ID",
            Column::Title => "Título",
            Column::Description => "Descripción",
            Column::Kind => "Tipo",
            Column::Amount => "Monto",
            Column::AmountKind => "Tipo Monto",
            Column::DetailLink => "LINK FICHA",
            Column::SiteVisitAt => "FyH TERRENO",
            Column::MandatoryVisit => "OBLIG?",
            Column::ClosingAt => "FyH CIERRE",
        }
    }

    /// Producer field feeding this column. The sequence column is assigned, never produced.
    pub const fn producer_field(self) -> Option<&'static str> {
        match self {
            Column::Sequence => None,
            Column::ExtractedAt => Some("fecha_extraccion"),
            Column::PublishedAt => Some("fecha_publicacion"),
            Column::Id => Some("id"),
            Column::Title => Some("titulo"),
            Column::Description => Some("descripcion"),
            Column::Kind => Some("tipo"),
            Column::Amount => Some("monto"),
            Column::AmountKind => Some("tipo_monto"),
            Column::DetailLink => Some("link_ficha"),
            Column::SiteVisitAt => Some("fecha_visita"),
            Column::MandatoryVisit => Some("visita_obligatoria"),
            Column::ClosingAt => Some("fecha_cierre"),
        }
    }

    /// Accepted header spellings, highest priority first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Column::Sequence => SEQUENCE_ALIASES,
            Column::Id => ID_ALIASES,
            Column::ExtractedAt => &["FyH Extracción"],
            Column::PublishedAt => &["FyH Publicación"],
            Column::Title => &["Título"],
            Column::Description => &["Descripción"],
            Column::Kind => &["Tipo"],
            Column::Amount => &["Monto"],
            Column::AmountKind => &["Tipo Monto"],
            Column::DetailLink => &["LINK FICHA"],
            Column::SiteVisitAt => &["FyH TERRENO"],
            Column::MandatoryVisit => &["OBLIG?"],
            Column::ClosingAt => &["FyH CIERRE"],
        }
    }

    /// Position of this column in `headers`, resolved through its aliases.
    pub fn locate(self, headers: &[String]) -> Option<usize> {
        find_header_index(headers, self.aliases())
    }

    /// Every position in `headers` matching any alias, left to right.
    pub fn locate_all(self, headers: &[String]) -> Vec<usize> {
        find_header_indices(headers, self.aliases())
    }
}

pub fn canonical_header() -> Vec<String> {
    CANONICAL_COLUMNS
        .iter()
        .map(|c| c.header().to_string())
        .collect()
}

/// Folds case and Spanish accents so hand-typed headers compare equal.
pub fn normalize_header(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'á' => Some('a'),
            'é' => Some('e'),
            'í' => Some('i'),
            'ó' => Some('o'),
            'ú' | 'ü' => Some('u'),
            'ñ' => Some('n'),
            '°' | 'º' => None,
            other => Some(other),
        })
        .collect()
}

/// First alias (in priority order) that matches a header wins; ties go to the leftmost header.
pub fn find_header_index(headers: &[String], aliases: &[&str]) -> Option<usize> {
    let normalized = headers
        .iter()
        .map(|h| normalize_header(h))
        .collect::<Vec<_>>();
    aliases.iter().find_map(|alias| {
        let wanted = normalize_header(alias);
        normalized.iter().position(|h| *h == wanted)
    })
}

pub fn find_header_indices(headers: &[String], aliases: &[&str]) -> Vec<usize> {
    let wanted = aliases
        .iter()
        .map(|a| normalize_header(a))
        .collect::<HashSet<_>>();
    headers
        .iter()
        .enumerate()
        .filter(|(_, h)| wanted.contains(&normalize_header(h)))
        .map(|(i, _)| i)
        .collect()
}

/// Largest stored sequence number that still leaves room to number a batch.
pub const MAX_SEQUENCE: u64 = u64::MAX / 2;

/// Recovers a sequence number from a hand-edited cell.
///
/// Non-digit characters are dropped and the remaining digits parsed, so
/// `"3 (pending)"` reads as 3. Empty, zero, negative (leading `-`) and
/// values above [`MAX_SEQUENCE`] yield `None`.
pub fn parse_sequence_cell(cell: &str) -> Option<u64> {
    let trimmed = cell.trim();
    if trimmed.starts_with('-') {
        return None;
    }
    let digits = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    digits
        .parse::<u64>()
        .ok()
        .filter(|n| (1..=MAX_SEQUENCE).contains(n))
}

/// Highest valid sequence number among `cells`, or 0.
pub fn max_sequence<'a>(cells: impl IntoIterator<Item = &'a str>) -> u64 {
    cells
        .into_iter()
        .filter_map(parse_sequence_cell)
        .max()
        .unwrap_or(0)
}

pub fn identifier_set<'a>(cells: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    cells
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonthLocale {
    #[default]
    English,
    Spanish,
}

const SPANISH_MONTHS: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

impl MonthLocale {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Some(Self::English),
            "es" | "spanish" => Some(Self::Spanish),
            _ => None,
        }
    }

    pub fn month_name(self, date: NaiveDate) -> String {
        match self {
            Self::English => date.format("%B").to_string(),
            Self::Spanish => SPANISH_MONTHS[date.month0() as usize].to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("invalid target date {input:?} (expected YYYY-MM-DD): {source}")]
    InvalidDate {
        input: String,
        #[source]
        source: chrono::ParseError,
    },
}

pub fn parse_target_date(input: &str) -> Result<NaiveDate, PartitionError> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|source| PartitionError::InvalidDate {
        input: input.to_string(),
        source,
    })
}

/// Monthly partition name for a `YYYY-MM-DD` target date, e.g. "August".
pub fn partition_for_date(input: &str, locale: MonthLocale) -> Result<String, PartitionError> {
    let date = parse_target_date(input)?;
    Ok(locale.month_name(date))
}

/// A scraped record in producer vocabulary. Unknown fields are ignored and
/// numeric or boolean values are kept as their cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub fecha_extraccion: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub fecha_publicacion: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub titulo: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub descripcion: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub monto: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub tipo_monto: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub link_ficha: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub fecha_visita: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub visita_obligatoria: Option<String>,
    #[serde(default, deserialize_with = "cell_text", skip_serializing_if = "Option::is_none")]
    pub fecha_cierre: Option<String>,
}

impl IncomingRecord {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Producer value feeding `column`, following the `Column::producer_field` table.
    pub fn value_for(&self, column: Column) -> Option<&str> {
        let value = match column {
            Column::Sequence => return None,
            Column::ExtractedAt => &self.fecha_extraccion,
            Column::PublishedAt => &self.fecha_publicacion,
            Column::Id => &self.id,
            Column::Title => &self.titulo,
            Column::Description => &self.descripcion,
            Column::Kind => &self.tipo,
            Column::Amount => &self.monto,
            Column::AmountKind => &self.tipo_monto,
            Column::DetailLink => &self.link_ficha,
            Column::SiteVisitAt => &self.fecha_visita,
            Column::MandatoryVisit => &self.visita_obligatoria,
            Column::ClosingAt => &self.fecha_cierre,
        };
        value.as_deref()
    }
}

fn cell_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }))
}
