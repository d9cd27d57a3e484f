//! Core domain model and correlation tag codec for KMBV.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kmbv-core";

/// Ensemble label used when an appointment names no narrower group.
pub const DEFAULT_ENSEMBLE: &str = "alle aktiven Musiker/innen";

/// Konzertmeister type discriminator for rehearsals.
pub const TYP_PROBE: i32 = 1;
/// Konzertmeister type discriminator for performances.
pub const TYP_AUFTRITT: i32 = 2;

/// One appointment as returned by the Konzertmeister API. The wire payload
/// carries dozens more fields; only the ones the sync reads are modeled and
/// everything else is ignored at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// ISO-8601 start timestamp; absent for date-less appointments.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub typ_id: Option<i32>,
    #[serde(default)]
    pub group: Option<AppointmentGroup>,
    #[serde(default)]
    pub meeting_point: Option<String>,
    #[serde(default)]
    pub location: Option<AppointmentLocation>,
}

impl Appointment {
    pub fn is_performance(&self) -> bool {
        self.typ_id == Some(TYP_AUFTRITT)
    }

    /// Group name, with empty strings treated as absent.
    pub fn group_name(&self) -> Option<&str> {
        self.group
            .as_ref()
            .and_then(|group| group.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentGroup {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentLocation {
    pub formatted_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DateMode {
    Upcoming,
    Past,
    All,
}

/// Filter payload for the paged appointment fetch. Serialized with explicit
/// nulls because the API distinguishes "no filter" from a missing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentFilter {
    pub date_mode: DateMode,
    pub filter_start: Option<String>,
    pub filter_end: Option<String>,
    pub parent_org_ids: Option<Vec<i64>>,
    pub group_org_ids: Option<Vec<i64>>,
    pub settings: Vec<serde_json::Value>,
}

impl AppointmentFilter {
    /// All upcoming appointments, no org restriction.
    pub fn upcoming() -> Self {
        Self {
            date_mode: DateMode::Upcoming,
            filter_start: None,
            filter_end: None,
            parent_org_ids: None,
            group_org_ids: None,
            settings: Vec::new(),
        }
    }
}

impl Default for AppointmentFilter {
    fn default() -> Self {
        Self::upcoming()
    }
}

/// BMV "Ausrueckungsart" code: "P" for rehearsals, "V" for performances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    #[serde(rename = "P")]
    Rehearsal,
    #[serde(rename = "V")]
    Performance,
}

impl ActivityKind {
    pub fn code(self) -> &'static str {
        match self {
            ActivityKind::Rehearsal => "P",
            ActivityKind::Performance => "V",
        }
    }
}

/// An activity already stored in BMV. Fetched records are used only for
/// correlation, so beyond the identifier this models just the descriptive
/// fields worth logging and the annotation that may carry a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "V_DATUM", default)]
    pub v_datum: Option<String>,
    #[serde(rename = "Bezeichnung", default)]
    pub bezeichnung: Option<String>,
    #[serde(rename = "Ensemble_Gruppe", default)]
    pub ensemble_gruppe: Option<String>,
    #[serde(rename = "Anmerkung", default)]
    pub anmerkung: Option<String>,
    pub verein_id: i64,
}

/// An activity to be created in BMV. The target system (or the submitting
/// client) assigns the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    #[serde(rename = "V_DATUM", skip_serializing_if = "Option::is_none")]
    pub v_datum: Option<String>,
    #[serde(rename = "V_ZEIT_V", skip_serializing_if = "Option::is_none")]
    pub v_zeit_v: Option<String>,
    #[serde(rename = "V_ZEIT_B", skip_serializing_if = "Option::is_none")]
    pub v_zeit_b: Option<String>,
    #[serde(rename = "Ensemble_Gruppe")]
    pub ensemble_gruppe: String,
    #[serde(rename = "Probengruppen_ID")]
    pub probengruppen_id: String,
    #[serde(rename = "Ausrueckungsart")]
    pub ausrueckungsart: ActivityKind,
    #[serde(rename = "P_V_Art")]
    pub p_v_art: String,
    #[serde(rename = "Bezeichnung")]
    pub bezeichnung: String,
    #[serde(rename = "Bez_Veranstaltungslokal", skip_serializing_if = "Option::is_none")]
    pub bez_veranstaltungslokal: Option<String>,
    #[serde(rename = "V_ORT", skip_serializing_if = "Option::is_none")]
    pub v_ort: Option<String>,
    #[serde(rename = "AKM_PFL")]
    pub akm_pfl: bool,
    #[serde(rename = "Anmerkung", skip_serializing_if = "Option::is_none")]
    pub anmerkung: Option<String>,
    #[serde(rename = "AKM_Meldung")]
    pub akm_meldung: bool,
    #[serde(rename = "AKM_Meldedatum")]
    pub akm_meldedatum: Option<String>,
    #[serde(rename = "Kopfquote")]
    pub kopfquote: bool,
    pub verein_id: i64,
}

static KM_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)KM_ID\s*=\s*(\d+)").expect("km id pattern compiles"));

/// Append the `KM_ID=<n>` correlation tag to an annotation text. The tag goes
/// on its own line; an empty base yields the bare tag.
pub fn embed_km_id(base_text: &str, source_id: i64) -> String {
    let base = base_text.trim();
    if base.is_empty() {
        format!("KM_ID={source_id}")
    } else {
        format!("{base}\nKM_ID={source_id}")
    }
}

/// Extract the first `KM_ID=<n>` tag from an annotation, case-insensitively.
/// Absent or malformed input is a normal case and yields `None`.
pub fn extract_km_id(anmerkung: Option<&str>) -> Option<i64> {
    let text = anmerkung?;
    let captures = KM_ID_PATTERN.captures(text)?;
    captures.get(1)?.as_str().parse().ok()
}
