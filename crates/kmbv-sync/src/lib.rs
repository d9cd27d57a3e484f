//! Reconciliation pipeline: fetch both sides, diff by correlation tag,
//! transform the survivors, submit one batch.

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::future::join_all;
use kmbv_classify::{
    Classifier, FirstCategoryClassifier, OpenAiClassifier, OpenAiConfig, EVENT_CATEGORIES,
    REHEARSAL_CATEGORIES,
};
use kmbv_clients::{
    ActivityStore, AppointmentPages, AppointmentSource, BmvClient, BmvConfig,
    KonzertmeisterClient, KonzertmeisterConfig,
};
use kmbv_core::{
    embed_km_id, extract_km_id, ActivityKind, Appointment, AppointmentFilter, NewActivity,
    DEFAULT_ENSEMBLE,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "kmbv-sync";

/// Process configuration, built once from the environment at startup and
/// immutable afterwards. Defaults match the production deployment of the
/// original integration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bmv_base_url: String,
    pub bmv_username: String,
    pub bmv_password: String,
    pub km_base_url: String,
    pub km_username: String,
    pub km_password: String,
    pub km_locale: String,
    pub km_timezone: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_api_url: String,
    pub verein_id: i64,
    pub probengruppen_id: String,
    pub lookback_days: i64,
    pub debug_limit: Option<usize>,
    pub http_timeout_secs: u64,
    pub auth_token: String,
    pub port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bmv_base_url: env_or("BMV_BASE_URL", "https://api.vbv-blasmusik.at/api/"),
            bmv_username: required_env("BMV_USERNAME")?,
            bmv_password: required_env("BMV_PASSWORD")?,
            km_base_url: env_or("KM_BASE_URL", "https://rest.konzertmeister.app/"),
            km_username: required_env("KM_USERNAME")?,
            km_password: required_env("KM_PASSWORD")?,
            km_locale: env_or("KM_LOCALE", "de_US"),
            km_timezone: env_or("KM_TIMEZONE", "Europe/Vienna"),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_model: env_or("OPENAI_MODEL", kmbv_classify::DEFAULT_MODEL),
            openai_api_url: env_or("OPENAI_API_URL", kmbv_classify::DEFAULT_API_URL),
            verein_id: parsed_env("KMBV_VEREIN_ID", 236),
            probengruppen_id: env_or(
                "KMBV_PROBENGRUPPEN_ID",
                "620C0A8B-FBAF-4E3F-B622-40501D54732C",
            ),
            lookback_days: parsed_env("KMBV_LOOKBACK_DAYS", 365),
            debug_limit: std::env::var("KMBV_DEBUG_LIMIT").ok().and_then(|v| v.parse().ok()),
            http_timeout_secs: parsed_env("KMBV_HTTP_TIMEOUT_SECS", 60),
            auth_token: env_or("AUTH_TOKEN", "your-secret-token"),
            port: parsed_env("PORT", 3000),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// The slice of configuration the engine and transformer actually consume.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub verein_id: i64,
    pub probengruppen_id: String,
    pub lookback: Duration,
    pub debug_limit: Option<usize>,
    pub filter: AppointmentFilter,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            verein_id: config.verein_id,
            probengruppen_id: config.probengruppen_id.clone(),
            lookback: Duration::days(config.lookback_days),
            debug_limit: config.debug_limit,
            filter: AppointmentFilter::upcoming(),
        }
    }
}

static REGISTERPROBE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)registerprobe\s*").expect("registerprobe pattern compiles"));
static REGISTER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)register\s*").expect("register pattern compiles"));

/// "Registerprobe Blech" names the Blech section; strip the register token
/// and keep the remainder as the ensemble.
fn ensemble_from_register(name: &str) -> String {
    let stripped = REGISTERPROBE_PREFIX.replace(name, "");
    let stripped = REGISTER_PREFIX.replace(&stripped, "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        DEFAULT_ENSEMBLE.to_string()
    } else {
        stripped.to_string()
    }
}

/// First match wins: explicit group, register-derived section name for
/// rehearsals, default ensemble.
fn resolve_ensemble(appointment: &Appointment, kind: ActivityKind) -> String {
    if let Some(group) = appointment.group_name() {
        return group.to_string();
    }
    if kind == ActivityKind::Rehearsal && appointment.name.to_lowercase().contains("register") {
        return ensemble_from_register(&appointment.name);
    }
    DEFAULT_ENSEMBLE.to_string()
}

/// Split an ISO-8601 timestamp into the full UTC date-time string BMV stores
/// in `V_DATUM` and the wall-clock `HH:MM` in the timestamp's own offset.
/// Unparseable or absent input yields neither.
fn split_date_time(timestamp: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(raw) = timestamp else {
        return (None, None);
    };
    let Ok(parsed) = DateTime::parse_from_rfc3339(raw) else {
        return (None, None);
    };
    let date = parsed.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true);
    let time = parsed.format("%H:%M").to_string();
    (Some(date), Some(time))
}

fn classification_text(appointment: &Appointment) -> String {
    match appointment.group_name() {
        Some(group) => format!("{} (group: {})", appointment.name, group),
        None => appointment.name.clone(),
    }
}

/// Map one appointment into a new BMV activity. Never fails: the only I/O is
/// the classify call, which resolves to a fallback label internally.
pub async fn transform(
    appointment: &Appointment,
    classifier: &dyn Classifier,
    options: &SyncOptions,
) -> NewActivity {
    let kind = if appointment.is_performance() {
        ActivityKind::Performance
    } else {
        ActivityKind::Rehearsal
    };

    let ensemble = resolve_ensemble(appointment, kind);
    let (v_datum, v_zeit_v) = split_date_time(appointment.start.as_deref());
    let (_, v_zeit_b) = split_date_time(appointment.end.as_deref());

    let description = appointment.description.as_deref().unwrap_or("");
    let anmerkung = embed_km_id(description, appointment.id);

    let categories: &[&str] = match kind {
        ActivityKind::Rehearsal => &REHEARSAL_CATEGORIES,
        ActivityKind::Performance => &EVENT_CATEGORIES,
    };
    let p_v_art = classifier.classify(&classification_text(appointment), categories).await;

    NewActivity {
        v_datum,
        v_zeit_v,
        v_zeit_b,
        ensemble_gruppe: ensemble,
        probengruppen_id: options.probengruppen_id.clone(),
        ausrueckungsart: kind,
        p_v_art,
        bezeichnung: appointment.name.clone(),
        bez_veranstaltungslokal: appointment
            .meeting_point
            .clone()
            .filter(|point| !point.is_empty()),
        v_ort: appointment.location.as_ref().map(|l| l.formatted_address.clone()),
        akm_pfl: kind == ActivityKind::Performance,
        anmerkung: Some(anmerkung),
        akm_meldung: false,
        akm_meldedatum: None,
        kopfquote: false,
        verein_id: options.verein_id,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub known_ids: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub submitted: usize,
}

/// Five sequential phases: verify target credentials, build the known-ID set,
/// log in and page through the source, filter and transform, submit.
pub struct SyncEngine {
    target: Box<dyn ActivityStore>,
    source: Box<dyn AppointmentSource>,
    classifier: Box<dyn Classifier>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        target: Box<dyn ActivityStore>,
        source: Box<dyn AppointmentSource>,
        classifier: Box<dyn Classifier>,
        options: SyncOptions,
    ) -> Self {
        Self { target, source, classifier, options }
    }

    pub async fn run(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let credentials_ok =
            self.target.check_user().await.context("verifying BMV credentials")?;
        if !credentials_ok {
            bail!("BMV credential check failed");
        }

        // A failed fetch must abort: treating it as "no known IDs" would
        // re-create every appointment on the next submit.
        let since = started_at - self.options.lookback;
        let existing = self
            .target
            .fetch_activities(since)
            .await
            .context("fetching existing BMV activities")?;
        let known: HashSet<i64> = existing
            .iter()
            .filter_map(|activity| extract_km_id(activity.anmerkung.as_deref()))
            .collect();
        info!(existing = existing.len(), known = known.len(), "built known appointment id set");
        debug!(ids = ?known, "known KM ids in BMV");

        let logged_in = self.source.login().await.context("logging in to Konzertmeister")?;
        if !logged_in {
            bail!("Konzertmeister login failed");
        }

        let mut appointments = Vec::new();
        let mut pages = AppointmentPages::new(self.source.as_ref(), self.options.filter.clone());
        while let Some(batch) =
            pages.next_batch().await.context("fetching appointment page")?
        {
            appointments.extend(batch);
        }
        let fetched = appointments.len();
        info!(count = fetched, "fetched upcoming appointments");

        let mut fresh: Vec<Appointment> = appointments
            .into_iter()
            .filter(|appointment| !known.contains(&appointment.id))
            .collect();
        let skipped = fetched - fresh.len();
        if let Some(limit) = self.options.debug_limit {
            if fresh.len() > limit {
                warn!(limit, "debug limit active; truncating surviving set");
                fresh.truncate(limit);
            }
        }
        info!(new = fresh.len(), skipped, total = fetched, "filtered already-synced appointments");

        // Each transformation is independent; run them concurrently and wait
        // for the whole set before submitting.
        let activities: Vec<NewActivity> = join_all(
            fresh
                .iter()
                .map(|appointment| transform(appointment, self.classifier.as_ref(), &self.options)),
        )
        .await;

        if activities.is_empty() {
            info!("no new appointments to sync");
            return Ok(SyncRunSummary {
                started_at,
                finished_at: Utc::now(),
                known_ids: known.len(),
                fetched,
                skipped,
                submitted: 0,
            });
        }

        let accepted = self
            .target
            .post_activities(&activities)
            .await
            .context("submitting activity batch")?;
        if !accepted {
            bail!("BMV rejected the activity batch ({} records)", activities.len());
        }
        info!(submitted = activities.len(), "synced appointments to BMV");

        Ok(SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            known_ids: known.len(),
            fetched,
            skipped,
            submitted: activities.len(),
        })
    }
}

/// Wire real collaborators from the configuration and run one sync pass.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let timeout = StdDuration::from_secs(config.http_timeout_secs);

    let target = BmvClient::new(BmvConfig {
        base_url: config.bmv_base_url.clone(),
        username: config.bmv_username.clone(),
        password: config.bmv_password.clone(),
        timeout,
    })
    .context("building BMV client")?;

    let source = KonzertmeisterClient::new(KonzertmeisterConfig {
        base_url: config.km_base_url.clone(),
        mail: config.km_username.clone(),
        password: config.km_password.clone(),
        locale: config.km_locale.clone(),
        timezone_id: config.km_timezone.clone(),
        timeout,
    })
    .context("building Konzertmeister client")?;

    let classifier: Box<dyn Classifier> = match &config.openai_api_key {
        Some(api_key) => Box::new(
            OpenAiClassifier::new(OpenAiConfig {
                api_key: api_key.clone(),
                model: config.openai_model.clone(),
                api_url: config.openai_api_url.clone(),
                timeout,
            })
            .context("building OpenAI client")?,
        ),
        None => {
            warn!("OPENAI_API_KEY not set; categories fall back to the first candidate");
            Box::new(FirstCategoryClassifier)
        }
    };

    let engine = SyncEngine::new(
        Box::new(target),
        Box::new(source),
        classifier,
        SyncOptions::from_config(config),
    );
    engine.run().await
}
