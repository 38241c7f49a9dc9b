//! Trigger evaluation: deciding whether a stimulus starts an execution.
//!
//! `TriggerEvaluator` matches one [`Stimulus`] against one trigger, applies
//! the trigger's conditions and bounds, and either fires, defers the firing
//! into the debounce window, or reports no match. `TriggerManager` validates
//! trigger configs at registration and indexes the triggers that need
//! external routing (webhook paths, cron schedules).

use std::collections::HashMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use stepwise_types::workflow::{
    EntityOperation, FieldCondition, Trigger, TriggerConfig, TriggerProvenance, TriggerType,
    WebhookAuth,
};

use super::expression::evaluate_all;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while registering or evaluating triggers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TriggerError {
    /// Trigger configuration is malformed.
    #[error("trigger registration failed: {0}")]
    RegistrationFailed(String),

    /// Cron or human-readable schedule could not be parsed.
    #[error("invalid schedule '{0}'")]
    InvalidSchedule(String),

    /// Timezone is not a known IANA zone.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// A trigger condition could not be evaluated.
    #[error("condition evaluation failed: {0}")]
    Condition(String),
}

// ---------------------------------------------------------------------------
// Stimulus / outcome
// ---------------------------------------------------------------------------

/// Something that happened which may start an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stimulus {
    Manual {
        #[serde(default)]
        payload: Value,
    },
    /// Scheduler clock tick.
    Tick { at: DateTime<Utc> },
    Event {
        event_type: String,
        #[serde(default)]
        payload: Value,
    },
    EntityChange {
        entity_type: String,
        operation: EntityOperation,
        #[serde(default)]
        payload: Value,
    },
    /// Webhook call whose authentication has already been verified.
    Webhook {
        path: String,
        #[serde(default)]
        payload: Value,
    },
    Email {
        mailbox: String,
        #[serde(default)]
        payload: Value,
    },
    ApiCall {
        endpoint: String,
        #[serde(default)]
        payload: Value,
    },
    FileUpload {
        folder: String,
        mime_type: String,
        #[serde(default)]
        payload: Value,
    },
    Integration {
        provider: String,
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Stimulus {
    /// Stimulus payload (`Null` for ticks).
    pub fn payload(&self) -> &Value {
        static NULL: Value = Value::Null;
        match self {
            Stimulus::Tick { .. } => &NULL,
            Stimulus::Manual { payload }
            | Stimulus::Event { payload, .. }
            | Stimulus::EntityChange { payload, .. }
            | Stimulus::Webhook { payload, .. }
            | Stimulus::Email { payload, .. }
            | Stimulus::ApiCall { payload, .. }
            | Stimulus::FileUpload { payload, .. }
            | Stimulus::Integration { payload, .. } => payload,
        }
    }

    /// External event identifier carried in the payload, if any.
    pub fn event_id(&self) -> Option<String> {
        let payload = self.payload();
        ["event_id", "id"]
            .iter()
            .find_map(|key| payload.get(key))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// A decision to start an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFiring {
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub fired_at: DateTime<Utc>,
    pub event_id: Option<String>,
    /// Initial execution input.
    pub input: Value,
}

impl TriggerFiring {
    pub fn provenance(&self) -> TriggerProvenance {
        TriggerProvenance {
            trigger_id: Some(self.trigger_id.clone()),
            trigger_type: self.trigger_type,
            fired_at: self.fired_at,
            event_id: self.event_id.clone(),
        }
    }
}

/// Result of evaluating one trigger against one stimulus.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    NoMatch,
    Fire(TriggerFiring),
    /// Matched, but held in the debounce window.
    Debounced { due: DateTime<Utc> },
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - 5-field cron              -> seconds field "0" prepended
/// - 6-field cron              -> unchanged
/// - "every N seconds"         -> "*/N * * * * *"
/// - "every N minutes"         -> "0 */N * * * *"
/// - "every N hours"           -> "0 0 */N * * *"
/// - "every minute" / "minutely"
/// - "every hour" / "hourly"
/// - "every day" / "daily"
/// - "every day at HH:MM"      -> "0 MM HH * * *"
pub fn normalize_schedule(input: &str) -> Result<String, TriggerError> {
    let trimmed = input.trim();
    let invalid = || TriggerError::InvalidSchedule(input.to_string());

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.len() {
        5 => return Ok(format!("0 {}", parts.join(" "))),
        6 => return Ok(parts.join(" ")),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour < 24 && minute < 60 {
            return Ok(format!("0 {minute} {hour} * * *"));
        }
        return Err(invalid());
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [n, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = n.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Parse a schedule (any supported form) into a matcher.
pub fn parse_schedule(input: &str) -> Result<croner::Cron, TriggerError> {
    normalize_schedule(input)?
        .parse::<croner::Cron>()
        .map_err(|_| TriggerError::InvalidSchedule(input.to_string()))
}

/// Resolve an optional IANA timezone name, defaulting to UTC.
pub fn parse_timezone(name: Option<&str>) -> Result<chrono_tz::Tz, TriggerError> {
    match name {
        None => Ok(chrono_tz::UTC),
        Some(tz) => tz
            .parse::<chrono_tz::Tz>()
            .map_err(|_| TriggerError::UnknownTimezone(tz.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Pending {
    firing: TriggerFiring,
    due: DateTime<Utc>,
}

/// Trailing-edge debounce buffer keyed by (workflow, trigger).
///
/// A newer match replaces the pending firing and pushes its due time out, so
/// a burst collapses into one firing carrying the last stimulus.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: DashMap<(Uuid, String), Pending>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `firing` until `due`, replacing any earlier pending firing.
    pub fn defer(&self, workflow_id: Uuid, firing: TriggerFiring, due: DateTime<Utc>) {
        self.pending
            .insert((workflow_id, firing.trigger_id.clone()), Pending { firing, due });
    }

    /// Remove and return every firing whose window has elapsed.
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<(Uuid, TriggerFiring)> {
        let due: Vec<(Uuid, String)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().due <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut flushed: Vec<(Uuid, TriggerFiring)> = due
            .into_iter()
            .filter_map(|key| self.pending.remove_if(&key, |_, p| p.due <= now))
            .map(|((workflow_id, _), pending)| (workflow_id, pending.firing))
            .collect();
        flushed.sort_by(|a, b| a.1.fired_at.cmp(&b.1.fired_at));
        flushed
    }

    /// Drop pending firings for a workflow.
    pub fn discard_workflow(&self, workflow_id: Uuid) {
        self.pending.retain(|(wf, _), _| *wf != workflow_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TriggerEvaluator
// ---------------------------------------------------------------------------

/// Matches stimuli against triggers and owns the debounce buffer.
#[derive(Debug, Default)]
pub struct TriggerEvaluator {
    debouncer: Debouncer,
}

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    /// Evaluate `stimulus` against `trigger`, updating its match counters.
    ///
    /// Errors increment `failed_triggers` and start nothing.
    pub fn evaluate(
        &self,
        workflow_id: Uuid,
        trigger: &mut Trigger,
        stimulus: &Stimulus,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome, TriggerError> {
        if !trigger.enabled {
            return Ok(TriggerOutcome::NoMatch);
        }

        let input = match match_stimulus(trigger, stimulus) {
            Ok(Some(input)) => input,
            Ok(None) => return Ok(TriggerOutcome::NoMatch),
            Err(e) => {
                trigger.stats.failed_triggers += 1;
                tracing::warn!(
                    %workflow_id,
                    trigger_id = %trigger.id,
                    error = %e,
                    "trigger evaluation failed"
                );
                return Err(e);
            }
        };

        trigger.stats.total_triggers += 1;
        trigger.stats.last_triggered_at = Some(now);
        if let Stimulus::Tick { at } = stimulus {
            trigger.stats.last_run_at = Some(*at);
        }

        let firing = TriggerFiring {
            trigger_id: trigger.id.clone(),
            trigger_type: trigger.config.trigger_type(),
            fired_at: now,
            event_id: stimulus.event_id(),
            input,
        };

        let window = debounce_window(&trigger.config);
        if window > 0 {
            let due = now + Duration::milliseconds(window as i64);
            tracing::debug!(%workflow_id, trigger_id = %trigger.id, %due, "trigger debounced");
            self.debouncer.defer(workflow_id, firing, due);
            return Ok(TriggerOutcome::Debounced { due });
        }

        tracing::debug!(%workflow_id, trigger_id = %trigger.id, "trigger fired");
        Ok(TriggerOutcome::Fire(firing))
    }

    /// Firings whose debounce window has elapsed.
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<(Uuid, TriggerFiring)> {
        self.debouncer.flush_due(now)
    }

    /// Count a firing that started an execution.
    pub fn record_started(trigger: &mut Trigger) {
        trigger.stats.successful_triggers += 1;
        trigger.stats.run_count = trigger.stats.run_count.saturating_add(1);
    }

    /// Count a firing that could not start an execution.
    pub fn record_failed(trigger: &mut Trigger) {
        trigger.stats.failed_triggers += 1;
    }
}

fn debounce_window(config: &TriggerConfig) -> u64 {
    match config {
        TriggerConfig::Event { debounce_ms, .. } | TriggerConfig::EntityChange { debounce_ms, .. } => {
            *debounce_ms
        }
        _ => 0,
    }
}

/// Match a stimulus, returning the execution input on success.
fn match_stimulus(trigger: &Trigger, stimulus: &Stimulus) -> Result<Option<Value>, TriggerError> {
    match (&trigger.config, stimulus) {
        (TriggerConfig::Manual {}, Stimulus::Manual { payload }) => Ok(Some(payload.clone())),

        (
            TriggerConfig::Scheduled {
                cron,
                timezone,
                start_date,
                end_date,
                max_runs,
            },
            Stimulus::Tick { at },
        ) => {
            let at = *at;
            let normalized = normalize_schedule(cron)?;
            let slot = floor_tick(at, &normalized);
            // One firing per schedule slot, however often the clock ticks.
            if trigger.stats.last_run_at.is_some_and(|last| slot <= last)
                || start_date.is_some_and(|start| at < start)
                || end_date.is_some_and(|end| at > end)
                || max_runs.is_some_and(|max| trigger.stats.run_count >= max)
            {
                return Ok(None);
            }
            let tz = parse_timezone(timezone.as_deref())?;
            let schedule = parse_schedule(cron)?;
            let local = slot.with_timezone(&tz);
            let matching = schedule
                .is_time_matching(&local)
                .map_err(|_| TriggerError::InvalidSchedule(cron.clone()))?;
            Ok(matching.then(|| {
                json!({
                    "scheduled_at": at.to_rfc3339(),
                    "timezone": tz.name(),
                })
            }))
        }

        (
            TriggerConfig::Event {
                event_type,
                conditions,
                ..
            },
            Stimulus::Event {
                event_type: got,
                payload,
            },
        ) => {
            if event_type != got {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        (
            TriggerConfig::EntityChange {
                entity_type,
                operations,
                conditions,
                ..
            },
            Stimulus::EntityChange {
                entity_type: got,
                operation,
                payload,
            },
        ) => {
            if entity_type != got || !(operations.is_empty() || operations.contains(operation)) {
                return Ok(None);
            }
            let Some(input) = conditions_input(conditions, payload)? else {
                return Ok(None);
            };
            Ok(Some(with_defaults(
                input,
                [
                    ("entity_type", json!(got)),
                    ("operation", json!(operation)),
                ],
            )))
        }

        (TriggerConfig::Webhook { path, conditions, .. }, Stimulus::Webhook { path: got, payload }) => {
            if normalize_path(path) != normalize_path(got) {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        (TriggerConfig::Email { mailbox, conditions }, Stimulus::Email { mailbox: got, payload }) => {
            if mailbox.as_ref().is_some_and(|m| !m.eq_ignore_ascii_case(got)) {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        (TriggerConfig::ApiCall { endpoint, conditions }, Stimulus::ApiCall { endpoint: got, payload }) => {
            if endpoint.as_ref().is_some_and(|e| normalize_path(e) != normalize_path(got)) {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        (
            TriggerConfig::FileUpload {
                folder,
                mime_types,
                conditions,
            },
            Stimulus::FileUpload {
                folder: got,
                mime_type,
                payload,
            },
        ) => {
            if folder.as_ref().is_some_and(|f| normalize_path(f) != normalize_path(got)) {
                return Ok(None);
            }
            if !mime_types.is_empty() && !mime_types.iter().any(|m| mime_matches(m, mime_type)) {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        (
            TriggerConfig::Integration {
                provider,
                event,
                conditions,
            },
            Stimulus::Integration {
                provider: got_provider,
                event: got_event,
                payload,
            },
        ) => {
            if provider != got_provider || event.as_ref().is_some_and(|e| e != got_event) {
                return Ok(None);
            }
            conditions_input(conditions, payload)
        }

        _ => Ok(None),
    }
}

fn conditions_input(conditions: &[FieldCondition], payload: &Value) -> Result<Option<Value>, TriggerError> {
    let matched = evaluate_all(conditions, payload).map_err(|e| TriggerError::Condition(e.to_string()))?;
    Ok(matched.then(|| payload.clone()))
}

/// Insert keys into an object input without overwriting the payload's own.
fn with_defaults<const N: usize>(input: Value, defaults: [(&str, Value); N]) -> Value {
    let mut map = match input {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };
    for (key, value) in defaults {
        map.entry(key.to_string()).or_insert(value);
    }
    Value::Object(map)
}

/// Minute-granularity schedules match on the minute; second-granularity
/// schedules on the second.
fn floor_tick(at: DateTime<Utc>, normalized: &str) -> DateTime<Utc> {
    let unit = if normalized.split_whitespace().next() == Some("0") {
        Duration::minutes(1)
    } else {
        Duration::seconds(1)
    };
    at.duration_trunc(unit).unwrap_or(at)
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn mime_matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(major) => mime
            .split_once('/')
            .is_some_and(|(m, _)| m.eq_ignore_ascii_case(major)),
        None => pattern.eq_ignore_ascii_case(mime),
    }
}

// ---------------------------------------------------------------------------
// TriggerManager
// ---------------------------------------------------------------------------

/// A webhook trigger's route entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRoute {
    pub workflow_id: Uuid,
    pub trigger_id: String,
    pub auth: Option<WebhookAuth>,
}

/// A scheduled trigger's registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub workflow_id: Uuid,
    pub trigger_id: String,
    /// Normalized 6-field cron expression.
    pub cron: String,
    pub timezone: chrono_tz::Tz,
}

/// Validates trigger configs and indexes the triggers that need routing.
#[derive(Debug, Default)]
pub struct TriggerManager {
    webhooks: DashMap<String, Vec<WebhookRoute>>,
    schedules: DashMap<Uuid, Vec<ScheduleEntry>>,
}

impl TriggerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a trigger configuration.
    pub fn validate(trigger: &Trigger) -> Result<(), TriggerError> {
        match &trigger.config {
            TriggerConfig::Scheduled {
                cron,
                timezone,
                start_date,
                end_date,
                ..
            } => {
                parse_schedule(cron)?;
                parse_timezone(timezone.as_deref())?;
                if let (Some(start), Some(end)) = (start_date, end_date) {
                    if end < start {
                        return Err(TriggerError::RegistrationFailed(
                            "end_date is before start_date".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            TriggerConfig::Webhook { path, .. } => {
                if path.trim().is_empty() {
                    return Err(TriggerError::RegistrationFailed(
                        "webhook path must not be empty".to_string(),
                    ));
                }
                if !path.starts_with('/') {
                    return Err(TriggerError::RegistrationFailed(format!(
                        "webhook path must start with '/': '{path}'"
                    )));
                }
                Ok(())
            }
            TriggerConfig::Event { event_type, .. } => {
                if event_type.trim().is_empty() {
                    return Err(TriggerError::RegistrationFailed(
                        "event type must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            TriggerConfig::EntityChange { entity_type, .. } => {
                if entity_type.trim().is_empty() {
                    return Err(TriggerError::RegistrationFailed(
                        "entity type must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            TriggerConfig::Integration { provider, .. } => {
                if provider.trim().is_empty() {
                    return Err(TriggerError::RegistrationFailed(
                        "integration provider must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            TriggerConfig::Manual {}
            | TriggerConfig::Email { .. }
            | TriggerConfig::ApiCall { .. }
            | TriggerConfig::FileUpload { .. } => Ok(()),
        }
    }

    /// Validate and index all triggers of a workflow, replacing any
    /// previous registration.
    pub fn register_workflow(&self, workflow_id: Uuid, workflow_name: &str, triggers: &[Trigger]) -> Result<(), TriggerError> {
        let mut schedules = Vec::new();
        let mut webhooks: HashMap<String, Vec<WebhookRoute>> = HashMap::new();

        for trigger in triggers {
            Self::validate(trigger)?;
            if !trigger.enabled {
                continue;
            }
            match &trigger.config {
                TriggerConfig::Scheduled { cron, timezone, .. } => schedules.push(ScheduleEntry {
                    workflow_id,
                    trigger_id: trigger.id.clone(),
                    cron: normalize_schedule(cron)?,
                    timezone: parse_timezone(timezone.as_deref())?,
                }),
                TriggerConfig::Webhook { path, auth, .. } => webhooks
                    .entry(normalize_path(path).to_string())
                    .or_default()
                    .push(WebhookRoute {
                        workflow_id,
                        trigger_id: trigger.id.clone(),
                        auth: auth.clone(),
                    }),
                _ => {}
            }
        }

        self.unregister_workflow(workflow_id);
        let schedule_count = schedules.len();
        if !schedules.is_empty() {
            self.schedules.insert(workflow_id, schedules);
        }
        let webhook_count = webhooks.len();
        for (path, routes) in webhooks {
            self.webhooks.entry(path).or_default().extend(routes);
        }

        tracing::info!(
            %workflow_id,
            workflow_name,
            trigger_count = triggers.len(),
            schedule_count,
            webhook_count,
            "registered workflow triggers"
        );
        Ok(())
    }

    /// Drop all registrations of a workflow.
    pub fn unregister_workflow(&self, workflow_id: Uuid) {
        self.schedules.remove(&workflow_id);
        self.webhooks.retain(|_, routes| {
            routes.retain(|r| r.workflow_id != workflow_id);
            !routes.is_empty()
        });
    }

    /// Webhook triggers registered at `path`.
    pub fn webhook_routes(&self, path: &str) -> Vec<WebhookRoute> {
        self.webhooks
            .get(normalize_path(path))
            .map(|routes| routes.clone())
            .unwrap_or_default()
    }

    /// All registered schedules.
    pub fn schedules(&self) -> Vec<ScheduleEntry> {
        self.schedules
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
