//! Status publishing to the supervisor's core state API.

use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::ReporterSettings;
use crate::error::{Error, Result};
use crate::supervisor::{CredentialSource, SupervisorClient};

/// Values of the main status entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Repairing,
    CreatingHaBackup,
    CreatingBackup,
    CleaningUp,
    Completed,
    Error,
    RestoreMode,
    ListingBackups,
    Extracting,
    Unpacking,
    RestoreCompleted,
    RestoreError,
    Restarting,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Repairing => "repairing",
            Phase::CreatingHaBackup => "creating_ha_backup",
            Phase::CreatingBackup => "creating_borg_backup",
            Phase::CleaningUp => "cleaning_up",
            Phase::Completed => "completed",
            Phase::Error => "error",
            Phase::RestoreMode => "restore_mode",
            Phase::ListingBackups => "listing_backups",
            Phase::Extracting => "extracting",
            Phase::Unpacking => "unpacking",
            Phase::RestoreCompleted => "restore_completed",
            Phase::RestoreError => "restore_error",
            Phase::Restarting => "restarting",
        }
    }
}

/// Entity ids derived from the configured prefix (`borg_backup` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entities {
    pub status: String,
    pub last: String,
    pub repository: String,
    pub available: String,
    pub available_backups: String,
    pub security: String,
}

impl Entities {
    pub fn new(prefix: &str) -> Self {
        let stem = prefix.strip_suffix("_backup").unwrap_or(prefix);
        Self {
            status: format!("sensor.{prefix}_status"),
            last: format!("sensor.{prefix}_last"),
            repository: format!("sensor.{prefix}_repository"),
            available: format!("binary_sensor.{prefix}_available"),
            available_backups: format!("sensor.{stem}_available_backups"),
            security: format!("sensor.{prefix}_security"),
        }
    }

    /// Display attributes of `entity_id`. A state post replaces every attribute, so
    /// they go out with each event.
    fn presentation(&self, entity_id: &str) -> &'static [(&'static str, &'static str)] {
        if entity_id == self.status {
            &[
                ("friendly_name", "Borg Backup Status"),
                ("icon", "mdi:backup-restore"),
                ("device_class", "enum"),
            ]
        } else if entity_id == self.last {
            &[
                ("friendly_name", "Last Borg Backup"),
                ("icon", "mdi:clock-outline"),
                ("device_class", "timestamp"),
            ]
        } else if entity_id == self.repository {
            &[
                ("friendly_name", "Borg Repository Info"),
                ("icon", "mdi:database"),
                ("unit_of_measurement", "GB"),
            ]
        } else if entity_id == self.available {
            &[
                ("friendly_name", "Borg Backup Available"),
                ("icon", "mdi:check-circle"),
                ("device_class", "connectivity"),
            ]
        } else if entity_id == self.available_backups {
            &[
                ("friendly_name", "Available Borg Backups"),
                ("icon", "mdi:backup-restore"),
            ]
        } else if entity_id == self.security {
            &[
                ("friendly_name", "Borg Backup Security"),
                ("icon", "mdi:shield-alert"),
            ]
        } else {
            &[]
        }
    }

    /// `event` with the entity's display attributes filled in where it sets none.
    pub fn decorate(&self, event: &StatusEvent) -> StatusEvent {
        let mut event = event.clone();
        for (key, value) in self.presentation(&event.entity_id) {
            event
                .attributes
                .entry(*key)
                .or_insert_with(|| Value::from(*value));
        }
        event
    }

    /// States every entity starts a run in, before anything is known.
    pub fn initial_events(&self) -> Vec<StatusEvent> {
        vec![
            StatusEvent::new(self.status.clone(), Phase::Idle.as_str()),
            StatusEvent::new(self.last.clone(), "unknown"),
            StatusEvent::new(self.repository.clone(), "unknown"),
            StatusEvent::new(self.available.clone(), "off"),
        ]
    }
}

impl Default for Entities {
    fn default() -> Self {
        Self::new("borg_backup")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    #[serde(skip)]
    pub entity_id: String,
    pub state: String,
    pub attributes: Map<String, Value>,
}

impl StatusEvent {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn phase(entities: &Entities, phase: Phase) -> Self {
        Self::new(entities.status.clone(), phase.as_str())
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(self) -> Self {
        self.attr("timestamp", chrono::Local::now().to_rfc3339())
    }
}

pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: &StatusEvent) -> Result<()>;
}

/// Publish and log any failure. Status is advisory; callers never stop on it.
pub fn publish_best_effort(publisher: &dyn StatusPublisher, event: &StatusEvent) {
    if let Err(e) = publisher.publish(event) {
        warn!(entity = %event.entity_id, error = %e, "status publish failed");
    }
}

/// HTTP publisher for `POST {base}/core/api/states/{entity_id}`.
pub struct StatusReporter {
    enabled: bool,
    entities: Entities,
    client: SupervisorClient,
}

impl StatusReporter {
    pub fn new(settings: ReporterSettings, candidates: Vec<CredentialSource>) -> Result<Self> {
        let client = SupervisorClient::new(settings.base_url, settings.timeout, candidates)?;
        Ok(Self {
            enabled: settings.enabled,
            entities: Entities::new(&settings.entity_prefix),
            client,
        })
    }
}

impl StatusPublisher for StatusReporter {
    fn publish(&self, event: &StatusEvent) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let event = self.entities.decorate(event);
        let body = serde_json::to_value(&event)?;
        let path = format!("/core/api/states/{}", event.entity_id);
        self.client
            .request(Method::POST, &path, Some(&body), None)
            .map_err(|e| Error::reporting(format!("publish {} failed: {e}", event.entity_id)))?;
        debug!(entity = %event.entity_id, state = %event.state, "status published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::supervisor::testing::{Seen, spawn_supervisor};

    fn by_token(codes: HashMap<&'static str, u16>) -> impl Fn(&Seen) -> (u16, String) + Send {
        move |seen| (codes.get(seen.token.as_str()).copied().unwrap_or(404), String::new())
    }

    fn settings(base_url: String) -> ReporterSettings {
        ReporterSettings {
            enabled: true,
            base_url,
            entity_prefix: "borg_backup".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn sources(a: Option<&str>, b: Option<&str>) -> Vec<CredentialSource> {
        vec![
            CredentialSource::new("SUPERVISOR_TOKEN", a.map(Into::into)),
            CredentialSource::new("HASSIO_TOKEN", b.map(Into::into)),
        ]
    }

    #[test]
    fn entity_names_follow_prefix() {
        let e = Entities::default();
        assert_eq!(e.status, "sensor.borg_backup_status");
        assert_eq!(e.available, "binary_sensor.borg_backup_available");
        assert_eq!(e.available_backups, "sensor.borg_available_backups");
        let e = Entities::new("nas");
        assert_eq!(e.available_backups, "sensor.nas_available_backups");
    }

    #[test]
    fn decorate_adds_display_attributes_without_overriding() {
        let e = Entities::default();
        let ev = e.decorate(&StatusEvent::new(e.repository.clone(), "1.5").attr("icon", "mdi:nas"));
        assert_eq!(ev.attributes["friendly_name"], "Borg Repository Info");
        assert_eq!(ev.attributes["unit_of_measurement"], "GB");
        assert_eq!(ev.attributes["icon"], "mdi:nas");

        let ev = e.decorate(&StatusEvent::new("sensor.other", "x"));
        assert!(ev.attributes.is_empty());
    }

    #[test]
    fn initial_events_cover_the_four_run_entities() {
        let e = Entities::default();
        let states: Vec<(String, String)> = e
            .initial_events()
            .into_iter()
            .map(|ev| (ev.entity_id, ev.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (e.status.clone(), "idle".to_string()),
                (e.last.clone(), "unknown".to_string()),
                (e.repository.clone(), "unknown".to_string()),
                (e.available.clone(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn posts_state_and_attributes_with_first_token() {
        let (url, seen, handle) = spawn_supervisor(by_token(HashMap::from([("tok-a", 200)])), 1);
        let reporter =
            StatusReporter::new(settings(url), sources(Some("tok-a"), Some("tok-b"))).expect("reporter");
        let ev = StatusEvent::new("sensor.borg_backup_status", "completed").attr("archives", 3);
        reporter.publish(&ev).expect("publish");
        handle.join().expect("server");

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].path, "/core/api/states/sensor.borg_backup_status");
        assert_eq!(seen[0].token, "tok-a");
        let body: Value = serde_json::from_str(&seen[0].body).expect("json body");
        assert_eq!(body["state"], "completed");
        assert_eq!(body["attributes"]["archives"], 3);
        assert_eq!(body["attributes"]["friendly_name"], "Borg Backup Status");
        assert_eq!(body["attributes"]["device_class"], "enum");
        assert!(body.get("entity_id").is_none());
    }

    #[test]
    fn unauthorized_falls_back_exactly_once_and_caches() {
        let (url, seen, handle) =
            spawn_supervisor(by_token(HashMap::from([("tok-a", 401), ("tok-b", 201)])), 3);
        let reporter =
            StatusReporter::new(settings(url), sources(Some("tok-a"), Some("tok-b"))).expect("reporter");
        let ev = StatusEvent::new("sensor.borg_backup_last", "x");
        reporter.publish(&ev).expect("first publish");
        reporter.publish(&ev).expect("second publish");
        handle.join().expect("server");

        let tokens: Vec<String> = seen.lock().expect("seen").iter().map(|s| s.token.clone()).collect();
        assert_eq!(tokens, vec!["tok-a", "tok-b", "tok-b"]);
    }

    #[test]
    fn both_tokens_rejected_is_an_error_after_two_attempts() {
        let (url, seen, handle) =
            spawn_supervisor(by_token(HashMap::from([("tok-a", 403), ("tok-b", 401)])), 2);
        let reporter =
            StatusReporter::new(settings(url), sources(Some("tok-a"), Some("tok-b"))).expect("reporter");
        let err = reporter
            .publish(&StatusEvent::new("sensor.borg_backup_status", "error"))
            .unwrap_err();
        handle.join().expect("server");
        assert_eq!(err.kind(), "reporting_error");
        assert_eq!(seen.lock().expect("seen").len(), 2);
    }

    #[test]
    fn server_error_does_not_fall_back() {
        let (url, seen, handle) =
            spawn_supervisor(by_token(HashMap::from([("tok-a", 500), ("tok-b", 200)])), 1);
        let reporter =
            StatusReporter::new(settings(url), sources(Some("tok-a"), Some("tok-b"))).expect("reporter");
        assert!(reporter
            .publish(&StatusEvent::new("sensor.borg_backup_status", "idle"))
            .is_err());
        handle.join().expect("server");
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[test]
    fn blank_tokens_are_skipped_and_none_fails_fast() {
        let (url, seen, handle) = spawn_supervisor(by_token(HashMap::from([("tok-b", 200)])), 1);
        let reporter =
            StatusReporter::new(settings(url.clone()), sources(Some("  "), Some("tok-b"))).expect("reporter");
        reporter
            .publish(&StatusEvent::new("sensor.borg_backup_status", "idle"))
            .expect("publish");
        handle.join().expect("server");
        assert_eq!(seen.lock().expect("seen")[0].token, "tok-b");

        let reporter = StatusReporter::new(settings(url), sources(None, Some(""))).expect("reporter");
        let err = reporter
            .publish(&StatusEvent::new("sensor.borg_backup_status", "idle"))
            .unwrap_err();
        assert!(err.to_string().contains("no credentials"));
    }

    #[test]
    fn disabled_reporter_is_a_no_op() {
        let mut s = settings("http://127.0.0.1:9".into());
        s.enabled = false;
        let reporter = StatusReporter::new(s, Vec::new()).expect("reporter");
        reporter
            .publish(&StatusEvent::new("sensor.borg_backup_status", "idle"))
            .expect("no-op");
    }
}
