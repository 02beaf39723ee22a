//! Supervisor REST client: bearer token selection, state posts and the backups API.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Full snapshots are created and restored synchronously; both can take minutes.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Name prefix of the snapshots this tool creates. Only those are pruned.
pub const SNAPSHOT_PREFIX: &str = "borg-";

/// One candidate bearer token, e.g. `SUPERVISOR_TOKEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub name: String,
    pub value: Option<String>,
}

impl CredentialSource {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// The token, if set and not blank.
    pub fn token(&self) -> Option<&str> {
        self.value.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no credentials: none of the token sources is set")]
    NoCredentials,
    #[error("credential {name} rejected with status {status}")]
    Rejected { name: String, status: u16 },
    #[error("{path} failed with status {status}")]
    Status { path: String, status: u16 },
    #[error("{path} request failed: {message}")]
    Transport { path: String, message: String },
    #[error("{path} answered: {message}")]
    Reply { path: String, message: String },
}

enum Attempt {
    Accepted(String),
    Unauthorized(u16),
}

/// Blocking client for `{base_url}/...` with a cached credential choice.
pub struct SupervisorClient {
    base_url: String,
    candidates: Vec<CredentialSource>,
    client: reqwest::blocking::Client,
    active: Mutex<Option<usize>>,
}

impl SupervisorClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        candidates: Vec<CredentialSource>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::reporting(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            candidates,
            client,
            active: Mutex::new(None),
        })
    }

    fn usable(&self) -> Vec<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.token().is_some())
            .map(|(i, _)| i)
            .collect()
    }

    fn remember(&self, idx: Option<usize>) {
        if let Ok(mut active) = self.active.lock() {
            *active = idx;
        }
    }

    /// Send one request and return the response body. The cached credential goes first;
    /// on 401/403 the other usable credential is tried exactly once.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<String, ApiError> {
        let usable = self.usable();
        let Some(&first) = usable.first() else {
            return Err(ApiError::NoCredentials);
        };
        let cached = self.active.lock().ok().and_then(|a| *a);
        let current = cached.filter(|i| usable.contains(i)).unwrap_or(first);

        let code = match self.send(current, &method, path, body, timeout)? {
            Attempt::Accepted(text) => {
                self.remember(Some(current));
                return Ok(text);
            }
            Attempt::Unauthorized(code) => code,
        };
        self.remember(None);
        let Some(next) = usable.iter().copied().find(|&i| i != current) else {
            return Err(ApiError::Rejected {
                name: self.candidates[current].name.clone(),
                status: code,
            });
        };
        warn!(
            rejected = %self.candidates[current].name,
            fallback = %self.candidates[next].name,
            "supervisor rejected token, trying the other credential"
        );
        match self.send(next, &method, path, body, timeout)? {
            Attempt::Accepted(text) => {
                self.remember(Some(next));
                Ok(text)
            }
            Attempt::Unauthorized(code) => Err(ApiError::Rejected {
                name: self.candidates[next].name.clone(),
                status: code,
            }),
        }
    }

    /// [`SupervisorClient::request`] for endpoints answering `{"result": "ok", "data": ..}`.
    /// Returns `data`.
    pub fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, ApiError> {
        let text = self.request(method, path, body, timeout)?;
        let reply: Value = serde_json::from_str(&text).map_err(|e| ApiError::Reply {
            path: path.to_string(),
            message: format!("invalid JSON: {e}"),
        })?;
        if reply.get("result").and_then(Value::as_str) != Some("ok") {
            let message = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("result is not ok");
            return Err(ApiError::Reply {
                path: path.to_string(),
                message: message.to_string(),
            });
        }
        Ok(reply.get("data").cloned().unwrap_or(Value::Null))
    }

    fn send(
        &self,
        idx: usize,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Attempt, ApiError> {
        let source = &self.candidates[idx];
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let mut req = self
            .client
            .request(method.clone(), url)
            .bearer_auth(source.token().unwrap_or_default());
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let transport = |e: reqwest::Error| ApiError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        };
        let res = req.send().map_err(transport)?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(Attempt::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(%method, path, credential = %source.name, "supervisor request accepted");
        Ok(Attempt::Accepted(res.text().map_err(transport)?))
    }
}

/// One entry of `GET /backups`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SupervisorBackup {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    /// ISO 8601; sorts chronologically as a string.
    #[serde(default)]
    pub date: String,
}

/// Full snapshots kept by the supervisor itself.
pub trait SnapshotApi: Send + Sync {
    /// Take a full snapshot and wait for it. Returns its slug.
    fn create_full(&self, name: &str) -> Result<String>;
    fn list(&self) -> Result<Vec<SupervisorBackup>>;
    fn remove(&self, slug: &str) -> Result<()>;
    /// Rescan the backup directory, then restore `slug` in full. The supervisor restarts
    /// the core afterwards.
    fn restore_full(&self, slug: &str) -> Result<()>;
}

/// [`SnapshotApi`] over the supervisor's `/backups` endpoints.
pub struct SupervisorBackups {
    client: SupervisorClient,
}

impl SupervisorBackups {
    pub fn new(client: SupervisorClient) -> Self {
        Self { client }
    }
}

fn api_failure(e: ApiError) -> Error {
    Error::execution(format!("supervisor backups API: {e}"))
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    backups: Vec<SupervisorBackup>,
}

impl SnapshotApi for SupervisorBackups {
    fn create_full(&self, name: &str) -> Result<String> {
        let body = json!({ "name": name, "compressed": true });
        let data = self
            .client
            .call(Method::POST, "/backups/new/full", Some(&body), Some(SNAPSHOT_TIMEOUT))
            .map_err(api_failure)?;
        data.get("slug")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::execution("supervisor created a snapshot without a slug"))
    }

    fn list(&self) -> Result<Vec<SupervisorBackup>> {
        let data = self
            .client
            .call(Method::GET, "/backups", None, None)
            .map_err(api_failure)?;
        Ok(serde_json::from_value::<Listing>(data)?.backups)
    }

    fn remove(&self, slug: &str) -> Result<()> {
        self.client
            .call(Method::DELETE, &format!("/backups/{slug}"), None, None)
            .map(|_| ())
            .map_err(api_failure)
    }

    fn restore_full(&self, slug: &str) -> Result<()> {
        self.client
            .call(Method::POST, "/backups/reload", None, None)
            .map_err(api_failure)?;
        self.client
            .call(
                Method::POST,
                &format!("/backups/{slug}/restore/full"),
                None,
                Some(SNAPSHOT_TIMEOUT),
            )
            .map(|_| ())
            .map_err(api_failure)
    }
}

/// Delete this tool's snapshots beyond the newest `retention`. A failed delete is logged
/// and the rest are still tried. Returns the removed slugs.
pub fn prune_snapshots(api: &dyn SnapshotApi, retention: u32) -> Result<Vec<String>> {
    let mut ours: Vec<SupervisorBackup> = api
        .list()?
        .into_iter()
        .filter(|b| b.name.starts_with(SNAPSHOT_PREFIX))
        .collect();
    ours.sort_by(|a, b| b.date.cmp(&a.date));

    let mut removed = Vec::new();
    for old in ours.iter().skip(retention as usize) {
        match api.remove(&old.slug) {
            Ok(()) => {
                info!(slug = %old.slug, name = %old.name, "deleted supervisor snapshot beyond retention");
                removed.push(old.slug.clone());
            }
            Err(e) => warn!(slug = %old.slug, error = %e, "failed to delete supervisor snapshot"),
        }
    }
    Ok(removed)
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::testing::{Seen, spawn_supervisor};
    use super::*;

    fn sources(a: Option<&str>, b: Option<&str>) -> Vec<CredentialSource> {
        vec![
            CredentialSource::new("SUPERVISOR_TOKEN", a.map(Into::into)),
            CredentialSource::new("HASSIO_TOKEN", b.map(Into::into)),
        ]
    }

    fn client(url: String) -> SupervisorClient {
        SupervisorClient::new(url, Duration::from_secs(5), sources(Some("tok-a"), Some("tok-b")))
            .expect("client")
    }

    fn by_token(codes: HashMap<&'static str, u16>) -> impl Fn(&Seen) -> (u16, String) + Send {
        move |seen| {
            let code = codes.get(seen.token.as_str()).copied().unwrap_or(404);
            (code, r#"{"result": "ok", "data": {}}"#.to_string())
        }
    }

    fn tokens(seen: &Mutex<Vec<Seen>>) -> Vec<String> {
        seen.lock().expect("seen").iter().map(|s| s.token.clone()).collect()
    }

    #[test]
    fn rejected_cached_credential_falls_back_to_an_earlier_one() {
        let (url, seen, handle) =
            spawn_supervisor(by_token(HashMap::from([("tok-a", 200), ("tok-b", 401)])), 2);
        let client = client(url);
        *client.active.lock().expect("active") = Some(1);

        client
            .request(Method::GET, "/backups", None, None)
            .expect("fallback succeeds");
        handle.join().expect("server");

        assert_eq!(tokens(&seen), vec!["tok-b", "tok-a"]);
        assert_eq!(*client.active.lock().expect("active"), Some(0));
    }

    #[test]
    fn single_credential_rejected_is_not_retried() {
        let (url, seen, handle) = spawn_supervisor(by_token(HashMap::from([("tok-a", 403)])), 1);
        let client = SupervisorClient::new(url, Duration::from_secs(5), sources(Some("tok-a"), None))
            .expect("client");
        let err = client.request(Method::GET, "/backups", None, None).unwrap_err();
        handle.join().expect("server");
        assert!(matches!(err, ApiError::Rejected { status: 403, .. }), "{err}");
        assert_eq!(tokens(&seen), vec!["tok-a"]);
    }

    #[test]
    fn call_unwraps_data_and_rejects_error_results() {
        let (url, _seen, handle) = spawn_supervisor(
            |seen| match seen.path.as_str() {
                "/ok" => (200, r#"{"result": "ok", "data": {"slug": "abc"}}"#.to_string()),
                _ => (200, r#"{"result": "error", "message": "backup in progress"}"#.to_string()),
            },
            2,
        );
        let client = client(url);
        let data = client.call(Method::GET, "/ok", None, None).expect("ok reply");
        assert_eq!(data["slug"], "abc");
        let err = client.call(Method::GET, "/busy", None, None).unwrap_err();
        handle.join().expect("server");
        assert!(err.to_string().contains("backup in progress"), "{err}");
    }

    #[test]
    fn backups_api_creates_lists_and_restores() {
        let (url, seen, handle) = spawn_supervisor(
            |seen| {
                let reply = match (seen.method.as_str(), seen.path.as_str()) {
                    ("POST", "/backups/new/full") => r#"{"result": "ok", "data": {"slug": "9f1c2d3e"}}"#,
                    ("GET", "/backups") => {
                        r#"{"result": "ok", "data": {"backups": [{"slug": "9f1c2d3e", "name": "borg-2026-10-18", "date": "2026-10-18T02:00:00+00:00"}]}}"#
                    }
                    _ => r#"{"result": "ok", "data": {}}"#,
                };
                (200, reply.to_string())
            },
            4,
        );
        let api = SupervisorBackups::new(client(url));

        assert_eq!(api.create_full("borg-2026-10-18").expect("create"), "9f1c2d3e");
        let listed = api.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "borg-2026-10-18");
        api.restore_full("9f1c2d3e").expect("restore");
        handle.join().expect("server");

        let seen = seen.lock().expect("seen");
        let create: Value = serde_json::from_str(&seen[0].body).expect("create body");
        assert_eq!(create["name"], "borg-2026-10-18");
        assert_eq!(create["compressed"], true);
        let calls: Vec<(String, String)> =
            seen.iter().map(|s| (s.method.clone(), s.path.clone())).collect();
        assert_eq!(
            calls[2..],
            [
                ("POST".to_string(), "/backups/reload".to_string()),
                ("POST".to_string(), "/backups/9f1c2d3e/restore/full".to_string()),
            ]
        );
    }

    #[derive(Default)]
    struct Listed {
        backups: Vec<SupervisorBackup>,
        fail_on: Option<&'static str>,
        removed: Mutex<Vec<String>>,
    }

    impl SnapshotApi for Listed {
        fn create_full(&self, _name: &str) -> Result<String> {
            Err(Error::execution("not used"))
        }

        fn list(&self) -> Result<Vec<SupervisorBackup>> {
            Ok(self.backups.clone())
        }

        fn remove(&self, slug: &str) -> Result<()> {
            if self.fail_on == Some(slug) {
                return Err(Error::execution("supervisor backups API: /backups failed with status 500"));
            }
            self.removed.lock().expect("removed").push(slug.to_string());
            Ok(())
        }

        fn restore_full(&self, _slug: &str) -> Result<()> {
            Err(Error::execution("not used"))
        }
    }

    fn backup(slug: &str, name: &str, day: u32) -> SupervisorBackup {
        SupervisorBackup {
            slug: slug.into(),
            name: name.into(),
            date: format!("2026-10-{day:02}T02:00:00+00:00"),
        }
    }

    #[test]
    fn prune_keeps_newest_of_ours_and_ignores_foreign_snapshots() {
        let api = Listed {
            backups: vec![
                backup("a", "borg-a", 1),
                backup("manual", "Before upgrade", 2),
                backup("c", "borg-c", 3),
                backup("b", "borg-b", 2),
                backup("d", "borg-d", 4),
            ],
            fail_on: Some("b"),
            ..Listed::default()
        };
        let removed = prune_snapshots(&api, 2).expect("prune");
        assert_eq!(removed, vec!["a"]);
        assert_eq!(*api.removed.lock().expect("removed"), vec!["a"]);
    }
}
