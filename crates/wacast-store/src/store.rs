//! The Durable Store: guarded read / read-modify-write over the document.
//!
//! Every access takes the advisory lock, parses leniently (corrupt JSON
//! becomes an empty document rather than an error), applies forward
//! migration and normalization, and persists atomically via temp-file +
//! rename. `update` runs the caller's mutator inside the same critical
//! section, so no two mutations ever interleave across processes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use wacast_core::config::{LockConfig, WacastConfig};
use wacast_core::error::Result;
use wacast_core::time::now_ms;
use wacast_core::types::{
    Document, LogEntry, SCHEMA_VERSION, UserAccount, UserSource, WaStatus,
};

use crate::lock::DocumentLock;

/// Handle to the shared JSON document.
#[derive(Debug, Clone)]
pub struct DurableStore {
    dir: PathBuf,
    doc_path: PathBuf,
    lock: LockConfig,
    env_user: String,
    env_pass: String,
}

impl DurableStore {
    pub fn new(cfg: &WacastConfig) -> Self {
        Self::with_paths(cfg.data_dir.clone(), cfg.lock, &cfg.dash_user, &cfg.dash_pass)
    }

    /// Explicit-path constructor, used directly by tests.
    pub fn with_paths(dir: PathBuf, lock: LockConfig, env_user: &str, env_pass: &str) -> Self {
        let doc_path = dir.join("data.json");
        Self {
            dir,
            doc_path,
            lock,
            env_user: env_user.trim().to_string(),
            env_pass: env_pass.to_string(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path for a document-relative media path.
    pub fn resolve_relative(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    /// Create the data directory and an empty versioned document if
    /// absent. Idempotent.
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        if !self.doc_path.exists() {
            write_atomic(&self.doc_path, &Document::empty())?;
        }
        Ok(())
    }

    /// Locked read: parse, normalize, persist back iff normalization
    /// changed anything, return the normalized document.
    pub async fn read(&self) -> Result<Document> {
        self.ensure_exists()?;
        let guard = DocumentLock::acquire(&self.doc_path, &self.lock).await?;

        let result = (|| {
            let (doc, changed) = self.load_normalized()?;
            if changed {
                write_atomic(&self.doc_path, &doc)?;
            }
            Ok(doc)
        })();

        finish(result, guard)
    }

    /// Locked read-modify-write: the mutator runs against the live,
    /// already-normalized document; on success the document is persisted
    /// atomically. A mutator error leaves the file untouched (the lock is
    /// still released) and propagates.
    pub async fn update<F>(&self, mutate: F) -> Result<Document>
    where
        F: FnOnce(&mut Document) -> Result<()>,
    {
        self.ensure_exists()?;
        let guard = DocumentLock::acquire(&self.doc_path, &self.lock).await?;

        let result = (|| {
            let (mut doc, _) = self.load_normalized()?;
            mutate(&mut doc)?;
            write_atomic(&self.doc_path, &doc)?;
            Ok(doc)
        })();

        finish(result, guard)
    }

    /// Prepend a log entry (ring buffer, capped).
    pub async fn append_log(
        &self,
        kind: &str,
        detail: Value,
        user_id: Option<&str>,
    ) -> Result<()> {
        let entry = LogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            at_ms: now_ms(),
            user_id: user_id.map(str::to_string),
            kind: kind.to_string(),
            detail,
        };
        self.update(move |doc| {
            doc.push_log(entry);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Delete a terminal job's media files unless another active job
    /// still references them. Unlink errors are ignored; the files live
    /// under the data directory and a leftover is harmless.
    pub fn gc_job_media(&self, doc: &Document, job_id: &str) {
        let Some(job) = doc.jobs.iter().find(|j| j.id == job_id) else {
            return;
        };
        let referenced: HashSet<String> = doc
            .jobs
            .iter()
            .filter(|j| j.id != job_id && j.is_active())
            .flat_map(|j| j.media_paths())
            .collect();

        for path in job.media_paths() {
            if referenced.contains(&path) {
                continue;
            }
            let absolute = self.resolve_relative(&path);
            if let Err(e) = std::fs::remove_file(&absolute) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("media gc left {}: {e}", absolute.display());
                }
            }
        }
    }

    fn load_normalized(&self) -> Result<(Document, bool)> {
        let content = std::fs::read_to_string(&self.doc_path)?;
        let raw: Value = serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("document parse failed, starting from empty: {e}");
            Value::Object(Default::default())
        });
        Ok(self.normalize(raw))
    }

    /// Forward migration + normalization. Public so tests can exercise
    /// idempotence and the v1 upgrade path directly.
    pub fn normalize(&self, raw: Value) -> (Document, bool) {
        let now = now_ms();
        let mut changed = false;
        let mut from_v1 = false;
        let mut legacy_wa: Option<WaStatus> = None;

        let mut doc = match raw.as_object() {
            Some(map) => match map.get("version").and_then(Value::as_u64) {
                Some(2) => Document {
                    version: SCHEMA_VERSION,
                    users: valid_users(map.get("users"), now),
                    wa_by_user: valid_wa_map(map.get("wa_by_user")),
                    jobs: valid_array(map.get("jobs")),
                    log: valid_log(map.get("log")),
                },
                Some(1) => {
                    from_v1 = true;
                    changed = true;
                    legacy_wa = map
                        .get("wa")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok());
                    Document {
                        version: SCHEMA_VERSION,
                        users: Vec::new(),
                        wa_by_user: Default::default(),
                        jobs: valid_array(map.get("jobs")),
                        log: valid_log(map.get("log")),
                    }
                }
                _ => {
                    changed = true;
                    Document::empty()
                }
            },
            None => {
                changed = true;
                Document::empty()
            }
        };

        let env_user_id = self.sync_env_user(&mut doc, now, &mut changed);

        if from_v1 {
            let status = legacy_wa.unwrap_or_else(|| WaStatus::offline(now));
            doc.wa_by_user.insert(env_user_id.clone(), status);
        }

        // Every known user gets a WhatsApp status record.
        let user_ids: HashSet<String> = doc.users.iter().map(|u| u.id.clone()).collect();
        for id in &user_ids {
            if !doc.wa_by_user.contains_key(id) {
                doc.wa_by_user.insert(id.clone(), WaStatus::offline(now));
                changed = true;
            }
        }

        // Orphaned jobs are re-owned by the env user.
        for job in &mut doc.jobs {
            let uid = job.user_id.trim();
            if uid.is_empty() || !user_ids.contains(uid) {
                job.user_id = env_user_id.clone();
                changed = true;
            }
        }

        // Legacy logs had no owner; fold them onto the env user too.
        if from_v1 {
            for entry in &mut doc.log {
                if entry.user_id.is_none() {
                    entry.user_id = Some(env_user_id.clone());
                    changed = true;
                }
            }
        }

        (doc, changed)
    }

    /// Create or refresh the account derived from `DASH_USER`/`DASH_PASS`.
    fn sync_env_user(&self, doc: &mut Document, now: i64, changed: &mut bool) -> String {
        let name = if self.env_user.is_empty() { "admin" } else { &self.env_user };
        let name_lower = name.to_lowercase();
        let pass_hash = digest_password(&self.env_pass);

        if let Some(user) = doc.users.iter_mut().find(|u| u.name_lower == name_lower) {
            if user.name != name {
                user.name = name.to_string();
                *changed = true;
            }
            if user.source != UserSource::Env {
                user.source = UserSource::Env;
                *changed = true;
            }
            if user.password_hash != pass_hash {
                user.password_hash = pass_hash;
                *changed = true;
            }
            return user.id.clone();
        }

        let taken: HashSet<String> = doc.users.iter().map(|u| u.id.clone()).collect();
        let id = unique_user_id(&slug_id(&name_lower), &taken);
        doc.users.insert(
            0,
            UserAccount {
                id: id.clone(),
                name: name.to_string(),
                name_lower,
                password_hash: pass_hash,
                created_at_ms: now,
                source: UserSource::Env,
            },
        );
        *changed = true;
        id
    }
}

/// Run the lock release after the guarded body; a body error wins over a
/// release (compromise) error.
fn finish<T>(result: Result<T>, guard: DocumentLock) -> Result<T> {
    match result {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(e) => {
            let _ = guard.release();
            Err(e)
        }
    }
}

/// Atomic persist: write a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, doc: &Document) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn digest_password(pass: &str) -> String {
    let digest = Sha256::digest(pass.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn slug_id(name_lower: &str) -> String {
    let slug: String = name_lower
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "user_admin".into()
    } else {
        format!("user_{slug}")
    }
}

fn unique_user_id(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut i = 2;
    loop {
        let candidate = format!("{base}_{i}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

/// Per-element lenient user parsing: rows missing required fields are
/// dropped, duplicate lowercased names keep the first occurrence.
fn valid_users(raw: Option<&Value>, now: i64) -> Vec<UserAccount> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let Some(map) = item.as_object() else { continue };
        let id = str_field(map, "id");
        let name = str_field(map, "name");
        let password_hash = str_field(map, "password_hash");
        if id.is_empty() || name.is_empty() || password_hash.is_empty() {
            continue;
        }
        let name_lower = {
            let given = str_field(map, "name_lower").to_lowercase();
            if given.is_empty() { name.to_lowercase() } else { given }
        };
        if !seen.insert(name_lower.clone()) {
            continue;
        }
        let created_at_ms = map
            .get("created_at_ms")
            .and_then(Value::as_i64)
            .filter(|v| *v > 0)
            .unwrap_or(now);
        let source = match map.get("source").and_then(Value::as_str) {
            Some("register") => UserSource::Register,
            _ => UserSource::Env,
        };
        out.push(UserAccount {
            id,
            name,
            name_lower,
            password_hash,
            created_at_ms,
            source,
        });
    }
    out
}

fn str_field(map: &serde_json::Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

fn valid_wa_map(raw: Option<&Value>) -> std::collections::BTreeMap<String, WaStatus> {
    let Some(Value::Object(map)) = raw else {
        return Default::default();
    };
    let mut out = std::collections::BTreeMap::new();
    for (user_id, value) in map {
        let id = user_id.trim();
        if id.is_empty() {
            continue;
        }
        if let Ok(status) = serde_json::from_value::<WaStatus>(value.clone()) {
            out.insert(id.to_string(), status);
        }
    }
    out
}

/// Typed per-element parse; malformed rows are dropped.
fn valid_array<T: serde::de::DeserializeOwned>(raw: Option<&Value>) -> Vec<T> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

fn valid_log(raw: Option<&Value>) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = valid_array(raw);
    entries.retain(|e| !e.kind.trim().is_empty());
    entries
}
