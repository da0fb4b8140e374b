//! The polling worker loop.
//!
//! One tick per second: read the document, dispatch every active job.
//! Per job the protocol is decide under lock, act outside the lock,
//! record under lock; the record step re-checks the job is still active
//! so a concurrent cancel is never overwritten. Failures inside one
//! job's processing are recorded on that job and never abort the tick
//! for the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wacast_core::error::{Result, WacastError};
use wacast_core::jid::{normalize_number, number_to_jid};
use wacast_core::time::now_ms;
use wacast_core::traits::Messenger;
use wacast_core::types::{
    Audience, Block, ConnStatus, Job, JobPayload, JobStatus, PendingSend, PendingStage,
    WaitingReply,
};

use crate::claim::{ClaimedWork, FlowAction, StatusSend};
use crate::flow::{compute_retry_decision, matches_wait_reply};
use crate::phase::{Phase, active_window_end, compute_next_retry, determine_phase};
use crate::runtime::WorkerRuntime;

/// Protocol error fragments indicating a corrupted session rather than a
/// transient delivery failure.
const DESYNC_SIGNATURES: &[&str] = &[
    "prekeyerror",
    "invalid prekey id",
    "no senderkeyrecord found for decryption",
];

/// Run the worker loop forever. Overlapping ticks are skipped, not
/// queued; skips are logged at most once per guard interval.
pub async fn run(runtime: Arc<WorkerRuntime>) {
    if let Err(e) = runtime.store.ensure_exists() {
        tracing::error!("cannot prepare data directory: {e}");
        return;
    }
    tracing::info!("worker loop started");

    let mut interval =
        tokio::time::interval(Duration::from_millis(runtime.config.tick_interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !runtime.try_begin_tick() {
            if runtime.should_log_guard(now_ms()) {
                tracing::warn!("previous tick still running, skipping");
            }
            continue;
        }
        let rt = Arc::clone(&runtime);
        tokio::spawn(async move {
            tick(&rt).await;
            rt.end_tick();
        });
    }
}

/// One pass over the document: connect missing messengers, dispatch all
/// active jobs concurrently, wait for their decide/act/record sequences.
pub async fn tick(runtime: &Arc<WorkerRuntime>) {
    let doc = match runtime.store.read().await {
        Ok(doc) => doc,
        Err(e) if e.is_store_busy() => {
            if runtime.should_log_busy(now_ms()) {
                tracing::warn!("document busy, tick skipped: {e}");
            }
            return;
        }
        Err(e) => {
            tracing::error!("tick read failed: {e}");
            return;
        }
    };

    let user_ids: Vec<String> = doc.users.iter().map(|u| u.id.clone()).collect();
    runtime.sync_messengers(&user_ids);

    let mut handles = Vec::new();
    for job in doc.jobs.into_iter().filter(Job::is_active) {
        if !runtime.try_begin_job(&job.user_id, &job.id) {
            continue;
        }
        let rt = Arc::clone(runtime);
        handles.push(tokio::spawn(async move {
            let user_id = job.user_id.clone();
            let job_id = job.id.clone();
            if let Err(e) = process_job(&rt, job).await {
                tracing::warn!(job = %job_id, "job processing failed: {e}");
            }
            rt.end_job(&user_id, &job_id);
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn process_job(runtime: &Arc<WorkerRuntime>, job: Job) -> Result<()> {
    match job.payload {
        JobPayload::StatusBroadcast { .. } => process_status_job(runtime, job).await,
        JobPayload::MessageFlow { .. } => process_flow_job(runtime, job).await,
    }
}

// ---------------------------------------------------------------------
// Status broadcasts
// ---------------------------------------------------------------------

async fn process_status_job(runtime: &Arc<WorkerRuntime>, job: Job) -> Result<()> {
    let now = now_ms();
    let JobPayload::StatusBroadcast { window, .. } = &job.payload else {
        return Ok(());
    };

    match determine_phase(window, now) {
        Phase::NotYet => Ok(()),
        Phase::Expired => expire_status_job(runtime, &job).await,
        Phase::Cooldown => {
            let window2_start = window.window2_start_ms;
            if job.next_retry_at_ms == Some(window2_start) {
                return Ok(());
            }
            runtime
                .store
                .update(|doc| {
                    if let Some(j) = doc.find_job_mut(&job.id, &job.user_id) {
                        if j.is_active() {
                            j.next_retry_at_ms = Some(window2_start);
                        }
                    }
                    Ok(())
                })
                .await?;
            Ok(())
        }
        Phase::Window1 | Phase::Window2 => {
            if job.next_retry_at_ms.is_some_and(|due| now < due) {
                return Ok(());
            }

            // Decide: claim the attempt inside the lock.
            let mut claim: Option<ClaimedWork<StatusSend>> = None;
            runtime
                .store
                .update(|doc| {
                    let Some(j) = doc.find_job_mut(&job.id, &job.user_id) else {
                        return Ok(());
                    };
                    if !j.is_active() {
                        return Ok(());
                    }
                    let now = now_ms();
                    if j.next_retry_at_ms.is_some_and(|due| now < due) {
                        return Ok(());
                    }
                    let JobPayload::StatusBroadcast { window, media, caption, audience } =
                        &j.payload
                    else {
                        return Ok(());
                    };
                    let Some(window_end_ms) = active_window_end(window, now) else {
                        return Ok(());
                    };
                    claim = Some(ClaimedWork {
                        job_id: j.id.clone(),
                        user_id: j.user_id.clone(),
                        work: StatusSend {
                            media: media.clone(),
                            caption: caption.clone(),
                            audience: audience.clone(),
                            window_end_ms,
                        },
                    });
                    j.status = JobStatus::Running;
                    j.attempt_count += 1;
                    j.last_attempt_at_ms = Some(now);
                    j.next_retry_at_ms = None;
                    Ok(())
                })
                .await?;
            let Some(claim) = claim else { return Ok(()) };

            // Act: the slow network call, with the lock released.
            let outcome = attempt_status_send(runtime, &claim).await;

            // Record: write the result back under the lock.
            record_status_outcome(runtime, &claim, outcome).await
        }
    }
}

async fn expire_status_job(runtime: &Arc<WorkerRuntime>, job: &Job) -> Result<()> {
    let mut cancelled = false;
    runtime
        .store
        .update(|doc| {
            let Some(j) = doc.find_job_mut(&job.id, &job.user_id) else {
                return Ok(());
            };
            if !j.is_active() {
                return Ok(());
            }
            let now = now_ms();
            j.status = JobStatus::Cancel;
            j.last_error = Some("delivery window expired".into());
            j.finished_at_ms = Some(now);
            j.next_retry_at_ms = None;
            cancelled = true;
            runtime.store.gc_job_media(doc, &job.id);
            Ok(())
        })
        .await?;

    if cancelled {
        tracing::info!(job = %job.id, "status job expired past its delivery windows");
        runtime
            .store
            .append_log(
                "job_cancelled",
                json!({ "job_id": job.id, "reason": "window_expired" }),
                Some(&job.user_id),
            )
            .await?;
    }
    Ok(())
}

async fn attempt_status_send(
    runtime: &Arc<WorkerRuntime>,
    claim: &ClaimedWork<StatusSend>,
) -> Result<()> {
    let messenger = runtime.messenger_for(&claim.user_id)?;
    let audience_jids = resolve_audience(&messenger, &claim.work.audience).await?;
    messenger
        .send_status_broadcast(
            &claim.work.media,
            claim.work.caption.as_deref(),
            &audience_jids,
        )
        .await
}

async fn record_status_outcome(
    runtime: &Arc<WorkerRuntime>,
    claim: &ClaimedWork<StatusSend>,
    outcome: Result<()>,
) -> Result<()> {
    match outcome {
        Ok(()) => {
            runtime
                .store
                .update(|doc| {
                    let Some(j) = doc.find_job_mut(&claim.job_id, &claim.user_id) else {
                        return Ok(());
                    };
                    if !j.is_active() {
                        // Cancelled while the send was in flight.
                        return Ok(());
                    }
                    j.succeed(now_ms());
                    runtime.store.gc_job_media(doc, &claim.job_id);
                    Ok(())
                })
                .await?;
            tracing::info!(job = %claim.job_id, "status broadcast delivered");
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            // Malformed job data never gets better with retries.
            let terminal = matches!(e, WacastError::InvalidJob(_));
            let retry_interval = runtime.config.status_retry_interval_ms;
            let window_end = claim.work.window_end_ms;

            runtime
                .store
                .update(|doc| {
                    let Some(j) = doc.find_job_mut(&claim.job_id, &claim.user_id) else {
                        return Ok(());
                    };
                    if !j.is_active() {
                        return Ok(());
                    }
                    let now = now_ms();
                    if terminal {
                        j.fail_terminal(message.clone(), now);
                    } else {
                        j.status = JobStatus::Failed;
                        j.last_error = Some(message.clone());
                        j.next_retry_at_ms = compute_next_retry(now, window_end, retry_interval);
                    }
                    Ok(())
                })
                .await?;

            tracing::warn!(job = %claim.job_id, "status broadcast failed: {message}");
            runtime
                .store
                .append_log(
                    "status_send_failed",
                    json!({ "job_id": claim.job_id, "error": message }),
                    Some(&claim.user_id),
                )
                .await?;
            maybe_flag_desync(runtime, &claim.user_id, &message).await;
            Ok(())
        }
    }
}

async fn resolve_audience(
    messenger: &Arc<dyn Messenger>,
    audience: &Audience,
) -> Result<Vec<String>> {
    match audience {
        Audience::MyContacts => messenger.list_contact_jids().await,
        Audience::MyContactsExcluded { numbers } => {
            let excluded: HashSet<String> = numbers
                .iter()
                .filter_map(|n| normalize_number(n))
                .map(|n| number_to_jid(&n))
                .collect();
            let contacts = messenger.list_contact_jids().await?;
            Ok(contacts
                .into_iter()
                .filter(|jid| !excluded.contains(jid))
                .collect())
        }
        Audience::OnlyShareWith { numbers } => {
            let mut seen = HashSet::new();
            let jids: Vec<String> = numbers
                .iter()
                .filter_map(|n| normalize_number(n))
                .map(|n| number_to_jid(&n))
                .filter(|jid| seen.insert(jid.clone()))
                .collect();
            if jids.is_empty() {
                return Err(WacastError::InvalidJob(
                    "audience has no valid recipients".into(),
                ));
            }
            Ok(jids)
        }
    }
}

// ---------------------------------------------------------------------
// Message flows
// ---------------------------------------------------------------------

async fn process_flow_job(runtime: &Arc<WorkerRuntime>, job: Job) -> Result<()> {
    let now = now_ms();
    if job.status == JobStatus::Queued && now < job.target_ms {
        return Ok(());
    }
    // A failed flow job stays failed; only status jobs get window retries.
    if job.status == JobStatus::Failed {
        return Ok(());
    }

    let wait_timeout = runtime.config.wait_reply_timeout_ms;
    let mut action: Option<ClaimedWork<FlowAction>> = None;
    let mut timed_out = false;

    // Decide: one pass over the progress cursor, inside the lock.
    runtime
        .store
        .update(|doc| {
            let Some(j) = doc.find_job_mut(&job.id, &job.user_id) else {
                return Ok(());
            };
            if !j.is_active() || j.status == JobStatus::Failed {
                return Ok(());
            }
            let now = now_ms();
            if j.status == JobStatus::Queued {
                if now < j.target_ms {
                    return Ok(());
                }
                j.status = JobStatus::Running;
                j.last_attempt_at_ms = Some(now);
            }

            let destination = j
                .as_flow()
                .map(|f| f.destination.clone())
                .unwrap_or_default();
            let Some(number) = normalize_number(&destination) else {
                j.fail_terminal("invalid destination number", now);
                return Ok(());
            };
            let jid = number_to_jid(&number);
            let Some(snapshot) = j.as_flow().cloned() else {
                return Ok(());
            };
            let progress = &snapshot.progress;

            let decided = if let Some(wait) = &progress.waiting_reply {
                if now > wait.timeout_at_ms {
                    j.fail_terminal("wait reply timed out", now);
                    if let Some(flow) = j.as_flow_mut() {
                        flow.progress.waiting_reply = None;
                    }
                    timed_out = true;
                    FlowAction::Idle
                } else {
                    FlowAction::CheckReply { jid, wait: wait.clone() }
                }
            } else if let Some(pending) = &progress.pending_send {
                if pending.next_retry_at_ms.is_some_and(|due| now < due) {
                    FlowAction::Idle
                } else {
                    match pending.stage {
                        PendingStage::Initial => FlowAction::Send {
                            stage: PendingStage::Initial,
                            block_index: None,
                            jid,
                            text: snapshot.initial_text.clone(),
                            media: snapshot.media.clone(),
                        },
                        PendingStage::Block => {
                            let index = pending.block_index.unwrap_or(usize::MAX);
                            match snapshot.blocks.get(index) {
                                Some(Block::Send { text, .. }) => FlowAction::Send {
                                    stage: PendingStage::Block,
                                    block_index: Some(index),
                                    jid,
                                    text: text.clone(),
                                    media: None,
                                },
                                _ => {
                                    j.fail_terminal("pending send references an invalid block", now);
                                    FlowAction::Idle
                                }
                            }
                        }
                    }
                }
            } else if j.next_retry_at_ms.is_some_and(|due| now < due) {
                // An earlier delay block is still running down.
                FlowAction::Idle
            } else if !progress.initial_sent {
                if let Some(flow) = j.as_flow_mut() {
                    flow.progress.pending_send = Some(PendingSend {
                        stage: PendingStage::Initial,
                        block_index: None,
                        retry_count: 0,
                        next_retry_at_ms: None,
                        last_error: None,
                    });
                }
                FlowAction::Send {
                    stage: PendingStage::Initial,
                    block_index: None,
                    jid,
                    text: snapshot.initial_text.clone(),
                    media: snapshot.media.clone(),
                }
            } else {
                let index = progress.next_block_index;
                match snapshot.blocks.get(index) {
                    None => {
                        j.succeed(now);
                        runtime.store.gc_job_media(doc, &job.id);
                        FlowAction::Idle
                    }
                    Some(Block::Delay { duration, .. }) => {
                        let delay_ms = duration.to_ms();
                        if delay_ms <= 0 {
                            j.fail_terminal("delay must be greater than zero", now);
                        } else {
                            j.next_retry_at_ms = Some(now + delay_ms);
                            if let Some(flow) = j.as_flow_mut() {
                                flow.progress.next_block_index = index + 1;
                            }
                        }
                        FlowAction::Idle
                    }
                    Some(Block::WaitReply { mode, expected_text, .. }) => {
                        let wait = WaitingReply {
                            mode: *mode,
                            expected_text: expected_text.clone(),
                            started_at_ms: now,
                            timeout_at_ms: now + wait_timeout,
                            block_index: index,
                        };
                        if let Some(flow) = j.as_flow_mut() {
                            flow.progress.waiting_reply = Some(wait);
                        }
                        FlowAction::Idle
                    }
                    Some(Block::Send { text, .. }) => {
                        if let Some(flow) = j.as_flow_mut() {
                            flow.progress.pending_send = Some(PendingSend {
                                stage: PendingStage::Block,
                                block_index: Some(index),
                                retry_count: 0,
                                next_retry_at_ms: None,
                                last_error: None,
                            });
                        }
                        FlowAction::Send {
                            stage: PendingStage::Block,
                            block_index: Some(index),
                            jid,
                            text: text.clone(),
                            media: None,
                        }
                    }
                }
            };

            action = Some(ClaimedWork {
                job_id: job.id.clone(),
                user_id: job.user_id.clone(),
                work: decided,
            });
            Ok(())
        })
        .await?;

    if timed_out {
        runtime
            .store
            .append_log(
                "wait_reply_timeout",
                json!({ "job_id": job.id }),
                Some(&job.user_id),
            )
            .await?;
    }
    let Some(claim) = action else { return Ok(()) };

    match claim.work.clone() {
        FlowAction::Idle => Ok(()),
        FlowAction::Send { stage, block_index, jid, text, media } => {
            let outcome = match runtime.messenger_for(&claim.user_id) {
                Ok(messenger) => {
                    messenger
                        .send_direct_message(&jid, &text, media.as_ref())
                        .await
                }
                Err(e) => Err(e),
            };
            record_flow_send(runtime, &claim, stage, block_index, outcome).await
        }
        FlowAction::CheckReply { jid, wait } => {
            // No messenger means no inbox to poll; try again next tick.
            let Ok(messenger) = runtime.messenger_for(&claim.user_id) else {
                return Ok(());
            };
            let matched = messenger
                .incoming_since(&jid, wait.started_at_ms)
                .into_iter()
                .find(|reply| matches_wait_reply(&reply.text, &wait));
            match matched {
                Some(reply) => record_reply_match(runtime, &claim, &wait, &reply.text).await,
                None => Ok(()),
            }
        }
    }
}

async fn record_flow_send(
    runtime: &Arc<WorkerRuntime>,
    claim: &ClaimedWork<FlowAction>,
    stage: PendingStage,
    block_index: Option<usize>,
    outcome: Result<()>,
) -> Result<()> {
    match outcome {
        Ok(()) => {
            runtime
                .store
                .update(|doc| {
                    let Some(j) = doc.find_job_mut(&claim.job_id, &claim.user_id) else {
                        return Ok(());
                    };
                    if !j.is_active() {
                        return Ok(());
                    }
                    j.next_retry_at_ms = None;
                    if let Some(flow) = j.as_flow_mut() {
                        flow.progress.pending_send = None;
                        match stage {
                            PendingStage::Initial => flow.progress.initial_sent = true,
                            PendingStage::Block => {
                                if let Some(index) = block_index {
                                    flow.progress.next_block_index = index + 1;
                                }
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            let interval = runtime.config.flow_retry_interval_ms;
            let max_attempts = runtime.config.flow_max_attempts;

            runtime
                .store
                .update(|doc| {
                    let Some(j) = doc.find_job_mut(&claim.job_id, &claim.user_id) else {
                        return Ok(());
                    };
                    if !j.is_active() {
                        return Ok(());
                    }
                    let now = now_ms();
                    let retry_count = j
                        .as_flow()
                        .and_then(|f| f.progress.pending_send.as_ref())
                        .map(|p| p.retry_count)
                        .unwrap_or(0);
                    let decision =
                        compute_retry_decision(retry_count, now, interval, max_attempts);
                    if decision.can_continue {
                        if let Some(pending) =
                            j.as_flow_mut().and_then(|f| f.progress.pending_send.as_mut())
                        {
                            pending.retry_count = decision.new_retry_count;
                            pending.next_retry_at_ms = decision.next_retry_at_ms;
                            pending.last_error = Some(message.clone());
                        }
                        j.last_error = Some(message.clone());
                    } else {
                        if let Some(flow) = j.as_flow_mut() {
                            flow.progress.pending_send = None;
                        }
                        j.fail_terminal(
                            format!("send failed after {} attempts: {message}", decision.new_retry_count),
                            now,
                        );
                    }
                    Ok(())
                })
                .await?;

            tracing::warn!(job = %claim.job_id, "flow send failed: {message}");
            runtime
                .store
                .append_log(
                    "message_send_failed",
                    json!({ "job_id": claim.job_id, "error": message }),
                    Some(&claim.user_id),
                )
                .await?;
            maybe_flag_desync(runtime, &claim.user_id, &message).await;
            Ok(())
        }
    }
}

async fn record_reply_match(
    runtime: &Arc<WorkerRuntime>,
    claim: &ClaimedWork<FlowAction>,
    wait: &WaitingReply,
    reply_text: &str,
) -> Result<()> {
    let started_at = wait.started_at_ms;
    let block_index = wait.block_index;
    runtime
        .store
        .update(|doc| {
            let Some(j) = doc.find_job_mut(&claim.job_id, &claim.user_id) else {
                return Ok(());
            };
            if !j.is_active() {
                return Ok(());
            }
            let now = now_ms();
            if let Some(flow) = j.as_flow_mut() {
                // Only clear the exact wait we polled against.
                let same_wait = flow
                    .progress
                    .waiting_reply
                    .as_ref()
                    .is_some_and(|w| {
                        w.started_at_ms == started_at && w.block_index == block_index
                    });
                if same_wait {
                    flow.progress.waiting_reply = None;
                    flow.progress.next_block_index = block_index + 1;
                    flow.progress.last_reply_match_ms = Some(now);
                }
            }
            Ok(())
        })
        .await?;
    tracing::debug!(job = %claim.job_id, "wait satisfied by reply: {reply_text}");
    Ok(())
}

// ---------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------

fn is_desync_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    DESYNC_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

/// Flag a user's session for re-authentication on a desync signature,
/// rate-limited per user.
async fn maybe_flag_desync(runtime: &Arc<WorkerRuntime>, user_id: &str, message: &str) {
    if !is_desync_error(message) {
        return;
    }
    let now = now_ms();
    if !runtime.should_flag_desync(user_id, now) {
        return;
    }
    tracing::warn!(user = %user_id, "session desync detected, flagging for reconnect");

    let uid = user_id.to_string();
    let result = runtime
        .store
        .update(move |doc| {
            if let Some(wa) = doc.wa_by_user.get_mut(&uid) {
                wa.status = ConnStatus::Connecting;
                wa.note = Some("session desync detected, reconnect required".into());
                wa.last_update_ms = now;
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        tracing::warn!("could not flag desync: {e}");
        return;
    }
    let _ = runtime
        .store
        .append_log("session_desync", json!({ "error": message }), Some(user_id))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use wacast_core::config::{LockConfig, WorkerConfig};
    use wacast_core::time::build_delivery_window;
    use wacast_core::traits::MessengerFactory;
    use wacast_core::types::{
        DeliveryWindow, FlowProgress, IncomingReply, MediaInfo, MediaKind, MessageFlow,
        ReplyMode, SmallDuration,
    };
    use wacast_store::DurableStore;

    struct MockMessenger {
        fail_with: Mutex<Option<String>>,
        replies: Mutex<Vec<IncomingReply>>,
        sent: Mutex<Vec<String>>,
        // When set, cancels the job in the store while the send is in
        // flight, modelling a concurrent cancel from the HTTP layer.
        cancel_on_send: Mutex<Option<(DurableStore, String, String)>>,
    }

    impl MockMessenger {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(None),
                replies: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                cancel_on_send: Mutex::new(None),
            })
        }

        fn fail_next_with(&self, message: &str) {
            *self.fail_with.lock().unwrap() = Some(message.to_string());
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        async fn run_cancel_hook(&self) {
            let hook = self.cancel_on_send.lock().unwrap().take();
            if let Some((store, job_id, user_id)) = hook {
                store
                    .update(|doc| {
                        if let Some(j) = doc.find_job_mut(&job_id, &user_id) {
                            j.status = JobStatus::Cancel;
                            j.finished_at_ms = Some(now_ms());
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        }

        fn take_failure(&self) -> Option<String> {
            self.fail_with.lock().unwrap().take()
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_status_broadcast(
            &self,
            _media: &MediaInfo,
            caption: Option<&str>,
            _audience_jids: &[String],
        ) -> Result<()> {
            self.run_cancel_hook().await;
            if let Some(message) = self.take_failure() {
                return Err(WacastError::Channel(message));
            }
            self.sent
                .lock()
                .unwrap()
                .push(format!("status:{}", caption.unwrap_or("")));
            Ok(())
        }

        async fn send_direct_message(
            &self,
            jid: &str,
            text: &str,
            _media: Option<&MediaInfo>,
        ) -> Result<()> {
            self.run_cancel_hook().await;
            if let Some(message) = self.take_failure() {
                return Err(WacastError::Channel(message));
            }
            self.sent.lock().unwrap().push(format!("{jid}:{text}"));
            Ok(())
        }

        async fn list_contact_jids(&self) -> Result<Vec<String>> {
            Ok(vec!["628110000001@s.whatsapp.net".into()])
        }

        fn incoming_since(&self, jid: &str, since_ms: i64) -> Vec<IncomingReply> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.jid == jid && r.at_ms >= since_ms)
                .cloned()
                .collect()
        }

        fn connection_status(&self) -> ConnStatus {
            ConnStatus::Connected
        }
    }

    struct MockFactory(Arc<MockMessenger>);

    #[async_trait]
    impl MessengerFactory for MockFactory {
        async fn connect(&self, _user_id: &str) -> Result<Arc<dyn Messenger>> {
            Ok(self.0.clone())
        }
    }

    async fn test_runtime(name: &str) -> (Arc<WorkerRuntime>, Arc<MockMessenger>, String) {
        let dir = std::env::temp_dir().join(format!("wacast-worker-{}-{}", name, uuid::Uuid::new_v4()));
        let store = DurableStore::with_paths(dir, LockConfig::default(), "admin", "admin123");
        let messenger = MockMessenger::new();
        let runtime = WorkerRuntime::new(
            store,
            WorkerConfig::default(),
            Arc::new(MockFactory(messenger.clone())),
        );
        let doc = runtime.store.read().await.unwrap();
        let user_id = doc.users[0].id.clone();
        runtime.insert_messenger(&user_id, messenger.clone());
        (runtime, messenger, user_id)
    }

    fn media() -> MediaInfo {
        MediaInfo {
            original_name: "promo.jpg".into(),
            relative_path: "media/promo.jpg".into(),
            mime: "image/jpeg".into(),
            kind: MediaKind::Photo,
            size_bytes: 3,
        }
    }

    fn status_job(id: &str, user_id: &str, window: DeliveryWindow) -> Job {
        Job {
            id: id.into(),
            user_id: user_id.into(),
            created_at_ms: now_ms(),
            target_ms: window.window1_start_ms,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_attempt_at_ms: None,
            next_retry_at_ms: None,
            last_error: None,
            finished_at_ms: None,
            payload: JobPayload::StatusBroadcast {
                window,
                media: media(),
                caption: Some("hello".into()),
                audience: Audience::MyContacts,
            },
        }
    }

    fn flow_job(id: &str, user_id: &str, blocks: Vec<Block>, progress: FlowProgress) -> Job {
        Job {
            id: id.into(),
            user_id: user_id.into(),
            created_at_ms: now_ms(),
            target_ms: now_ms() - 1_000,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_attempt_at_ms: None,
            next_retry_at_ms: None,
            last_error: None,
            finished_at_ms: None,
            payload: JobPayload::MessageFlow {
                flow: MessageFlow {
                    destination: "628120001111".into(),
                    initial_text: "hi there".into(),
                    media: None,
                    blocks,
                    progress,
                },
            },
        }
    }

    async fn insert_job(runtime: &Arc<WorkerRuntime>, job: Job) {
        runtime
            .store
            .update(move |doc| {
                doc.jobs.push(job);
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn get_job(runtime: &Arc<WorkerRuntime>, id: &str, user_id: &str) -> Job {
        runtime
            .store
            .read()
            .await
            .unwrap()
            .find_job(id, user_id)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_success_in_window_one() {
        let (runtime, messenger, user_id) = test_runtime("status-ok").await;
        let now = now_ms();
        let job = status_job("job-1", &user_id, build_delivery_window(now - 1_000));
        insert_job(&runtime, job.clone()).await;

        process_status_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Success);
        assert_eq!(after.next_retry_at_ms, None);
        assert_eq!(after.attempt_count, 1);
        assert!(after.finished_at_ms.is_some());
        assert_eq!(messenger.sent_texts(), vec!["status:hello"]);
    }

    #[tokio::test]
    async fn test_status_failure_schedules_in_window_retry() {
        let (runtime, messenger, user_id) = test_runtime("status-retry").await;
        let now = now_ms();
        let job = status_job("job-1", &user_id, build_delivery_window(now - 1_000));
        insert_job(&runtime, job.clone()).await;
        messenger.fail_next_with("network down");

        process_status_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.last_error.as_deref(), Some("channel error: network down"));
        let retry = after.next_retry_at_ms.unwrap();
        assert!(retry >= now + 15_000 && retry <= now + 20_000, "retry at {retry}");

        let doc = runtime.store.read().await.unwrap();
        assert!(doc.log.iter().any(|e| e.kind == "status_send_failed"));
    }

    #[tokio::test]
    async fn test_status_failure_near_window_end_defers_to_cooldown() {
        let (runtime, messenger, user_id) = test_runtime("status-defer").await;
        let now = now_ms();
        // Window 1 ends in 5s; the 15s retry interval does not fit.
        let window = DeliveryWindow {
            window1_start_ms: now - 60_000,
            window1_end_ms: now + 5_000,
            window2_start_ms: now + 600_000,
            window2_end_ms: now + 720_000,
        };
        let job = status_job("job-1", &user_id, window);
        insert_job(&runtime, job.clone()).await;
        messenger.fail_next_with("network down");

        process_status_job(&runtime, job).await.unwrap();

        // No in-window retry fits; the cooldown pass will park the job
        // at window 2's start later.
        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.next_retry_at_ms, None);
    }

    #[tokio::test]
    async fn test_cooldown_parks_retry_at_window_two_start() {
        let (runtime, _messenger, user_id) = test_runtime("cooldown").await;
        let now = now_ms();
        let window = DeliveryWindow {
            window1_start_ms: now - 300_000,
            window1_end_ms: now - 180_000,
            window2_start_ms: now + 300_000,
            window2_end_ms: now + 420_000,
        };
        let mut job = status_job("job-1", &user_id, window);
        job.status = JobStatus::Failed;
        insert_job(&runtime, job.clone()).await;

        process_status_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.next_retry_at_ms, Some(window.window2_start_ms));
        assert_eq!(after.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_expired_job_is_cancelled_and_media_removed() {
        let (runtime, _messenger, user_id) = test_runtime("expired").await;
        let now = now_ms();
        let job = status_job("job-1", &user_id, build_delivery_window(now - 3_600_000));
        insert_job(&runtime, job.clone()).await;

        let media_path = runtime.store.resolve_relative("media/promo.jpg");
        std::fs::create_dir_all(media_path.parent().unwrap()).unwrap();
        std::fs::write(&media_path, b"jpg").unwrap();

        process_status_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Cancel);
        assert_eq!(after.last_error.as_deref(), Some("delivery window expired"));
        assert!(!media_path.exists());

        let doc = runtime.store.read().await.unwrap();
        assert!(doc.log.iter().any(|e| e.kind == "job_cancelled"));
    }

    #[tokio::test]
    async fn test_zero_delay_block_fails_terminally() {
        let (runtime, _messenger, user_id) = test_runtime("zero-delay").await;
        let progress = FlowProgress {
            initial_sent: true,
            ..FlowProgress::default()
        };
        let job = flow_job(
            "job-1",
            &user_id,
            vec![Block::Delay {
                id: "b1".into(),
                duration: SmallDuration::default(),
            }],
            progress,
        );
        insert_job(&runtime, job.clone()).await;

        process_flow_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(
            after.last_error.as_deref(),
            Some("delay must be greater than zero")
        );
    }

    #[tokio::test]
    async fn test_concurrent_cancel_is_never_overwritten() {
        let (runtime, messenger, user_id) = test_runtime("cancel-race").await;
        let now = now_ms();
        let job = status_job("job-1", &user_id, build_delivery_window(now - 1_000));
        insert_job(&runtime, job.clone()).await;

        // The cancel lands while the send is in flight.
        *messenger.cancel_on_send.lock().unwrap() = Some((
            runtime.store.clone(),
            "job-1".into(),
            user_id.clone(),
        ));

        process_status_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Cancel, "record step must not revive a cancelled job");
    }

    #[tokio::test]
    async fn test_flow_runs_initial_wait_send_to_completion() {
        let (runtime, messenger, user_id) = test_runtime("flow-full").await;
        let blocks = vec![
            Block::WaitReply {
                id: "b1".into(),
                mode: ReplyMode::Exact,
                expected_text: Some("Yes".into()),
            },
            Block::Send {
                id: "b2".into(),
                text: "thanks!".into(),
            },
        ];
        let job = flow_job("job-1", &user_id, blocks, FlowProgress::default());
        insert_job(&runtime, job).await;

        let tick_once = |rt: Arc<WorkerRuntime>, uid: String| async move {
            let job = get_job(&rt, "job-1", &uid).await;
            process_flow_job(&rt, job).await.unwrap();
        };

        // Tick 1: initial message goes out.
        tick_once(runtime.clone(), user_id.clone()).await;
        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.as_flow().unwrap().progress.initial_sent);

        // Tick 2: wait block arms.
        tick_once(runtime.clone(), user_id.clone()).await;
        let after = get_job(&runtime, "job-1", &user_id).await;
        let wait = after.as_flow().unwrap().progress.waiting_reply.clone().unwrap();
        assert_eq!(wait.block_index, 0);

        // Tick 3: no reply yet, wait holds.
        tick_once(runtime.clone(), user_id.clone()).await;
        let after = get_job(&runtime, "job-1", &user_id).await;
        assert!(after.as_flow().unwrap().progress.waiting_reply.is_some());

        // The reply arrives.
        messenger.replies.lock().unwrap().push(IncomingReply {
            jid: "628120001111@s.whatsapp.net".into(),
            text: "  yes  ".into(),
            at_ms: now_ms(),
        });

        // Tick 4: reply matches, wait clears.
        tick_once(runtime.clone(), user_id.clone()).await;
        let after = get_job(&runtime, "job-1", &user_id).await;
        let progress = &after.as_flow().unwrap().progress;
        assert!(progress.waiting_reply.is_none());
        assert_eq!(progress.next_block_index, 1);
        assert!(progress.last_reply_match_ms.is_some());

        // Tick 5: the follow-up message goes out.
        tick_once(runtime.clone(), user_id.clone()).await;
        // Tick 6: no blocks left, the job completes.
        tick_once(runtime.clone(), user_id.clone()).await;

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Success);
        assert_eq!(
            messenger.sent_texts(),
            vec![
                "628120001111@s.whatsapp.net:hi there",
                "628120001111@s.whatsapp.net:thanks!"
            ]
        );
    }

    #[tokio::test]
    async fn test_flow_send_retries_then_fails_terminally() {
        let (runtime, messenger, user_id) = test_runtime("flow-exhaust").await;
        let job = flow_job("job-1", &user_id, Vec::new(), FlowProgress::default());
        insert_job(&runtime, job).await;

        for attempt in 0..3 {
            messenger.fail_next_with("socket closed");
            let mut job = get_job(&runtime, "job-1", &user_id).await;
            // Force the retry due so each pass attempts a send.
            if attempt > 0 {
                runtime
                    .store
                    .update(|doc| {
                        if let Some(j) = doc.find_job_mut("job-1", &user_id) {
                            if let Some(p) =
                                j.as_flow_mut().and_then(|f| f.progress.pending_send.as_mut())
                            {
                                p.next_retry_at_ms = Some(now_ms() - 1);
                            }
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
                job = get_job(&runtime, "job-1", &user_id).await;
            }
            process_flow_job(&runtime, job).await.unwrap();
        }

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert!(after.last_error.as_deref().unwrap().contains("after 3 attempts"));
        assert!(after.as_flow().unwrap().progress.pending_send.is_none());
    }

    #[tokio::test]
    async fn test_pending_send_with_invalid_block_fails_terminally() {
        let (runtime, messenger, user_id) = test_runtime("bad-pending").await;
        // A stored cursor pointing past the block list (e.g. the job was
        // edited by hand) must fail the job, not panic or loop.
        let progress = FlowProgress {
            initial_sent: true,
            pending_send: Some(PendingSend {
                stage: PendingStage::Block,
                block_index: Some(5),
                retry_count: 0,
                next_retry_at_ms: None,
                last_error: None,
            }),
            ..FlowProgress::default()
        };
        let mut job = flow_job("job-1", &user_id, Vec::new(), progress);
        job.status = JobStatus::Running;
        insert_job(&runtime, job.clone()).await;

        process_flow_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(
            after.last_error.as_deref(),
            Some("pending send references an invalid block")
        );
        assert!(messenger.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_wait_reply_timeout_fails_job() {
        let (runtime, _messenger, user_id) = test_runtime("wait-timeout").await;
        let now = now_ms();
        let progress = FlowProgress {
            initial_sent: true,
            waiting_reply: Some(WaitingReply {
                mode: ReplyMode::Any,
                expected_text: None,
                started_at_ms: now - 90_000_000,
                timeout_at_ms: now - 3_600_000,
                block_index: 0,
            }),
            ..FlowProgress::default()
        };
        let mut job = flow_job("job-1", &user_id, Vec::new(), progress);
        job.status = JobStatus::Running;
        insert_job(&runtime, job.clone()).await;

        process_flow_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.last_error.as_deref(), Some("wait reply timed out"));
        assert!(after.as_flow().unwrap().progress.waiting_reply.is_none());

        let doc = runtime.store.read().await.unwrap();
        assert!(doc.log.iter().any(|e| e.kind == "wait_reply_timeout"));
    }

    #[tokio::test]
    async fn test_invalid_destination_fails_terminally() {
        let (runtime, _messenger, user_id) = test_runtime("bad-dest").await;
        let mut job = flow_job("job-1", &user_id, Vec::new(), FlowProgress::default());
        if let Some(flow) = job.as_flow_mut() {
            flow.destination = "12".into();
        }
        insert_job(&runtime, job.clone()).await;

        process_flow_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.last_error.as_deref(), Some("invalid destination number"));
    }

    #[tokio::test]
    async fn test_desync_signature_flags_user_session() {
        let (runtime, messenger, user_id) = test_runtime("desync").await;
        let now = now_ms();
        let job = status_job("job-1", &user_id, build_delivery_window(now - 1_000));
        insert_job(&runtime, job.clone()).await;
        messenger.fail_next_with("PreKeyError: Invalid PreKey ID");

        process_status_job(&runtime, job).await.unwrap();

        let doc = runtime.store.read().await.unwrap();
        let wa = doc.wa_by_user.get(&user_id).unwrap();
        assert_eq!(wa.status, ConnStatus::Connecting);
        assert!(wa.note.as_deref().unwrap().contains("desync"));
        assert!(doc.log.iter().any(|e| e.kind == "session_desync"));
    }

    #[tokio::test]
    async fn test_queued_flow_waits_for_target_time() {
        let (runtime, messenger, user_id) = test_runtime("flow-early").await;
        let mut job = flow_job("job-1", &user_id, Vec::new(), FlowProgress::default());
        job.target_ms = now_ms() + 3_600_000;
        insert_job(&runtime, job.clone()).await;

        process_flow_job(&runtime, job).await.unwrap();

        let after = get_job(&runtime, "job-1", &user_id).await;
        assert_eq!(after.status, JobStatus::Queued);
        assert!(messenger.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_shared_media_survives_gc() {
        let (runtime, _messenger, user_id) = test_runtime("gc-shared").await;
        let now = now_ms();
        // Two jobs referencing the same media; one expires.
        let expired = status_job("job-1", &user_id, build_delivery_window(now - 3_600_000));
        let live = status_job("job-2", &user_id, build_delivery_window(now + 3_600_000));
        insert_job(&runtime, expired.clone()).await;
        insert_job(&runtime, live).await;

        let media_path = runtime.store.resolve_relative("media/promo.jpg");
        std::fs::create_dir_all(media_path.parent().unwrap()).unwrap();
        std::fs::write(&media_path, b"jpg").unwrap();

        process_status_job(&runtime, expired).await.unwrap();

        assert_eq!(
            get_job(&runtime, "job-1", &user_id).await.status,
            JobStatus::Cancel
        );
        assert!(media_path.exists(), "media still referenced by an active job");
    }
}
