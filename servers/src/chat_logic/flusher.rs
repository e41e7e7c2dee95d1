//! Flush scheduler: periodically drains the pending write buffer into one
//! durable batch insert.
//!
//! The drain is atomic with respect to concurrent accepts: messages
//! arriving during the store call land in a fresh buffer. The store call
//! itself runs without the state lock held. On failure the snapshot goes
//! back to the front of the buffer verbatim and is retried on the next
//! tick, indefinitely; the failure is logged and never surfaced to any
//! client. A final drain runs on graceful shutdown.

use super::state::AppState;
use lib_common::{Message, MessageId};
use tokio::sync::broadcast;
use tokio::time::interval;

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = interval(state.policy.flush_interval);
    // The first tick of a tokio interval fires immediately; with an empty
    // buffer that is a no-op.
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Flush scheduler received shutdown signal, draining once.");
                flush_once(&state).await;
                break;
            }
            _ = tick.tick() => {
                flush_once(&state).await;
            }
        }
    }
}

/// One flush cycle: snapshot-and-clear, write, apply durable identities.
/// Public so shutdown paths and tests can drive it directly.
pub async fn flush_once(state: &AppState) {
    // Step 1: snapshot and clear atomically. The buffer holds tokens; the
    // batch is built from the *current* cache state, so edits, deletes and
    // reactions applied since accept are what gets written.
    let (tokens, batch) = {
        let mut st = state.lock().await;
        let tokens = st.buffer.drain_all();
        if tokens.is_empty() {
            return;
        }
        let batch: Vec<Message> = tokens
            .iter()
            .filter_map(|token| {
                st.cache
                    .get(&MessageId::Provisional(token.clone()))
                    .cloned()
            })
            .collect();
        (tokens, batch)
    };

    // Step 2: the store call runs with the lock released.
    match state.store.insert_batch(&batch).await {
        Ok(assigned) => {
            apply_assignments(state, &batch, &assigned).await;
            log::info!("Flushed {} messages to the durable store", assigned.len());
        }
        Err(e) => {
            log::warn!(
                "Durable flush of {} messages failed, will retry next tick: {}",
                tokens.len(),
                e
            );
            let mut st = state.lock().await;
            st.buffer.requeue_front(tokens);
        }
    }
}

/// Step 3: re-acquire the lock, swap provisional identities for durable
/// keys, and pick up anything that changed while the batch was in flight.
async fn apply_assignments(state: &AppState, batch: &[Message], assigned: &[(String, i64)]) {
    let (followups, reports) = {
        let mut st = state.lock().await;
        let mut followups = Vec::new();

        for (token, key) in assigned {
            st.cache.assign_durable(token, *key);
            // A mutation that raced the store call is only in the cache;
            // the written row is already stale. Last write wins, so push
            // the current state as an update.
            let snapshot = batch
                .iter()
                .find(|m| m.id.as_provisional() == Some(token));
            if let (Some(snapshot), Some(current)) =
                (snapshot, st.cache.get(&MessageId::Durable(*key)))
            {
                let changed = current.edited_at != snapshot.edited_at
                    || current.deleted != snapshot.deleted
                    || current.reactions != snapshot.reactions
                    || current.report_count != snapshot.report_count;
                if changed {
                    followups.push((*key, current.clone()));
                }
            }
        }

        // Reports filed before the message had a durable key can be
        // forwarded now.
        let mut ready = Vec::new();
        st.pending_reports.retain(|record| {
            let durable = match &record.message_id {
                MessageId::Durable(key) => Some(*key),
                MessageId::Provisional(token) => assigned
                    .iter()
                    .find(|(t, _)| t == token)
                    .map(|(_, key)| *key),
            };
            match durable {
                Some(key) => {
                    let mut record = record.clone();
                    record.message_id = MessageId::Durable(key);
                    ready.push(record);
                    false
                }
                None => true,
            }
        });

        (followups, ready)
    };

    for (key, current) in followups {
        if let Err(e) = state.store.update(key, &current).await {
            log::warn!("Post-flush reconciliation of message #{} failed: {}", key, e);
        }
    }
    for record in reports {
        if let Err(e) = state.store.insert_report(&record).await {
            log::warn!("Deferred report forwarding failed: {}", e);
        }
    }
}
