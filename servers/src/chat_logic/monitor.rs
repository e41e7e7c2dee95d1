//! Typing-state monitor: a one-second sweep that expires stale typing
//! indicators and broadcasts the updated name list when anything changed.

use super::model::ServerEvent;
use super::state::AppState;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Typing monitor received shutdown signal.");
                break;
            }
            _ = tick.tick() => {
                let expired = {
                    let mut st = state.lock().await;
                    st.registry.sweep_expired(Instant::now())
                };
                if let Some(users) = expired {
                    state.broadcast(ServerEvent::TypingUsers { users });
                }
            }
        }
    }
}
