//! Background loops: catalog resync, promo import, CDEK booking retries,
//! the CDEK token refresher and mute restoration.
//!
//! Every loop awaits its job before the next tick, so a slow run delays the
//! next one instead of overlapping it. All loops stop on the shared
//! shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::PgStore;
use crate::domain::User;
use crate::integrations::cdek::Cdek;
use crate::integrations::collaborators::ChatModerator;
use crate::state::AppState;

const TOKEN_RETRY: Duration = Duration::from_secs(60);

pub struct Schedulers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Schedulers {
    pub fn spawn(state: &AppState) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let schedule = &state.config.schedule;
        let mut handles = Vec::new();

        let sync = state.catalog_sync.clone();
        handles.push(tokio::spawn(every("catalog_sync", schedule.catalog_sync, rx.clone(), move || {
            let sync = sync.clone();
            async move {
                let report = sync.run_once().await?;
                info!(written = report.written(), "catalog sync finished");
                Ok::<_, anyhow::Error>(())
            }
        })));

        let import = state.promo_import.clone();
        handles.push(tokio::spawn(every("promo_import", schedule.promo_import, rx.clone(), move || {
            let import = import.clone();
            async move {
                let report = import.run_once().await?;
                info!(?report, "promo import finished");
                Ok::<_, anyhow::Error>(())
            }
        })));

        let orders = state.orders.clone();
        handles.push(tokio::spawn(every("delivery_retry", schedule.delivery_retry, rx.clone(), move || {
            let orders = orders.clone();
            async move {
                let booked = orders.retry_pending_bookings().await?;
                if booked > 0 {
                    info!(booked, "pending CDEK bookings placed");
                }
                Ok::<_, anyhow::Error>(())
            }
        })));

        handles.push(tokio::spawn(refresh_cdek_token(state.cdek.clone(), rx.clone())));
        handles.push(tokio::spawn(restore_mutes(state.store.clone(), state.moderator.clone(), rx)));

        Self { shutdown, handles }
    }

    /// Signals every loop and waits for them; a panicked loop is logged.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("schedulers stopped");
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs `job` immediately and then once per `period`.
async fn every<F, Fut>(name: &'static str, period: Duration, mut rx: watch::Receiver<bool>, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stopped(&mut rx) => break,
            _ = interval.tick() => {}
        }
        tokio::select! {
            _ = stopped(&mut rx) => break,
            result = job() => {
                if let Err(e) = result {
                    error!(job = name, error = %e, "scheduled run failed");
                }
            }
        }
    }
    info!(job = name, "scheduler loop stopped");
}

/// Keeps the CDEK token warm, refreshing shortly before expiry.
async fn refresh_cdek_token(cdek: Arc<Cdek>, mut rx: watch::Receiver<bool>) {
    if !cdek.is_configured() {
        info!("CDEK is not configured, token refresh disabled");
        return;
    }
    loop {
        let wait = match cdek.refresh_token().await {
            Ok(wait) => wait,
            Err(e) => {
                warn!(error = %e, "CDEK token refresh failed");
                TOKEN_RETRY
            }
        };
        tokio::select! {
            _ = stopped(&mut rx) => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Time left until `until`, zero when it has passed.
pub fn delay_until(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration { (until - now).to_std().unwrap_or(Duration::ZERO) }

/// Loads the mutes still running and schedules one unmute per user.
async fn restore_mutes(store: PgStore, moderator: Arc<dyn ChatModerator>, rx: watch::Receiver<bool>) {
    let users = match store.active_mutes(Utc::now()).await {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "could not load active mutes");
            return;
        }
    };
    info!(count = users.len(), "mute restoration scheduled");
    let timers: Vec<_> = users
        .into_iter()
        .map(|user| tokio::spawn(unmute_at(store.clone(), moderator.clone(), user, rx.clone())))
        .collect();
    futures::future::join_all(timers).await;
}

async fn unmute_at(store: PgStore, moderator: Arc<dyn ChatModerator>, user: User, mut rx: watch::Receiver<bool>) {
    let (Some(until), Some(chat_id)) = (user.muted_until, user.muted_chat_id) else { return };
    tokio::select! {
        _ = stopped(&mut rx) => return,
        _ = tokio::time::sleep(delay_until(until, Utc::now())) => {}
    }
    if let Err(e) = moderator.unmute(chat_id, user.tg_id).await {
        warn!(tg_id = user.tg_id, chat_id, error = %e, "unmute failed");
        return;
    }
    match store.clear_mute(user.tg_id, until).await {
        Ok(true) => info!(tg_id = user.tg_id, chat_id, "mute lifted"),
        Ok(false) => info!(tg_id = user.tg_id, "mute was replaced, left as is"),
        Err(e) => warn!(tg_id = user.tg_id, error = %e, "could not clear mute"),
    }
}
