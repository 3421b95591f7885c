use crate::beszel::client::ApiError;
use crate::beszel::{BeszelApi, StatsSnapshot};
use crate::metrics::Metrics;
use crate::state::{Snapshot, State};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("не удалось получить список систем: {0}")]
    Systems(#[from] ApiError),
}

// Only a failed system listing fails the cycle. The second value counts
// systems whose stats could not be fetched.
pub async fn refresh<A>(api: &A, now_unix: i64) -> Result<(Snapshot, u64), RefreshError>
where
    A: BeszelApi + ?Sized,
{
    let systems = api.list_systems().await?;
    if systems.is_empty() {
        warn!("Beszel не вернул ни одной системы");
        return Ok((Snapshot::empty(now_unix), 0));
    }

    let mut stats = HashMap::with_capacity(systems.len());
    let mut errors = 0_u64;
    for system in &systems {
        let entry = match api.latest_stats(&system.id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(system_id = %system.id, "статистика системы отсутствует");
                StatsSnapshot::default()
            }
            Err(err) => {
                errors += 1;
                warn!(system_id = %system.id, error = %err, "не удалось получить статистику системы");
                StatsSnapshot::default()
            }
        };
        stats.insert(system.id.clone(), entry);
    }

    Ok((
        Snapshot {
            systems,
            stats,
            refreshed_at_unix: now_unix,
        },
        errors,
    ))
}

pub async fn refresh_once<A>(
    api: &A,
    state: &RwLock<State>,
    metrics: &Metrics,
) -> Result<(), RefreshError>
where
    A: BeszelApi + ?Sized,
{
    let now = now_unix();
    let result = refresh(api, now).await;

    let mut guard = state.write().await;
    let outcome = match result {
        Ok((snapshot, stats_errors)) => {
            for _ in 0..stats_errors {
                metrics.inc_fetch_error("stats");
            }
            let systems = snapshot.systems.len();
            let added = guard.publish(snapshot, now);
            metrics.inc_refresh("success");
            info!(systems, new_entities = added, "данные Beszel обновлены");
            Ok(())
        }
        Err(err) => {
            metrics.inc_fetch_error("systems");
            metrics.inc_refresh("failure");
            error!(error = %err, "цикл обновления завершился ошибкой");
            guard.record_failure(err.to_string(), now);
            Err(err)
        }
    };
    metrics.update_from_state(&guard);
    outcome
}

pub async fn run<A>(
    api: Arc<A>,
    state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    A: BeszelApi + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки цикла обновления");
                break;
            }
            _ = ticker.tick() => {
                // the error is already logged and recorded in the state
                let _ = refresh_once(api.as_ref(), &state, &metrics).await;
            }
        }
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
