//! Background sweepers: entry expiry, queue lease recovery, and the
//! optional metrics flush. Each owns one timer and is idempotent on error;
//! a failed sweep is logged and counted, never fatal.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tidekv::store::Kv;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConfigLoad;

pub fn spawn_sweepers(
    kv: Kv,
    cfg: Arc<ConfigLoad>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(spawn_loop(
        "expiry sweep",
        Duration::from_millis(cfg.sweep_interval_ms()),
        shutdown.clone(),
        {
            let kv = kv.clone();
            move || match kv.sweep_expired() {
                Ok(0) => {}
                Ok(swept) => debug!("expiry sweep removed {} entries", swept),
                Err(err) => {
                    kv.metrics.record_error("sweep_expired");
                    error!("expiry sweep failed: {}", err);
                }
            }
        },
    ));

    handles.push(spawn_loop(
        "lease recovery",
        Duration::from_millis(cfg.lease_sweep_interval_ms()),
        shutdown.clone(),
        {
            let kv = kv.clone();
            move || {
                if let Err(err) = kv.recover_leases() {
                    kv.metrics.record_error("recover_leases");
                    error!("queue lease recovery failed: {}", err);
                }
            }
        },
    ));

    if cfg.metrics_persist() {
        handles.push(spawn_loop(
            "metrics flush",
            Duration::from_millis(cfg.metrics_flush_interval_ms()),
            shutdown,
            {
                let kv = kv.clone();
                move || {
                    if let Err(err) = kv.flush_metrics() {
                        error!("metrics flush failed: {}", err);
                    }
                }
            },
        ));
    }

    handles
}

fn spawn_loop(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("{} sweeper running every {:?}", name, interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => tick(),
                _ = shutdown.changed() => {
                    debug!("{} sweeper stopping", name);
                    return;
                }
            }
        }
    })
}
