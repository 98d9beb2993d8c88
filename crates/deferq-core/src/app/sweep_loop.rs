//! SweepLoop - 定期実行と多重起動防止
//!
//! - interval ごとに `ReconciliationSweep::run_once()` を起動
//! - 実行中に次の tick が来たら、その tick はスキップ（run lock を try_lock）
//! - `trigger_now()` で手動実行も同じロックを通る
//! - tick で起動した sweep は JoinSet で保持し、停止時に全て待つ

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::reconcile::{ReconciliationSweep, SweepOutcome, SweepReport};
use crate::observability::metric;
use crate::ports::Clock;

pub struct SweepLoop {
    sweep: Arc<ReconciliationSweep>,
    run_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    run_on_start: bool,
}

impl SweepLoop {
    pub fn new(
        sweep: Arc<ReconciliationSweep>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        run_on_start: bool,
    ) -> Self {
        Self {
            sweep,
            run_lock: Mutex::new(()),
            clock,
            interval,
            run_on_start,
        }
    }

    /// sweep を 1 回実行する。実行中なら SkippedOverlap を返す
    pub async fn trigger_now(&self) -> SweepReport {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous sweep still running, skipping");
            metric::record_sweep_run(SweepOutcome::SkippedOverlap.as_str(), Duration::ZERO);
            return SweepReport::empty(SweepOutcome::SkippedOverlap, self.clock.now());
        };
        self.sweep.run_once().await
    }

    /// バックグラウンドで tick を開始する
    pub fn spawn(self: Arc<Self>) -> SweepLoopHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(tick_loop(Arc::clone(&self), shutdown_rx));
        info!(interval = ?self.interval, run_on_start = self.run_on_start, "sweep loop started");
        SweepLoopHandle {
            shutdown_tx,
            join,
            owner: self,
        }
    }
}

async fn tick_loop(this: Arc<SweepLoop>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(this.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    if !this.run_on_start {
        // 最初の tick は即時に完了する
        ticker.tick().await;
    }

    let mut runs = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // 長い sweep はスキップされた tick として見えるよう別タスクで走らせる
                let run = Arc::clone(&this);
                runs.spawn(async move {
                    run.trigger_now().await;
                });
                while let Some(done) = runs.try_join_next() {
                    if let Err(e) = done {
                        warn!(error = %e, "sweep task failed");
                    }
                }
            }
        }
    }

    while let Some(done) = runs.join_next().await {
        if let Err(e) = done {
            warn!(error = %e, "sweep task failed");
        }
    }
}

pub struct SweepLoopHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    owner: Arc<SweepLoop>,
}

impl SweepLoopHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// tick を止め、起動済みの sweep が全て終わるまで待つ。
    /// `trigger_now()` の手動実行も run lock で待つ
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(error = %e, "sweep loop task failed");
        }
        let _in_progress = self.owner.run_lock.lock().await;
        info!("sweep loop stopped");
    }
}
