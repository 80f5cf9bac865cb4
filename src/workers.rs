use std::time::Duration;

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::{
    backend::DynCreditsApi,
    signals::PurchaseSignal,
    widget::{DynSurfaceLocator, WidgetEvent},
};

/// Timing knobs for the surface fallback watcher, lifted out of
/// `CreditsConfig` so the watcher stays free of config plumbing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SurfaceWatchTiming {
    pub poll_interval: Duration,
    pub discovery_retry: Duration,
    pub deadline: Duration,
}

/// Waits for the widget's explicit order-complete signal and emits
/// `Completed` once, then unsubscribes itself.
pub(crate) fn spawn_completion_listener(
    mut events: broadcast::Receiver<WidgetEvent>,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WidgetEvent::OrderCompleted) => {
                    if tx.send(PurchaseSignal::Completed).is_err() {
                        warn!("reconciler receiver dropped; stopping completion listener");
                    }
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "completion listener lagged behind widget events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Channel A of closure detection: the widget's own popup/checkout-closed
/// events.
pub(crate) fn spawn_closure_listener(
    mut events: broadcast::Receiver<WidgetEvent>,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WidgetEvent::PopupClosed) | Ok(WidgetEvent::CheckoutClosed) => {
                    if tx.send(PurchaseSignal::Closed).is_err() {
                        warn!("reconciler receiver dropped; stopping closure listener");
                    }
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "closure listener lagged behind widget events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Channel B of closure detection: watch the widget's rendering surface
/// and infer closure when it detaches or goes hidden. Races a
/// change-notification wait against a poll fallback, and self-terminates
/// at its own deadline so probing never leaks across attempts.
pub(crate) fn spawn_surface_watcher(
    locator: DynSurfaceLocator,
    timing: SurfaceWatchTiming,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_surface_watch(locator, timing, tx).await;
    })
}

async fn run_surface_watch(
    locator: DynSurfaceLocator,
    timing: SurfaceWatchTiming,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) {
    let deadline = Instant::now() + timing.deadline;

    // Discovery: the popup may still be rendering in. One retry, then the
    // fallback stays disabled for this attempt rather than guessing.
    let mut status = locator.probe().await;
    if !status.is_showing() {
        tokio::select! {
            _ = sleep_until(deadline) => return,
            _ = sleep(timing.discovery_retry) => {}
        }
        status = locator.probe().await;
        if !status.is_showing() {
            debug!("widget surface not found; closure fallback disabled for this attempt");
            return;
        }
    }

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                debug!("surface watcher reached its deadline; stopping");
                return;
            }
            _ = sleep(timing.poll_interval) => {}
            _ = locator.changed() => {}
        }
        status = locator.probe().await;
        if !status.is_showing() {
            if tx.send(PurchaseSignal::Closed).is_err() {
                warn!("reconciler receiver dropped; stopping surface watcher");
            }
            return;
        }
    }
}

/// Safety-net success detection: re-fetch the balance on an interval and
/// emit once it rises above the pre-attempt snapshot. Transient fetch
/// failures skip the tick; the reconciler's deadline bounds the task.
pub(crate) fn spawn_balance_poller(
    api: DynCreditsApi,
    balance_before: u64,
    interval: Duration,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            match api.fetch_balance().await {
                Ok(snapshot) if snapshot.credits > balance_before => {
                    if tx
                        .send(PurchaseSignal::BalanceIncreased {
                            credits: snapshot.credits,
                            is_low: snapshot.is_low,
                        })
                        .is_err()
                    {
                        warn!("reconciler receiver dropped; stopping balance poller");
                    }
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(?err, "balance poll failed; retrying next tick");
                }
            }
        }
    })
}

/// Post-completion balance refresh: a short retry ladder instead of an
/// open-ended poll, since funds usually post within seconds of the
/// order-complete signal. Gives up silently after the last rung.
pub(crate) fn spawn_completion_refresh(
    api: DynCreditsApi,
    balance_before: u64,
    delays: Vec<Duration>,
    tx: mpsc::UnboundedSender<PurchaseSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for delay in delays {
            sleep(delay).await;
            match api.fetch_balance().await {
                Ok(snapshot) if snapshot.credits > balance_before => {
                    if tx
                        .send(PurchaseSignal::BalanceIncreased {
                            credits: snapshot.credits,
                            is_low: snapshot.is_low,
                        })
                        .is_err()
                    {
                        warn!("reconciler receiver dropped; stopping completion refresh");
                    }
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(?err, "post-completion refresh failed; trying next rung");
                }
            }
        }
        debug!("post-completion refresh exhausted without observing an increase");
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::{broadcast, mpsc};

    use super::{
        spawn_balance_poller, spawn_closure_listener, spawn_completion_listener,
        spawn_completion_refresh, spawn_surface_watcher, SurfaceWatchTiming,
    };
    use crate::{
        backend::{BalanceSnapshot, CreditsApi},
        error::{CreditsError, Result},
        signals::PurchaseSignal,
        widget::{SurfaceLocator, SurfaceStatus, WidgetEvent},
    };

    struct SequenceApi {
        responses: Mutex<VecDeque<Option<u64>>>,
        exhausted_credits: u64,
    }

    impl SequenceApi {
        fn new(responses: Vec<Option<u64>>, exhausted_credits: u64) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                exhausted_credits,
            })
        }
    }

    #[async_trait]
    impl CreditsApi for SequenceApi {
        async fn fetch_balance(&self) -> Result<BalanceSnapshot> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Some(credits)) => Ok(BalanceSnapshot {
                    credits,
                    is_low: false,
                    fetched_at: Utc::now(),
                }),
                Some(None) => Err(CreditsError::Backend {
                    endpoint: "stub".to_owned(),
                    status: 503,
                }),
                None => Ok(BalanceSnapshot {
                    credits: self.exhausted_credits,
                    is_low: false,
                    fetched_at: Utc::now(),
                }),
            }
        }

        async fn notify_checkout_started(&self, _package_key: &str) -> Result<()> {
            Ok(())
        }

        async fn notify_checkout_completed(&self, _package_key: &str) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedLocator {
        states: Mutex<VecDeque<SurfaceStatus>>,
        resting: SurfaceStatus,
    }

    impl ScriptedLocator {
        fn new(states: Vec<SurfaceStatus>, resting: SurfaceStatus) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states.into()),
                resting,
            })
        }
    }

    #[async_trait]
    impl SurfaceLocator for ScriptedLocator {
        async fn probe(&self) -> SurfaceStatus {
            self.states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.resting)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completion_listener_emits_once_and_ignores_closure_events() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_completion_listener(events_rx, tx);

        events_tx.send(WidgetEvent::PopupClosed).unwrap();
        events_tx.send(WidgetEvent::OrderCompleted).unwrap();

        assert_eq!(rx.recv().await, Some(PurchaseSignal::Completed));
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closure_listener_fires_on_either_closed_event() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_closure_listener(events_rx, tx);

        events_tx.send(WidgetEvent::CheckoutClosed).unwrap();

        assert_eq!(rx.recv().await, Some(PurchaseSignal::Closed));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn poller_emits_after_balance_rises() {
        let api = SequenceApi::new(vec![Some(150), Some(150), Some(250)], 250);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_balance_poller(api, 150, Duration::from_secs(4), tx);

        assert_eq!(
            rx.recv().await,
            Some(PurchaseSignal::BalanceIncreased {
                credits: 250,
                is_low: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poller_survives_transient_fetch_failures() {
        let api = SequenceApi::new(vec![None, None, Some(250)], 250);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_balance_poller(api, 150, Duration::from_secs(4), tx);

        assert_eq!(
            rx.recv().await,
            Some(PurchaseSignal::BalanceIncreased {
                credits: 250,
                is_low: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_ladder_gives_up_after_last_rung() {
        let api = SequenceApi::new(vec![Some(150), Some(150), Some(150)], 150);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_completion_refresh(
            api,
            150,
            vec![
                Duration::from_millis(0),
                Duration::from_secs(2),
                Duration::from_millis(2_500),
            ],
            tx,
        );

        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_ladder_emits_on_first_increase() {
        let api = SequenceApi::new(vec![Some(150), Some(250)], 250);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_completion_refresh(
            api,
            150,
            vec![Duration::from_millis(0), Duration::from_secs(2)],
            tx,
        );

        assert_eq!(
            rx.recv().await,
            Some(PurchaseSignal::BalanceIncreased {
                credits: 250,
                is_low: false
            })
        );
    }

    fn watch_timing() -> SurfaceWatchTiming {
        SurfaceWatchTiming {
            poll_interval: Duration::from_millis(500),
            discovery_retry: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn surface_watcher_reports_closure_when_surface_hides() {
        let locator = ScriptedLocator::new(
            vec![
                SurfaceStatus::Attached { visible: true },
                SurfaceStatus::Attached { visible: true },
                SurfaceStatus::Attached { visible: false },
            ],
            SurfaceStatus::Attached { visible: false },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_surface_watcher(locator, watch_timing(), tx);

        assert_eq!(rx.recv().await, Some(PurchaseSignal::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn surface_watcher_reports_closure_on_detach() {
        let locator = ScriptedLocator::new(
            vec![SurfaceStatus::Attached { visible: true }],
            SurfaceStatus::NotFound,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_surface_watcher(locator, watch_timing(), tx);

        assert_eq!(rx.recv().await, Some(PurchaseSignal::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn surface_watcher_disables_itself_when_surface_never_appears() {
        let locator = ScriptedLocator::new(Vec::new(), SurfaceStatus::NotFound);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_surface_watcher(locator, watch_timing(), tx);

        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn surface_watcher_stops_at_its_deadline_without_signalling() {
        let locator = ScriptedLocator::new(Vec::new(), SurfaceStatus::Attached { visible: true });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_surface_watcher(locator, watch_timing(), tx);

        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
