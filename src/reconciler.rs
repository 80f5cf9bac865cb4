use std::sync::Arc;

use chrono::Utc;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{sleep, sleep_until},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::DynCreditsApi,
    catalog,
    config::CreditsConfig,
    error::{CreditsError, Result},
    events::{CreditsUpdate, CreditsView, PurchaseOutcome},
    signals::{AttemptStatus, PurchaseAttempt, PurchaseSignal},
    widget::{CheckoutSession, DynCheckoutWidget, DynSurfaceLocator},
    workers::{
        spawn_balance_poller, spawn_closure_listener, spawn_completion_listener,
        spawn_completion_refresh, spawn_surface_watcher, SurfaceWatchTiming,
    },
};

/// Client-side credits runtime. Owns the observable view, the update
/// stream, and at most one in-flight purchase attempt at a time.
///
/// All detectors only emit signals; the reconcile loop spawned per
/// attempt is the single writer of attempt status, the in-flight flag,
/// and the cached balance.
pub struct CreditsEngine {
    config: CreditsConfig,
    api: DynCreditsApi,
    widget: DynCheckoutWidget,
    locator: DynSurfaceLocator,
    view_tx: Arc<watch::Sender<CreditsView>>,
    updates_tx: crossbeam_channel::Sender<CreditsUpdate>,
    attempt: Mutex<Option<JoinHandle<()>>>,
}

/// Everything a reconcile loop needs, detached from the engine so the
/// loop task owns its context outright.
struct AttemptCtx {
    config: CreditsConfig,
    api: DynCreditsApi,
    locator: DynSurfaceLocator,
    view_tx: Arc<watch::Sender<CreditsView>>,
    updates_tx: crossbeam_channel::Sender<CreditsUpdate>,
}

#[derive(Default)]
struct AttemptWorkers {
    completion: Option<JoinHandle<()>>,
    closure: Option<JoinHandle<()>>,
    surface: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
}

impl AttemptWorkers {
    fn abort_closure_channels(&mut self) {
        abort_handle(&mut self.closure);
        abort_handle(&mut self.surface);
    }

    fn abort_poller(&mut self) {
        abort_handle(&mut self.poller);
    }

    fn abort_all(&mut self) {
        abort_handle(&mut self.completion);
        abort_handle(&mut self.closure);
        abort_handle(&mut self.surface);
        abort_handle(&mut self.poller);
        abort_handle(&mut self.refresh);
    }
}

fn abort_handle(handle: &mut Option<JoinHandle<()>>) {
    if let Some(task) = handle.take() {
        task.abort();
    }
}

impl CreditsEngine {
    pub fn new(
        config: CreditsConfig,
        api: DynCreditsApi,
        widget: DynCheckoutWidget,
        locator: DynSurfaceLocator,
        updates_tx: crossbeam_channel::Sender<CreditsUpdate>,
    ) -> Self {
        let (view_tx, _view_rx) = watch::channel(CreditsView::default());
        Self {
            config,
            api,
            widget,
            locator,
            view_tx: Arc::new(view_tx),
            updates_tx,
            attempt: Mutex::new(None),
        }
    }

    /// Subscribe to the observable view the UI renders from.
    pub fn view(&self) -> watch::Receiver<CreditsView> {
        self.view_tx.subscribe()
    }

    pub fn current_view(&self) -> CreditsView {
        *self.view_tx.borrow()
    }

    /// Seed or refresh the cached balance outside any purchase flow.
    /// While an attempt is in flight the reconcile loop owns the cached
    /// value, so this only publishes when the engine is idle.
    pub async fn refresh_balance(&self) -> Result<()> {
        let snapshot = self.api.fetch_balance().await?;
        if self.view_tx.borrow().purchase_in_flight {
            debug!("purchase in flight; leaving balance publication to the reconciler");
            return Ok(());
        }
        publish_balance(
            &self.view_tx,
            &self.updates_tx,
            snapshot.credits,
            snapshot.is_low,
        );
        Ok(())
    }

    /// Open the checkout widget for one credit package and start the
    /// reconcile loop for the resulting attempt.
    pub async fn begin_purchase(&self, package_key: &str) -> Result<()> {
        let package = match catalog::require_package(package_key) {
            Ok(package) => package,
            Err(err) => {
                error!(package_key, "rejecting purchase for unknown package");
                let _ = self.updates_tx.send(CreditsUpdate::PurchaseFailed {
                    package_key: package_key.trim().to_owned(),
                    reason: err.to_string(),
                    at: Utc::now(),
                });
                return Err(err);
            }
        };

        let mut slot = self.attempt.lock().await;
        if slot.as_ref().map(|run| !run.is_finished()).unwrap_or(false) {
            if self.view_tx.borrow().purchase_in_flight {
                return Err(CreditsError::PurchaseInFlight);
            }
            // An abandoned attempt whose window is still open (watching
            // for a late completion) is superseded by the fresh attempt.
            if let Some(run) = slot.take() {
                run.abort();
            }
        }

        if !self.widget.is_ready() {
            sleep(self.config.widget_ready_wait()).await;
            if !self.widget.is_ready() {
                warn!("checkout widget not ready after grace wait");
                let _ = self.updates_tx.send(CreditsUpdate::PurchaseFailed {
                    package_key: package.key.to_owned(),
                    reason: CreditsError::WidgetUnavailable.to_string(),
                    at: Utc::now(),
                });
                return Err(CreditsError::WidgetUnavailable);
            }
        }

        // Snapshot before the widget opens; success is only ever inferred
        // from the balance rising above this.
        let balance_before = match self.api.fetch_balance().await {
            Ok(snapshot) => {
                publish_balance(
                    &self.view_tx,
                    &self.updates_tx,
                    snapshot.credits,
                    snapshot.is_low,
                );
                snapshot.credits
            }
            Err(err) => {
                debug!(?err, "pre-checkout balance fetch failed; using cached value");
                self.view_tx.borrow().credits
            }
        };

        // Subscribe before the popup opens so no widget signal can slip
        // between checkout opening and the detectors attaching.
        let events = (self.widget.subscribe(), self.widget.subscribe());

        self.widget.reset_session().await;
        self.widget
            .push_session(&CheckoutSession {
                user_id: self.config.user_id.clone(),
                email: self.config.user_email.clone(),
                product_path: package.product_path.to_owned(),
                quantity: 1,
            })
            .await;
        sleep(self.config.session_settle()).await;
        self.widget.open_checkout().await;

        notify_audit(
            Arc::clone(&self.api),
            AuditLeg::Started,
            package.key.to_owned(),
        );

        let attempt = PurchaseAttempt::new(package.key.to_owned(), balance_before);
        info!(
            package_key = package.key,
            balance_before, "checkout opened; awaiting purchase signals"
        );
        self.view_tx
            .send_modify(|view| view.purchase_in_flight = true);
        let _ = self.updates_tx.send(CreditsUpdate::PurchasePending {
            package_key: package.key.to_owned(),
            at: Utc::now(),
        });

        let ctx = AttemptCtx {
            config: self.config.clone(),
            api: Arc::clone(&self.api),
            locator: Arc::clone(&self.locator),
            view_tx: Arc::clone(&self.view_tx),
            updates_tx: self.updates_tx.clone(),
        };
        *slot = Some(tokio::spawn(run_attempt(ctx, attempt, events)));
        Ok(())
    }

    /// Abort any in-flight attempt and clear the processing flag. For app
    /// teardown; a half-finished purchase is reconciled by the backend.
    pub async fn shutdown(&self) {
        let mut slot = self.attempt.lock().await;
        if let Some(run) = slot.take() {
            run.abort();
        }
        self.view_tx
            .send_modify(|view| view.purchase_in_flight = false);
    }
}

enum AuditLeg {
    Started,
    Completed,
}

/// Audit notifications are fire-and-forget: failures are logged, never
/// surfaced, and never block the purchase flow.
fn notify_audit(api: DynCreditsApi, leg: AuditLeg, package_key: String) {
    tokio::spawn(async move {
        let result = match leg {
            AuditLeg::Started => api.notify_checkout_started(&package_key).await,
            AuditLeg::Completed => api.notify_checkout_completed(&package_key).await,
        };
        if let Err(err) = result {
            warn!(?err, package_key, "checkout audit notification failed");
        }
    });
}

fn publish_balance(
    view_tx: &watch::Sender<CreditsView>,
    updates_tx: &crossbeam_channel::Sender<CreditsUpdate>,
    credits: u64,
    is_low: bool,
) {
    let mut changed = false;
    view_tx.send_modify(|view| {
        if view.credits != credits || view.is_low != is_low {
            view.credits = credits;
            view.is_low = is_low;
            changed = true;
        }
    });
    if changed {
        let _ = updates_tx.send(CreditsUpdate::BalanceChanged {
            credits,
            is_low,
            at: Utc::now(),
        });
    }
}

async fn run_attempt(
    ctx: AttemptCtx,
    mut attempt: PurchaseAttempt,
    events: (
        tokio::sync::broadcast::Receiver<crate::widget::WidgetEvent>,
        tokio::sync::broadcast::Receiver<crate::widget::WidgetEvent>,
    ),
) {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let deadline = attempt.started_at + ctx.config.attempt_deadline();

    let mut workers = AttemptWorkers::default();
    workers.completion = Some(spawn_completion_listener(events.0, signal_tx.clone()));
    workers.closure = Some(spawn_closure_listener(events.1, signal_tx.clone()));
    workers.surface = Some(spawn_surface_watcher(
        Arc::clone(&ctx.locator),
        SurfaceWatchTiming {
            poll_interval: ctx.config.surface_poll_interval(),
            discovery_retry: ctx.config.surface_discovery_retry(),
            deadline: ctx.config.surface_watch_deadline(),
        },
        signal_tx.clone(),
    ));
    workers.poller = Some(spawn_balance_poller(
        Arc::clone(&ctx.api),
        attempt.balance_before,
        ctx.config.balance_poll_interval(),
        signal_tx.clone(),
    ));

    let mut completion_seen = false;

    loop {
        // signal_tx stays alive in this scope, so recv() only yields real
        // producer traffic; the deadline arm is the forced-reset path.
        let signal = tokio::select! {
            signal = signal_rx.recv() => signal.unwrap_or(PurchaseSignal::TimedOut),
            _ = sleep_until(deadline) => PurchaseSignal::TimedOut,
        };

        match signal {
            PurchaseSignal::Completed => {
                if completion_seen || attempt.status == AttemptStatus::Confirmed {
                    debug!("duplicate completion signal ignored");
                    continue;
                }
                completion_seen = true;
                info!(
                    package_key = %attempt.package_key,
                    "order-complete received; refreshing balance"
                );
                // Closure must not double-handle a completing attempt; the
                // status check above stays as the backstop either way.
                workers.abort_closure_channels();
                notify_audit(
                    Arc::clone(&ctx.api),
                    AuditLeg::Completed,
                    attempt.package_key.clone(),
                );
                if attempt.status == AttemptStatus::Abandoned {
                    // Popup was closed before the completion event arrived;
                    // funds may still be about to post, so bring the
                    // processing state back and resume watching the balance.
                    info!("completion after closure; resurrecting processing state");
                    attempt.status = AttemptStatus::AwaitingCompletion;
                    ctx.view_tx
                        .send_modify(|view| view.purchase_in_flight = true);
                    let _ = ctx.updates_tx.send(CreditsUpdate::PurchasePending {
                        package_key: attempt.package_key.clone(),
                        at: Utc::now(),
                    });
                    workers.poller = Some(spawn_balance_poller(
                        Arc::clone(&ctx.api),
                        attempt.balance_before,
                        ctx.config.balance_poll_interval(),
                        signal_tx.clone(),
                    ));
                }
                workers.refresh = Some(spawn_completion_refresh(
                    Arc::clone(&ctx.api),
                    attempt.balance_before,
                    ctx.config.completion_refresh_delays(),
                    signal_tx.clone(),
                ));
            }
            PurchaseSignal::Closed => {
                if completion_seen || !attempt.is_awaiting() {
                    debug!("closure signal ignored; attempt already resolving");
                    continue;
                }
                info!(
                    package_key = %attempt.package_key,
                    "popup closed with no completion; abandoning attempt"
                );
                attempt.status = AttemptStatus::Abandoned;
                workers.abort_closure_channels();
                workers.abort_poller();
                ctx.view_tx
                    .send_modify(|view| view.purchase_in_flight = false);
                let credits = ctx.view_tx.borrow().credits;
                let _ = ctx.updates_tx.send(CreditsUpdate::PurchaseSettled {
                    package_key: attempt.package_key.clone(),
                    outcome: PurchaseOutcome::Abandoned,
                    credits,
                    at: Utc::now(),
                });
                // The loop keeps running until the deadline: a
                // late-arriving completion still wins over this abandon.
            }
            PurchaseSignal::BalanceIncreased { credits, is_low } => {
                if attempt.status == AttemptStatus::Confirmed {
                    debug!("duplicate balance-increase signal ignored");
                    continue;
                }
                info!(
                    credits,
                    package_key = %attempt.package_key,
                    "balance increase observed; purchase confirmed"
                );
                attempt.status = AttemptStatus::Confirmed;
                publish_balance(&ctx.view_tx, &ctx.updates_tx, credits, is_low);
                ctx.view_tx
                    .send_modify(|view| view.purchase_in_flight = false);
                let _ = ctx.updates_tx.send(CreditsUpdate::PurchaseSettled {
                    package_key: attempt.package_key.clone(),
                    outcome: PurchaseOutcome::Confirmed,
                    credits,
                    at: Utc::now(),
                });
                break;
            }
            PurchaseSignal::TimedOut => {
                if attempt.is_awaiting() {
                    warn!(
                        package_key = %attempt.package_key,
                        "no conclusive signal within the attempt deadline; forcing reset"
                    );
                    ctx.view_tx
                        .send_modify(|view| view.purchase_in_flight = false);
                    let credits = ctx.view_tx.borrow().credits;
                    let _ = ctx.updates_tx.send(CreditsUpdate::PurchaseSettled {
                        package_key: attempt.package_key.clone(),
                        outcome: PurchaseOutcome::TimedOut,
                        credits,
                        at: Utc::now(),
                    });
                } else {
                    debug!("attempt window lapsed after abandonment");
                }
                attempt.status = AttemptStatus::Idle;
                break;
            }
        }
    }

    workers.abort_all();
}
