//! Smoke-test harness: drives the credits engine through one confirmed
//! and one abandoned purchase against a scripted in-process widget and an
//! in-memory backend, with tracing output for each transition.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::broadcast, time::sleep};
use tracing::info;

use quillia_credits::{
    find_package, BalanceSnapshot, CheckoutSession, CheckoutWidget, CreditsApi, CreditsConfig,
    CreditsEngine, NoSurfaceLocator, WidgetEvent,
};

struct SimApi {
    credits: AtomicU64,
}

#[async_trait]
impl CreditsApi for SimApi {
    async fn fetch_balance(&self) -> quillia_credits::Result<BalanceSnapshot> {
        Ok(BalanceSnapshot {
            credits: self.credits.load(Ordering::SeqCst),
            is_low: false,
            fetched_at: Utc::now(),
        })
    }

    async fn notify_checkout_started(&self, package_key: &str) -> quillia_credits::Result<()> {
        info!(package_key, "audit: checkout started");
        Ok(())
    }

    async fn notify_checkout_completed(&self, package_key: &str) -> quillia_credits::Result<()> {
        info!(package_key, "audit: checkout completed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SimOutcome {
    /// Buyer pays: credits post after the delay, then the widget reports
    /// order-complete.
    Complete { grant: u64, after: Duration },
    /// Buyer closes the popup without paying.
    Close { after: Duration },
}

struct SimWidget {
    api: Arc<SimApi>,
    events: broadcast::Sender<WidgetEvent>,
    script: Mutex<VecDeque<SimOutcome>>,
}

impl SimWidget {
    fn new(api: Arc<SimApi>, script: Vec<SimOutcome>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            api,
            events,
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl CheckoutWidget for SimWidget {
    fn is_ready(&self) -> bool {
        true
    }

    async fn reset_session(&self) {}

    async fn push_session(&self, session: &CheckoutSession) {
        info!(product = %session.product_path, user = %session.user_id, "session pushed");
    }

    async fn open_checkout(&self) {
        let Some(outcome) = self.script.lock().unwrap().pop_front() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let events = self.events.clone();
        tokio::spawn(async move {
            match outcome {
                SimOutcome::Complete { grant, after } => {
                    sleep(after).await;
                    api.credits.fetch_add(grant, Ordering::SeqCst);
                    let _ = events.send(WidgetEvent::OrderCompleted);
                }
                SimOutcome::Close { after } => {
                    sleep(after).await;
                    let _ = events.send(WidgetEvent::PopupClosed);
                }
            }
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = CreditsConfig {
        user_id: "sim-user".to_owned(),
        ..CreditsConfig::default()
    };
    let novice = find_package("novice-sack").context("seed catalog should have novice-sack")?;

    let api = Arc::new(SimApi {
        credits: AtomicU64::new(150),
    });
    let widget = SimWidget::new(
        Arc::clone(&api),
        vec![
            SimOutcome::Complete {
                grant: novice.credits,
                after: Duration::from_millis(1_200),
            },
            SimOutcome::Close {
                after: Duration::from_millis(800),
            },
        ],
    );

    let (updates_tx, updates_rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for update in updates_rx.iter() {
            info!(?update, "credits update");
        }
    });

    let engine = CreditsEngine::new(
        config,
        api,
        widget,
        Arc::new(NoSurfaceLocator),
        updates_tx,
    );
    let mut view = engine.view();

    engine.refresh_balance().await?;
    info!(credits = engine.current_view().credits, "seeded balance");

    engine.begin_purchase(novice.key).await?;
    view.wait_for(|view| !view.purchase_in_flight).await?;
    info!(
        credits = engine.current_view().credits,
        "first purchase settled"
    );

    engine.begin_purchase("adventurer-chest").await?;
    view.wait_for(|view| !view.purchase_in_flight).await?;
    info!(
        credits = engine.current_view().credits,
        "second purchase settled"
    );

    engine.shutdown().await;
    Ok(())
}
