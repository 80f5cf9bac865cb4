use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Asynchronous signals the checkout widget emits. `OrderCompleted` is
/// authoritative intent; the two closed variants are the explicit closure
/// channel, which the widget does not always deliver reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetEvent {
    OrderCompleted,
    PopupClosed,
    CheckoutClosed,
}

/// Session descriptor pushed into the widget before opening checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub user_id: String,
    pub email: Option<String>,
    pub product_path: String,
    pub quantity: u32,
}

/// Imperative surface of the third-party checkout widget.
///
/// The real widget lives in an embedded browser context outside this
/// crate; the engine only ever talks to it through this port.
#[async_trait]
pub trait CheckoutWidget: Send + Sync {
    /// Whether the widget's client library has finished loading.
    fn is_ready(&self) -> bool;

    /// Clear any cart state left over from a previous attempt.
    async fn reset_session(&self);

    async fn push_session(&self, session: &CheckoutSession);

    async fn open_checkout(&self);

    /// Subscribe to the widget's event stream for the duration of one
    /// attempt. Each detector takes its own subscription.
    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent>;
}

pub type DynCheckoutWidget = Arc<dyn CheckoutWidget>;

/// What a probe of the widget's rendering surface found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// No surface matching the widget's id/origin heuristics is in the tree.
    NotFound,
    Attached { visible: bool },
}

impl SurfaceStatus {
    pub fn is_showing(&self) -> bool {
        matches!(self, SurfaceStatus::Attached { visible: true })
    }
}

/// Finds the widget's rendering surface. The id/src-pattern heuristics and
/// any cross-frame access attempts are isolated behind this port so the
/// watcher logic stays testable.
#[async_trait]
pub trait SurfaceLocator: Send + Sync {
    async fn probe(&self) -> SurfaceStatus;

    /// Resolves when the observed subtree reports a change. The watcher
    /// races this against its poll interval, so implementations without
    /// change notification can simply pend forever.
    async fn changed(&self) {
        std::future::pending::<()>().await
    }
}

pub type DynSurfaceLocator = Arc<dyn SurfaceLocator>;

/// Locator for hosts where the widget renders out-of-process and no
/// surface is reachable; the closure fallback then stays disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSurfaceLocator;

#[async_trait]
impl SurfaceLocator for NoSurfaceLocator {
    async fn probe(&self) -> SurfaceStatus {
        SurfaceStatus::NotFound
    }
}
