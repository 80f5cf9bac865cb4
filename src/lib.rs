//! Client-side credit purchase reconciliation for Quillia.
//!
//! A purchase runs through a third-party checkout popup whose signals are
//! unreliable, so three independent detectors race: the widget's own
//! completion/closure events, a watcher over the widget's rendering
//! surface, and a poller over the backend balance. One reconcile loop
//! merges them into a single outcome per attempt and owns every piece of
//! observable state the UI renders from.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod signals;
pub mod widget;
mod workers;

pub use backend::{BalanceSnapshot, CreditsApi, DynCreditsApi, HttpCreditsApi};
pub use catalog::{all_packages, find_package, CreditPackage};
pub use config::CreditsConfig;
pub use error::{CreditsError, Result};
pub use events::{CreditsUpdate, CreditsView, PurchaseOutcome};
pub use reconciler::CreditsEngine;
pub use widget::{
    CheckoutSession, CheckoutWidget, DynCheckoutWidget, DynSurfaceLocator, NoSurfaceLocator,
    SurfaceLocator, SurfaceStatus, WidgetEvent,
};
