//! Services module for fieldops-service.

pub mod activity;
pub mod conversion;
pub mod database;
pub mod documents;
pub mod lifecycle;
pub mod line_items;
pub mod memory_store;
pub mod metrics;
pub mod notifier;
pub mod store;
pub mod totals;
pub mod transitions;
pub mod webhooks;

pub use activity::ActivityRecorder;
pub use conversion::{Conversion, ConversionCoordinator};
pub use database::Database;
pub use documents::DocumentService;
pub use lifecycle::LifecycleService;
pub use line_items::LineItemEditor;
pub use memory_store::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{LogNotifier, Notifier};
pub use store::{Expected, JobUpdate, Store};
pub use transitions::StatusTransitionValidator;
pub use webhooks::{HandlerRegistry, WebhookEventProcessor};
