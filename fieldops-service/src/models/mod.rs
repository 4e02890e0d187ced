pub mod activity;
pub mod common;
pub mod invoice;
pub mod job;
pub mod line_item;
pub mod payment;
pub mod quote;
pub mod webhook_event;

pub use activity::*;
pub use common::*;
pub use invoice::*;
pub use job::*;
pub use line_item::*;
pub use payment::*;
pub use quote::*;
pub use webhook_event::*;
