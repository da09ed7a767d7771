//! Database models split into domain-specific modules.

pub mod booking;
pub mod client;
pub mod plan;
pub mod service;
pub mod sms;
pub mod stats;
pub mod user;
pub mod work_shift;

pub use booking::*;
pub use client::*;
pub use plan::*;
pub use service::*;
pub use sms::*;
pub use stats::*;
pub use user::*;
pub use work_shift::*;
