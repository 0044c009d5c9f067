//! Database models, one file per table group.

pub mod feed_event;
pub mod push_notification;
pub mod user;

pub use self::feed_event::*;
pub use self::push_notification::*;
pub use self::user::*;
