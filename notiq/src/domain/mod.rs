//! Domain types.

pub mod notification;

pub use notification::{NewNotification, Notification, Priority, STATUS_PENDING};
