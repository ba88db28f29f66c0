//! User-visible notification sink.
//!
//! The core never renders anything itself. Connection changes, device
//! failures and server-side errors are reported as [`Toast`]s to whatever
//! [`Notifier`] the host application injects.

use crate::error::ChatError;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// One user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Success,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }

    /// Build the toast shown for a recovered error.
    #[must_use]
    pub fn from_error(err: &ChatError) -> Self {
        Self::error(err.user_message())
    }
}

/// Receives user-visible notifications.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, toast: Toast);

    /// Log `err` in full and show its user-facing text.
    fn report(&self, err: &ChatError) {
        warn!("{err}");
        self.notify(Toast::from_error(err));
    }
}

/// Notifier that writes toasts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, toast: Toast) {
        match toast.level {
            ToastLevel::Success | ToastLevel::Info => info!(toast = %toast.message),
            ToastLevel::Warning => warn!(toast = %toast.message),
            ToastLevel::Error => error!(toast = %toast.message),
        }
    }
}
