use log::error;

/// A user-facing error toast.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Fire-and-forget toast service.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log instead of showing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        error!("{}", notice.message);
    }
}
