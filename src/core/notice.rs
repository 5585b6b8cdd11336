//! Operator-facing messages produced by the debugging engine.

/// Kind of notice, decides the console prefix and color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Thread,
    Module,
    Warning,
    Error,
    /// Event or exception the engine has no handler for
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Info, text)
    }

    pub fn thread(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Thread, text)
    }

    pub fn module(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Module, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Error, text)
    }

    pub fn unknown(text: impl Into<String>) -> Self {
        Self::new(NoticeKind::Unknown, text)
    }
}
