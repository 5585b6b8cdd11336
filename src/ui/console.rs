//! Console output of engine notices.

use colored::{ColoredString, Colorize};

use crate::core::notice::{Notice, NoticeKind};

/// Colored prefix for a notice kind
pub fn prefix(kind: NoticeKind) -> ColoredString {
    match kind {
        NoticeKind::Info => "[*]".cyan(),
        NoticeKind::Thread => "[+]".blue(),
        NoticeKind::Module => "[+]".magenta(),
        NoticeKind::Warning => "[!]".yellow(),
        NoticeKind::Error => "[!]".red(),
        NoticeKind::Unknown => "[?]".dimmed(),
    }
}

pub fn format(notice: &Notice) -> String {
    format!("{} {}", prefix(notice.kind), notice.text)
}

/// Default notice sink: print to stdout and mirror to the log
pub fn emit(notice: &Notice) {
    match notice.kind {
        NoticeKind::Warning => log::warn!("{}", notice.text),
        NoticeKind::Error => log::error!("{}", notice.text),
        _ => log::debug!("{}", notice.text),
    }
    println!("{}", format(notice));
}
