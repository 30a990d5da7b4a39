//! Logging initialization: `env_logger` configured from `log_level`,
//! matching the line-oriented, no-rotation logging the teacher's own
//! `logger_config` falls back to outside its file-rotation path. Log
//! rotation itself is out of scope here (the spec explicitly excludes it)
//! so this module is intentionally a single `init` call, not a subsystem.

use once_cell::sync::OnceCell;
use std::io::Write;

static INIT: OnceCell<()> = OnceCell::new();

/// Idempotent: a second call (e.g. from a test harness that also boots the
/// server) is a no-op instead of panicking on a double `env_logger::init`.
pub fn init(level: &str) {
    if INIT.get().is_some() {
        return;
    }
    let mut builder = env_logger::Builder::new();
    builder
        .parse_filters(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
    let _ = INIT.set(());
}
