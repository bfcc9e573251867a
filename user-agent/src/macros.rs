/// Logs a line tagged with a component name, which becomes the record target.
/// Usage:
/// ```rust
/// use log::Level;
/// agent::tap_log!(Level::Info, "capture", "attached to pid {}", 4242);
/// ```
/// With the binary's fern format this renders as:
/// [2025-04-25T16:32:10+02:00][INFO ][stdiotap::capture][pid=4568][tid=ThreadId(3)] attached to pid 4242
#[macro_export]
macro_rules! tap_log {
    ($level:expr, $component:literal, $fmt:literal $(, $($arg:tt)+)?) => {
        log::log!(
            target: concat!("stdiotap::", $component),
            $level,
            $fmt
            $(, $($arg)+)?
        )
    };
}

#[cfg(test)]
mod tests {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::Mutex;

    /// A tiny in-memory logger that captures up to DEBUG.
    struct MemoryLogger {
        buffer: Mutex<String>,
    }

    impl MemoryLogger {
        const fn new() -> Self {
            MemoryLogger { buffer: Mutex::new(String::new()) }
        }

        fn take(&self) -> String {
            std::mem::take(&mut *self.buffer.lock().unwrap())
        }
    }

    static LOGGER: MemoryLogger = MemoryLogger::new();

    impl Log for MemoryLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Debug
        }
        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) && record.target().starts_with("stdiotap::macro") {
                let mut buf = self.buffer.lock().unwrap();
                buf.push_str(&format!("[{}][{}] {}\n", record.level(), record.target(), record.args()));
            }
        }
        fn flush(&self) {}
    }

    #[test]
    fn tap_log_tags_the_component() {
        // other tests may have installed a logger first; ours only needs to be present once
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Debug);
        LOGGER.take();

        crate::tap_log!(Level::Debug, "macro-test", "Answer={}!", 42);
        crate::tap_log!(Level::Info, "macro-test", "plain");

        let output = LOGGER.take();
        assert!(output.contains("[DEBUG][stdiotap::macro-test] Answer=42!"), "got: {}", output);
        assert!(output.contains("[INFO][stdiotap::macro-test] plain"), "got: {}", output);
    }
}
