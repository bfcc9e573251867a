/// Descriptor numbers of the standard streams.
pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;

/// Largest payload the edge stage accepts by default (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Bits per byte above which a payload is considered obfuscated.
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 7.0;

/// Human label for a descriptor number.
pub fn fd_label(fd: i32) -> String {
    match fd {
        STDIN_FD => "stdin".into(),
        STDOUT_FD => "stdout".into(),
        STDERR_FD => "stderr".into(),
        n => format!("fd {n}"),
    }
}

/// `true` for 0, 1 and 2.
pub fn is_stdio(fd: i32) -> bool {
    (STDIN_FD..=STDERR_FD).contains(&fd)
}
