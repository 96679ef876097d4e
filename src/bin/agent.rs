//! Entry point for the guest-side helper launched by the host shim inside
//! the target distro. Speaks the length-prefixed protocol on stdin/stdout
//! and drives one recursive inotify watch per directory the host asks for.

#[cfg(unix)]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(err) = wsl_fs_notify::guest::agent::run() {
        log::error!("agent exited: {}", err);
        std::process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("wsl-fs-notify-agent only runs inside a Linux guest");
    std::process::exit(1);
}
