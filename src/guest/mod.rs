//! The guest side of the bridge: a small binary, run inside the WSL distro
//! by the host shim, that speaks the wire protocol over its stdin/stdout and
//! backs each watch with a recursive [`watcher::Watcher`].

pub mod agent;
pub mod watcher;
