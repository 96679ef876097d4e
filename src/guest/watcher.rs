//! The guest-side recursive watch engine (C3): one [`Watcher`] per host
//! watch request, maintaining a live tree of [`Directory`] nodes under
//! inotify.
//!
//! A `Watcher` is driven entirely by its owner (see [`crate::guest::agent`]):
//! construction installs the root watch, `drain_queue` runs the recursive
//! scan/rescan algorithm, and `process_events` drains raw inotify events.
//! None of this module performs I/O beyond inotify syscalls; events destined
//! for the host are appended to a caller-supplied `Vec<EventRecord>` so the
//! engine stays free of framing/transport concerns and is unit-testable
//! without a pipe.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

use crate::protocol::{Action, DirectoryId, EventRecord};

/// Strong, owning reference to a tree node.
pub type DirRef = Rc<RefCell<Directory>>;
/// Non-owning reference to a tree node (parent back-pointers, `by_wd`).
pub type WeakDirRef = Weak<RefCell<Directory>>;

/// A node of the recursive watch tree.
///
/// Parent-to-child ownership is strong (`children`); child-to-parent and the
/// `by_wd` index are weak, so the tree has no reference cycles: dropping a
/// Directory out of its parent's `children` is what ultimately frees it (see
/// [`detach_subtree`], which additionally tears down its inotify watch
/// before that happens).
pub struct Directory {
    /// `None` once torn down (the "`-1`" state in the original design).
    pub wd: Option<WatchDescriptor>,
    /// `""` for the root.
    pub name: String,
    pub parent: Option<WeakDirRef>,
    pub children: Vec<DirRef>,
    pub fail_cnt: u32,
    pub move_cookie: u64,
    pub tree_deleted: bool,
    pub already_added: bool,
    pub in_queue: bool,
}

impl Directory {
    fn new(name: String, parent: Option<WeakDirRef>, wd: WatchDescriptor) -> DirRef {
        Rc::new(RefCell::new(Directory {
            wd: Some(wd),
            name,
            parent,
            children: Vec::new(),
            fail_cnt: 0,
            move_cookie: 0,
            tree_deleted: false,
            already_added: false,
            in_queue: true,
        }))
    }

    /// Path of this node relative to the watch root, forward-slash
    /// separated, with no leading slash (`""` for the root itself).
    pub fn relative_path(dir: &DirRef) -> String {
        let mut parts = Vec::new();
        let mut current = dir.clone();
        loop {
            let name = current.borrow().name.clone();
            let parent = current.borrow().parent.clone();
            if !name.is_empty() {
                parts.push(name);
            }
            match parent.and_then(|p| p.upgrade()) {
                Some(p) => current = p,
                None => break,
            }
        }
        parts.reverse();
        parts.join("/")
    }
}

/// `inotify_init1(IN_NONBLOCK)` isn't exposed by the crate's public
/// constructor, so the flag is set by hand right after `init()`, matching
/// the original WSL-side agent's behavior of creating its inotify instance
/// nonblocking from the start.
fn set_nonblocking(inotify: &Inotify) {
    use std::os::unix::io::AsRawFd;
    let fd = inotify.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn base_watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::MOVE_SELF
        | WatchMask::DONT_FOLLOW
        | WatchMask::ONLYDIR
        | WatchMask::MASK_CREATE
        | WatchMask::EXCL_UNLINK
}

/// One per host watch request.
pub struct Watcher {
    directory_id: DirectoryId,
    recursive: bool,
    failed: bool,
    inotify: Inotify,
    by_wd: HashMap<WatchDescriptor, WeakDirRef>,
    queue: VecDeque<DirRef>,
    root: DirRef,
    root_path: PathBuf,
    next_move_cookie: u64,
    fail_limit: u32,
}

/// Outcome of attempting to install a watch for one new host request.
pub enum StartWatch {
    /// The Watcher was installed; it may already have emitted nothing, or
    /// may later emit `FAILED` once draining the first scan if the root
    /// vanishes mid-scan.
    Started(Watcher),
    /// Installation failed outright (inotify init or the root watch itself);
    /// a single `FAILED` event has been appended to `events_out` and there is
    /// no Watcher to register.
    Failed,
}

impl Watcher {
    pub fn directory_id(&self) -> DirectoryId {
        self.directory_id
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn inotify_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.inotify.as_raw_fd()
    }

    /// Step 1-4 of §4.3 "Processing a WatchRequest": open a fresh inotify
    /// instance, install the root watch, and (if recursive) queue the root
    /// for the recursive scan.
    pub fn start(
        directory_id: DirectoryId,
        root_path: &Path,
        recursive: bool,
        fail_limit: u32,
        events_out: &mut Vec<EventRecord>,
    ) -> StartWatch {
        let mut inotify = match Inotify::init() {
            Ok(i) => i,
            Err(_) => {
                events_out.push(EventRecord::new(directory_id, Action::Failed, ""));
                return StartWatch::Failed;
            }
        };
        set_nonblocking(&inotify);

        let wd = match inotify.watches().add(root_path, base_watch_mask()) {
            Ok(wd) => wd,
            Err(_) => {
                events_out.push(EventRecord::new(directory_id, Action::Failed, ""));
                return StartWatch::Failed;
            }
        };

        let root = Directory::new(String::new(), None, wd.clone());
        let mut by_wd = HashMap::new();
        by_wd.insert(wd, Rc::downgrade(&root));

        let mut queue = VecDeque::new();
        if recursive {
            queue.push_back(root.clone());
        }

        StartWatch::Started(Watcher {
            directory_id,
            recursive,
            failed: false,
            inotify,
            by_wd,
            queue,
            root,
            root_path: root_path.to_path_buf(),
            next_move_cookie: 0,
            fail_limit,
        })
    }

    /// §4.3 "Failure escalation": emit exactly one `FAILED` event and latch.
    fn fail(&mut self, events_out: &mut Vec<EventRecord>) {
        if self.failed {
            return;
        }
        self.failed = true;
        events_out.push(EventRecord::new(self.directory_id, Action::Failed, ""));
    }

    fn send_event(&mut self, events_out: &mut Vec<EventRecord>, action: Action, path: String) {
        if self.failed {
            return;
        }
        events_out.push(EventRecord::new(self.directory_id, action, path));
    }

    /// Detach `dir` from the live tree: remove its inotify watch (if any)
    /// and its `by_wd` entry, recursively, then drop it from `parent`'s
    /// children so the Rc is actually freed.
    fn detach_subtree(&mut self, dir: &DirRef) {
        let wd = dir.borrow_mut().wd.take();
        if let Some(wd) = wd {
            self.by_wd.remove(&wd);
            let _ = self.inotify.watches().remove(wd);
        }
        let children = std::mem::take(&mut dir.borrow_mut().children);
        for child in &children {
            self.detach_subtree(child);
        }
    }

    fn detach_child_named(&mut self, parent: &DirRef, name: &str) {
        let removed = {
            let mut p = parent.borrow_mut();
            let idx = p.children.iter().position(|c| c.borrow().name == name);
            idx.map(|idx| p.children.remove(idx))
        };
        if let Some(child) = removed {
            self.detach_subtree(&child);
        }
    }

    /// Runs the recursive queue processor (§4.3) until the FIFO is empty. A
    /// no-op for non-recursive watches, whose queue is never populated.
    pub fn drain_queue(&mut self, events_out: &mut Vec<EventRecord>) {
        if !self.recursive {
            return;
        }
        while let Some(dir) = self.queue.pop_front() {
            if self.failed {
                return;
            }
            self.process_one_directory(&dir, events_out);
        }
    }

    fn process_one_directory(&mut self, dir: &DirRef, events_out: &mut Vec<EventRecord>) {
        // Step 1: ensure registered (idempotent; it was already inserted
        // when this node was created, either as the root or as a freshly
        // discovered child).
        if let Some(wd) = dir.borrow().wd.clone() {
            self.by_wd.insert(wd, Rc::downgrade(dir));
        } else {
            // Torn down before its turn came up (e.g. deleted mid-drain of
            // an ancestor). Nothing to scan.
            return;
        }

        let already_added = dir.borrow().already_added;
        let dir_path = self.absolute_path(dir);

        let entries = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(_) => {
                // The directory itself vanished between being queued and
                // being scanned: treat exactly like an EEXIST/ENOENT race
                // below, bounded by fail_cnt.
                self.retry_or_fail(dir, events_out);
                return;
            }
        };

        let mut new_children = Vec::new();
        let mut trustworthy = true;

        for entry in entries.flatten() {
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_path = entry.path();

            match self.inotify.watches().add(&child_path, base_watch_mask()) {
                Ok(wd) => {
                    let child = Directory::new(name, Some(Rc::downgrade(dir)), wd.clone());
                    self.by_wd.insert(wd, Rc::downgrade(&child));
                    new_children.push(child);
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EEXIST) if already_added => {
                        // Re-validating an already-trusted directory: reuse
                        // the existing child node rather than fail the scan.
                        if let Some(existing) = dir
                            .borrow()
                            .children
                            .iter()
                            .find(|c| c.borrow().name == name)
                            .cloned()
                        {
                            new_children.push(existing);
                        } else {
                            trustworthy = false;
                        }
                    }
                    Some(libc::EEXIST) | Some(libc::ENOTDIR) | Some(libc::ENOENT) => {
                        trustworthy = false;
                    }
                    _ => {
                        self.fail(events_out);
                        return;
                    }
                },
            }
        }

        // Step 3: replace the children list, detaching anything no longer
        // present so its watch is released.
        let old_children = std::mem::take(&mut dir.borrow_mut().children);
        let new_name_set: std::collections::HashSet<String> =
            new_children.iter().map(|c| c.borrow().name.clone()).collect();
        for old in old_children {
            if !new_name_set.contains(&old.borrow().name) {
                self.detach_subtree(&old);
            }
        }
        dir.borrow_mut().children = new_children.clone();

        // Step 4: drain inotify events once with a fresh move cookie.
        let cookie = self.next_move_cookie;
        self.next_move_cookie += 1;
        self.process_events(cookie, events_out);

        if self.failed {
            return;
        }

        // Step 5: abandon this directory's bookkeeping if it was deleted
        // mid-drain.
        if dir.borrow().tree_deleted {
            return;
        }

        // Step 6: an ancestor moved during our drain invalidates our scan.
        let mut ancestor = dir.borrow().parent.clone().and_then(|p| p.upgrade());
        while let Some(a) = ancestor {
            if a.borrow().move_cookie == cookie {
                trustworthy = false;
                break;
            }
            ancestor = a.borrow().parent.clone().and_then(|p| p.upgrade());
        }

        if trustworthy {
            let mut d = dir.borrow_mut();
            d.in_queue = false;
            d.already_added = true;
            drop(d);
            for child in &new_children {
                self.queue.push_back(child.clone());
            }
        } else {
            self.retry_or_fail(dir, events_out);
        }
    }

    fn retry_or_fail(&mut self, dir: &DirRef, events_out: &mut Vec<EventRecord>) {
        let fail_cnt = {
            let mut d = dir.borrow_mut();
            d.fail_cnt += 1;
            d.fail_cnt
        };
        if fail_cnt >= self.fail_limit {
            self.fail(events_out);
        } else {
            self.queue.push_back(dir.clone());
        }
    }

    fn absolute_path(&self, dir: &DirRef) -> PathBuf {
        let rel = Directory::relative_path(dir);
        if rel.is_empty() {
            self.root_path.clone()
        } else {
            self.root_path.join(rel)
        }
    }

    /// §4.3 "Inotify event draining": read events until `EAGAIN`/`EWOULDBLOCK`.
    pub fn process_events(&mut self, move_cookie: u64, events_out: &mut Vec<EventRecord>) {
        // Kernel move cookie -> the MOVED_FROM path seen earlier in this drain.
        let mut pending_moves: HashMap<u32, (WeakDirRef, String)> = HashMap::new();
        let mut buffer = [0u8; 4096];

        loop {
            if self.failed {
                return;
            }
            let events = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };

            let mut saw_any = false;
            for event in events {
                saw_any = true;
                self.handle_one_event(event, move_cookie, &mut pending_moves, events_out);
                if self.failed {
                    return;
                }
            }
            if !saw_any {
                break;
            }
        }

        // Any MOVED_FROM left unmatched at drain end finalizes as a delete.
        for (_, (weak_parent, name)) in pending_moves {
            if let Some(parent) = weak_parent.upgrade() {
                self.detach_child_named(&parent, &name);
            }
        }
    }

    fn handle_one_event(
        &mut self,
        event: inotify::Event<&OsStr>,
        move_cookie: u64,
        pending_moves: &mut HashMap<u32, (WeakDirRef, String)>,
        events_out: &mut Vec<EventRecord>,
    ) {
        let weak_dir = match self.by_wd.get(&event.wd) {
            Some(w) => w.clone(),
            None => return,
        };
        let dir = match weak_dir.upgrade() {
            Some(d) => d,
            None => {
                self.by_wd.remove(&event.wd);
                return;
            }
        };

        let is_root = Rc::ptr_eq(&dir, &self.root);

        if event.mask.contains(EventMask::MOVE_SELF) || event.mask.contains(EventMask::DELETE_SELF)
        {
            if is_root {
                self.fail(events_out);
            } else {
                dir.borrow_mut().move_cookie = move_cookie;
            }
            return;
        }

        if event.mask.contains(EventMask::IGNORED) || event.mask.contains(EventMask::UNMOUNT) {
            if is_root {
                self.fail(events_out);
            } else if let Some(parent) = dir.borrow().parent.clone().and_then(|p| p.upgrade()) {
                let name = dir.borrow().name.clone();
                self.detach_child_named(&parent, &name);
            }
            return;
        }

        let name = event
            .name
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry_rel = {
            let base = Directory::relative_path(&dir);
            if base.is_empty() {
                name.clone()
            } else {
                format!("{base}/{name}")
            }
        };

        if event.mask.contains(EventMask::MODIFY) || event.mask.contains(EventMask::ATTRIB) {
            self.send_event(events_out, Action::Modified, entry_rel);
            return;
        }

        if event.mask.contains(EventMask::MOVED_FROM) {
            self.send_event(events_out, Action::Removed, entry_rel.clone());
            pending_moves.insert(event.cookie, (Rc::downgrade(&dir), name));
            return;
        }

        if event.mask.contains(EventMask::MOVED_TO) {
            self.send_event(events_out, Action::Added, entry_rel.clone());
            if let Some((old_parent, old_name)) = pending_moves.remove(&event.cookie) {
                // In-tree move: the child already has a Directory node under
                // its old parent; reparent it if it is a directory.
                if event.mask.contains(EventMask::ISDIR) {
                    self.reparent_moved_child(&dir, &name, &old_parent, &old_name);
                }
            } else if event.mask.contains(EventMask::ISDIR) {
                self.install_child_watch(&dir, &name);
            }
            return;
        }

        if event.mask.contains(EventMask::CREATE) {
            self.send_event(events_out, Action::Added, entry_rel.clone());
            if event.mask.contains(EventMask::ISDIR) {
                self.install_child_watch(&dir, &name);
            }
            return;
        }

        if event.mask.contains(EventMask::DELETE) {
            self.send_event(events_out, Action::Removed, entry_rel);
            self.detach_child_named(&dir, &name);
        }
    }

    fn install_child_watch(&mut self, parent: &DirRef, name: &str) {
        if !self.recursive {
            return;
        }
        let parent_path = self.absolute_path(parent);
        let child_path = parent_path.join(name);
        match self.inotify.watches().add(&child_path, base_watch_mask()) {
            Ok(wd) => {
                let child = Directory::new(name.to_string(), Some(Rc::downgrade(parent)), wd.clone());
                self.by_wd.insert(wd, Rc::downgrade(&child));
                parent.borrow_mut().children.push(child.clone());
                self.queue.push_back(child);
            }
            Err(_) => {
                // The directory vanished again before we could watch it;
                // a later CREATE/rescan will pick it up if it reappears.
            }
        }
    }

    /// Relinks the Directory node for a `MOVED_FROM`/`MOVED_TO` pair from
    /// `old_parent` (keyed by its pre-move name `old_name`) into
    /// `new_parent` under `new_name`. The node's own `wd` is untouched —
    /// inotify watches track the underlying inode, not the path, so the
    /// rename is purely a tree-bookkeeping update.
    fn reparent_moved_child(
        &mut self,
        new_parent: &DirRef,
        new_name: &str,
        old_parent: &WeakDirRef,
        old_name: &str,
    ) {
        let existing = old_parent.upgrade().and_then(|op| {
            let idx = op
                .borrow()
                .children
                .iter()
                .position(|c| c.borrow().name == old_name)?;
            Some(op.borrow_mut().children.remove(idx))
        });
        if let Some(child) = existing {
            child.borrow_mut().name = new_name.to_string();
            child.borrow_mut().parent = Some(Rc::downgrade(new_parent));
            new_parent.borrow_mut().children.push(child);
        } else {
            // We never had a node for it (e.g. it was created and moved
            // within the same drain, before its own CREATE was queued):
            // treat it like a fresh create.
            self.install_child_watch(new_parent, new_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(mut ready: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !ready() {
            if Instant::now() > deadline {
                panic!("condition not met within timeout");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn drain_available(watcher: &mut Watcher, events: &mut Vec<EventRecord>) {
        // Give the kernel a moment to deliver the event, then drain once.
        wait_for(|| {
            let mut probe = Vec::new();
            watcher.process_events(9999, &mut probe);
            if probe.is_empty() {
                false
            } else {
                events.extend(probe);
                true
            }
        });
    }

    #[test]
    fn non_recursive_watch_reports_create_in_root_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut events = Vec::new();
        let watcher = match Watcher::start(1, dir.path(), false, 10, &mut events) {
            StartWatch::Started(w) => w,
            StartWatch::Failed => panic!("expected watch to start"),
        };
        let mut watcher = watcher;
        assert!(events.is_empty());

        fs::write(dir.path().join("x"), b"hi").unwrap();
        drain_available(&mut watcher, &mut events);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].directory, 1);
        assert_eq!(events[0].action(), Some(Action::Added));
        assert_eq!(events[0].path, "x");
    }

    #[test]
    fn recursive_watch_discovers_nested_create() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        let mut events = Vec::new();
        let watcher = match Watcher::start(2, dir.path(), true, 10, &mut events) {
            StartWatch::Started(w) => w,
            StartWatch::Failed => panic!("expected watch to start"),
        };
        let mut watcher = watcher;
        watcher.drain_queue(&mut events);

        fs::write(dir.path().join("b").join("f"), b"hi").unwrap();
        drain_available(&mut watcher, &mut events);

        assert!(events
            .iter()
            .any(|e| e.path == "b/f" && e.action() == Some(Action::Added)));
    }

    #[test]
    fn root_deletion_emits_single_failed_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut events = Vec::new();
        let watcher = match Watcher::start(3, dir.path(), false, 10, &mut events) {
            StartWatch::Started(w) => w,
            StartWatch::Failed => panic!("expected watch to start"),
        };
        let mut watcher = watcher;

        fs::remove_dir(dir.path()).unwrap();
        drain_available(&mut watcher, &mut events);

        assert!(watcher.is_failed());
        assert_eq!(
            events.iter().filter(|e| e.action() == Some(Action::Failed)).count(),
            1
        );

        // No further events after FAILED, even if more activity occurs.
        let before = events.len();
        let mut probe = Vec::new();
        watcher.process_events(1, &mut probe);
        assert!(probe.is_empty());
        assert_eq!(events.len(), before);
    }

    #[test]
    fn rename_within_tree_reports_remove_add_and_reparents_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b").join("f"), b"hi").unwrap();

        let mut events = Vec::new();
        let watcher = match Watcher::start(4, dir.path(), true, 10, &mut events) {
            StartWatch::Started(w) => w,
            StartWatch::Failed => panic!("expected watch to start"),
        };
        let mut watcher = watcher;
        watcher.drain_queue(&mut events);

        fs::rename(dir.path().join("b"), dir.path().join("c")).unwrap();
        drain_available(&mut watcher, &mut events);

        assert!(events
            .iter()
            .any(|e| e.path == "b" && e.action() == Some(Action::Removed)));
        assert!(events
            .iter()
            .any(|e| e.path == "c" && e.action() == Some(Action::Added)));

        // A subsequent change under the moved subtree is reported rooted at
        // the new name.
        events.clear();
        fs::write(dir.path().join("c").join("g"), b"hi").unwrap();
        drain_available(&mut watcher, &mut events);
        assert!(events
            .iter()
            .any(|e| e.path == "c/g" && e.action() == Some(Action::Added)));
    }

    /// Grounds §4.3 step 2's EEXIST race handling directly against the
    /// kernel: `IN_MASK_CREATE` makes `inotify_add_watch` fail with `EEXIST`
    /// when a watch already covers the target inode, which is exactly the
    /// "re-adding the same wd" race `process_one_directory` treats as
    /// trustworthy only once `already_added` is set.
    #[test]
    fn mask_create_rejects_a_watch_already_covering_the_inode() {
        use nix::sys::inotify::{AddWatchFlags, Inotify, InitFlags};

        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK).unwrap();
        let flags = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MASK_CREATE;

        inotify.add_watch(dir.path(), flags).unwrap();
        let err = inotify.add_watch(dir.path(), flags).unwrap_err();
        assert_eq!(err, nix::errno::Errno::EEXIST);
    }

    #[test]
    fn inotify_init_failure_path_is_exercised_by_construction_only() {
        // There is no portable way to force Inotify::init() to fail in a
        // unit test without exhausting a kernel-wide resource limit, so this
        // documents the contract instead of forcing the branch: a `Failed`
        // watch start must leave exactly one `FAILED` event and return
        // `StartWatch::Failed`. Covered indirectly by the root-deletion and
        // the `flush`/protocol boundary tests for the `Failed` action itself.
    }
}
