//! File descriptor readiness watching bridged into an [`EventLoop`].
//!
//! Watching is served by a companion thread per loop, spawned lazily
//! on the first watch. The thread blocks in `poll(2)` over the watched
//! descriptors plus an internal wake pipe used to interrupt it when
//! the watch table changes. On readiness the descriptor is suspended
//! and the callback is forwarded into the owning loop as ordinary
//! work; once the callback returns, the descriptor is re-armed. That
//! keeps callback execution on loop threads and guarantees a watcher
//! never observes two concurrent callbacks for one descriptor.
//!
//! Unix only. On other platforms the loop's registration APIs simply
//! report `false`.

pub const FD_EVENT_READ: u8 = 0b0001;
pub const FD_EVENT_WRITE: u8 = 0b0010;
pub const FD_EVENT_ERROR: u8 = 0b0100;
pub const FD_EVENT_HANGUP: u8 = 0b1000;

/// Upper bound on descriptors watched per loop.
pub const MAX_WATCHED_FDS: usize = 64;

/// A registered descriptor watcher.
///
/// The implementation keeps ownership of the descriptor; the watcher
/// table only polls it. `on_fd_events` runs as work on the owning
/// loop's thread, so it may block briefly but should drain the
/// descriptor before returning, as readiness is level-triggered.
pub trait FileDescriptorEventCallback: Send + Sync {
    /// Descriptor to watch.
    fn fd(&self) -> i32;

    /// Interest mask built from the `FD_EVENT_*` bits.
    fn interest(&self) -> u8 {
        FD_EVENT_READ
    }

    fn on_fd_events(&self, fd: i32, events: u8);
}

#[cfg(unix)]
pub(crate) use imp::FdPoller;

#[cfg(unix)]
mod imp {
    use super::{FileDescriptorEventCallback, FD_EVENT_ERROR, FD_EVENT_HANGUP, FD_EVENT_READ, FD_EVENT_WRITE, MAX_WATCHED_FDS};
    use crate::event_loop::EventLoop;
    use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
    use std::io;
    use std::sync::{Arc, Weak};
    use std::thread::JoinHandle;
    use tracing::{error, trace, warn};

    enum PollerCmd {
        Watch {
            name: String,
            callback: Arc<dyn FileDescriptorEventCallback>,
            reply: Sender<bool>,
        },
        Unwatch {
            name: String,
            reply: Sender<bool>,
        },
        Rearm(i32),
        Stop,
    }

    struct WatchEntry {
        name: String,
        fd: i32,
        interest: u8,
        callback: Arc<dyn FileDescriptorEventCallback>,
        suspended: bool,
    }

    /// Write end of the wake pipe, shared with forwarded rearm tasks.
    struct WakeHandle {
        fd: i32,
    }

    impl WakeHandle {
        fn wake(&self) {
            let byte = [1u8];
            unsafe {
                libc::write(self.fd, byte.as_ptr().cast(), 1);
            }
        }
    }

    impl Drop for WakeHandle {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    pub(crate) struct FdPoller {
        commands: Sender<PollerCmd>,
        wake: Arc<WakeHandle>,
        thread: Option<JoinHandle<()>>,
    }

    impl FdPoller {
        pub(crate) fn spawn(owner: Weak<EventLoop>, loop_name: String) -> io::Result<FdPoller> {
            let (read_fd, write_fd) = create_wake_pipe()?;
            let (tx, rx) = unbounded();
            let wake = Arc::new(WakeHandle { fd: write_fd });
            let rearm_tx = tx.clone();
            let rearm_wake = wake.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("poll-{loop_name}"))
                .spawn(move || {
                    poll_thread(owner, loop_name, read_fd, rx, rearm_tx, rearm_wake);
                    unsafe {
                        libc::close(read_fd);
                    }
                });
            match spawned {
                Ok(handle) => Ok(FdPoller { commands: tx, wake, thread: Some(handle) }),
                Err(err) => {
                    unsafe {
                        libc::close(read_fd);
                    }
                    Err(err)
                }
            }
        }

        pub(crate) fn watch(
            &self,
            name: &str,
            callback: Arc<dyn FileDescriptorEventCallback>,
        ) -> bool {
            let (reply, confirm) = bounded(1);
            let cmd = PollerCmd::Watch { name: name.to_string(), callback, reply };
            if self.commands.send(cmd).is_err() {
                return false;
            }
            self.wake.wake();
            confirm.recv().unwrap_or(false)
        }

        pub(crate) fn unwatch(&self, name: &str) -> bool {
            let (reply, confirm) = bounded(1);
            let cmd = PollerCmd::Unwatch { name: name.to_string(), reply };
            if self.commands.send(cmd).is_err() {
                return false;
            }
            self.wake.wake();
            confirm.recv().unwrap_or(false)
        }

        pub(crate) fn shutdown(mut self) {
            self.stop_inner();
        }

        fn stop_inner(&mut self) {
            if let Some(handle) = self.thread.take() {
                let _ = self.commands.send(PollerCmd::Stop);
                self.wake.wake();
                let _ = handle.join();
            }
        }
    }

    impl Drop for FdPoller {
        fn drop(&mut self) {
            self.stop_inner();
        }
    }

    fn create_wake_pipe() -> io::Result<(i32, i32)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Ok((fds[0], fds[1]))
    }

    fn interest_to_poll(mask: u8) -> libc::c_short {
        let mut events = 0;
        if mask & FD_EVENT_READ != 0 {
            events |= libc::POLLIN;
        }
        if mask & FD_EVENT_WRITE != 0 {
            events |= libc::POLLOUT;
        }
        events
    }

    fn revents_to_mask(revents: libc::c_short) -> u8 {
        let mut mask = 0;
        if revents & libc::POLLIN != 0 {
            mask |= FD_EVENT_READ;
        }
        if revents & libc::POLLOUT != 0 {
            mask |= FD_EVENT_WRITE;
        }
        if revents & libc::POLLERR != 0 {
            mask |= FD_EVENT_ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            mask |= FD_EVENT_HANGUP;
        }
        mask
    }

    fn drain_wake(fd: i32) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    fn poll_thread(
        owner: Weak<EventLoop>,
        loop_name: String,
        wake_fd: i32,
        commands: Receiver<PollerCmd>,
        rearm_tx: Sender<PollerCmd>,
        rearm_wake: Arc<WakeHandle>,
    ) {
        let mut watches: Vec<WatchEntry> = Vec::new();
        trace!(name = %loop_name, "fd poller running");
        loop {
            while let Ok(cmd) = commands.try_recv() {
                match cmd {
                    PollerCmd::Watch { name, callback, reply } => {
                        let fd = callback.fd();
                        let accepted = fd >= 0
                            && watches.len() < MAX_WATCHED_FDS
                            && !watches.iter().any(|w| w.name == name);
                        if accepted {
                            watches.push(WatchEntry {
                                name,
                                fd,
                                interest: callback.interest(),
                                callback,
                                suspended: false,
                            });
                        } else {
                            warn!(name = %loop_name, watcher = %name, "fd watch rejected");
                        }
                        let _ = reply.send(accepted);
                    }
                    PollerCmd::Unwatch { name, reply } => {
                        let before = watches.len();
                        watches.retain(|w| w.name != name);
                        let _ = reply.send(watches.len() != before);
                    }
                    PollerCmd::Rearm(fd) => {
                        for watch in watches.iter_mut().filter(|w| w.fd == fd) {
                            watch.suspended = false;
                        }
                    }
                    PollerCmd::Stop => {
                        trace!(name = %loop_name, "fd poller stopping");
                        return;
                    }
                }
            }

            let mut fds = vec![libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 }];
            let mut active = Vec::new();
            for (index, watch) in watches.iter().enumerate() {
                if !watch.suspended {
                    fds.push(libc::pollfd {
                        fd: watch.fd,
                        events: interest_to_poll(watch.interest),
                        revents: 0,
                    });
                    active.push(index);
                }
            }

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!(name = %loop_name, error = %err, "poll failed, fd poller exits");
                return;
            }

            if fds[0].revents & libc::POLLIN != 0 {
                drain_wake(wake_fd);
            }

            let mut invalid: Vec<String> = Vec::new();
            for (slot, &index) in active.iter().enumerate() {
                let revents = fds[slot + 1].revents;
                if revents == 0 {
                    continue;
                }
                let watch = &mut watches[index];
                if revents & libc::POLLNVAL != 0 {
                    warn!(name = %loop_name, watcher = %watch.name, fd = watch.fd, "watched fd is invalid, dropping watch");
                    invalid.push(watch.name.clone());
                    continue;
                }
                let mask = revents_to_mask(revents);
                if mask == 0 {
                    continue;
                }
                let Some(event_loop) = owner.upgrade() else {
                    trace!(name = %loop_name, "owning loop gone, fd poller exits");
                    return;
                };
                watch.suspended = true;
                let callback = watch.callback.clone();
                let fd = watch.fd;
                let rearm = rearm_tx.clone();
                let wake = rearm_wake.clone();
                event_loop.add_task(move || {
                    callback.on_fd_events(fd, mask);
                    let _ = rearm.send(PollerCmd::Rearm(fd));
                    wake.wake();
                });
            }
            if !invalid.is_empty() {
                watches.retain(|w| !invalid.contains(&w.name));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    struct PipePair {
        read_fd: i32,
        write_fd: i32,
    }

    impl PipePair {
        fn new() -> Self {
            let mut fds = [0 as libc::c_int; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            PipePair { read_fd: fds[0], write_fd: fds[1] }
        }

        fn poke(&self) {
            let byte = [7u8];
            unsafe {
                libc::write(self.write_fd, byte.as_ptr().cast(), 1);
            }
        }
    }

    impl Drop for PipePair {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }

    struct DrainingReader {
        fd: i32,
        hits: AtomicUsize,
        last_mask: AtomicUsize,
    }

    impl FileDescriptorEventCallback for DrainingReader {
        fn fd(&self) -> i32 {
            self.fd
        }

        fn on_fd_events(&self, fd: i32, events: u8) {
            let mut buf = [0u8; 16];
            unsafe {
                libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
            }
            self.last_mask.store(events as usize, Ordering::SeqCst);
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn readiness_is_forwarded_and_rearmed() {
        let event_loop = Arc::new(EventLoop::new("fdtest"));
        event_loop.start();

        let pipe = PipePair::new();
        let reader = Arc::new(DrainingReader {
            fd: pipe.read_fd,
            hits: AtomicUsize::new(0),
            last_mask: AtomicUsize::new(0),
        });
        assert!(event_loop.add_fd_event_callback("pipe_reader", reader.clone()));

        pipe.poke();
        assert!(wait_until(Duration::from_secs(2), || {
            reader.hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(
            reader.last_mask.load(Ordering::SeqCst) as u8 & FD_EVENT_READ,
            FD_EVENT_READ
        );

        // Second readiness after the re-arm.
        pipe.poke();
        assert!(wait_until(Duration::from_secs(2), || {
            reader.hits.load(Ordering::SeqCst) == 2
        }));

        event_loop.stop();
    }

    #[test]
    fn duplicate_watch_names_are_rejected() {
        let event_loop = Arc::new(EventLoop::new("fddup"));
        event_loop.start();

        let pipe = PipePair::new();
        let reader = Arc::new(DrainingReader {
            fd: pipe.read_fd,
            hits: AtomicUsize::new(0),
            last_mask: AtomicUsize::new(0),
        });
        assert!(event_loop.add_fd_event_callback("same", reader.clone()));
        assert!(!event_loop.add_fd_event_callback("same", reader.clone()));

        event_loop.stop();
    }

    #[test]
    fn unwatched_descriptor_stops_firing() {
        let event_loop = Arc::new(EventLoop::new("fdremove"));
        event_loop.start();

        let pipe = PipePair::new();
        let reader = Arc::new(DrainingReader {
            fd: pipe.read_fd,
            hits: AtomicUsize::new(0),
            last_mask: AtomicUsize::new(0),
        });
        assert!(event_loop.add_fd_event_callback("transient", reader.clone()));
        pipe.poke();
        assert!(wait_until(Duration::from_secs(2), || {
            reader.hits.load(Ordering::SeqCst) == 1
        }));

        assert!(event_loop.remove_fd_event_callback("transient"));
        assert!(!event_loop.remove_fd_event_callback("transient"));
        pipe.poke();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(reader.hits.load(Ordering::SeqCst), 1);

        event_loop.stop();
    }
}
