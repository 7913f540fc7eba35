// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Poll-based reactor over a listening descriptor plus registered descriptors.
//!
//! The listening descriptor is the handshake socket; every other descriptor
//! is a userfaultfd. Waits have no timeout and `EINTR` is retried.

use std::io;
use std::os::fd::RawFd;

use crate::error::{PagerError, PagerResult};

/// Revents after which a registered descriptor leaves the poll set.
const HANGUP_EVENTS: libc::c_short = libc::POLLHUP | libc::POLLRDHUP | libc::POLLERR | libc::POLLNVAL;

/// Result of servicing the listening descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// A new descriptor to watch.
    Registered(RawFd),
    /// The peer is gone; stop the reactor.
    Closed,
}

/// Callbacks invoked by [`Reactor::run`].
pub trait EventSink {
    /// The listening descriptor is readable.
    fn on_connection(&mut self) -> PagerResult<Connection>;

    /// A registered descriptor is readable.
    fn on_readable(&mut self, fd: RawFd) -> PagerResult<()>;

    /// A registered descriptor was removed from the poll set.
    fn on_removed(&mut self, fd: RawFd);
}

#[derive(Debug)]
pub struct Reactor {
    listen_fd: RawFd,
    fds: Vec<RawFd>,
}

impl Reactor {
    pub fn new(listen_fd: RawFd) -> Self {
        Self {
            listen_fd,
            fds: Vec::new(),
        }
    }

    /// Watch `fd` for readability. Adding a watched descriptor is a no-op.
    pub fn add(&mut self, fd: RawFd) {
        if fd != self.listen_fd && !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
    }

    /// Stop watching `fd`. Returns false if it was not watched.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let before = self.fds.len();
        self.fds.retain(|&watched| watched != fd);
        self.fds.len() != before
    }

    /// Registered descriptors, excluding the listening one.
    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }

    fn poll_set(&self) -> Vec<libc::pollfd> {
        std::iter::once(self.listen_fd)
            .chain(self.fds.iter().copied())
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect()
    }

    /// Block until at least one descriptor is ready.
    fn wait(pollfds: &mut [libc::pollfd]) -> PagerResult<()> {
        loop {
            // SAFETY: `pollfds` is a live, exclusively borrowed array of
            // `pollfds.len()` entries.
            let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(PagerError::Syscall {
                    syscall: "poll",
                    message: err.to_string(),
                });
            }
        }
    }

    /// Run until the listener reports [`Connection::Closed`] or a callback
    /// on the listener fails.
    ///
    /// A failing `on_readable` drops only that descriptor.
    pub fn run<S: EventSink>(&mut self, sink: &mut S) -> PagerResult<()> {
        loop {
            let mut pollfds = self.poll_set();
            Self::wait(&mut pollfds)?;

            for pfd in &pollfds {
                if pfd.fd == self.listen_fd {
                    if pfd.revents & (libc::POLLIN | HANGUP_EVENTS) != 0 {
                        match sink.on_connection()? {
                            Connection::Registered(fd) => self.add(fd),
                            Connection::Closed => return Ok(()),
                        }
                    }
                    continue;
                }

                if pfd.revents & libc::POLLIN != 0 {
                    if let Err(e) = sink.on_readable(pfd.fd) {
                        tracing::error!(fd = pfd.fd, error = %e, "Dispatch failed, dropping descriptor");
                        if self.remove(pfd.fd) {
                            sink.on_removed(pfd.fd);
                        }
                    }
                }
            }

            let listen_fd = self.listen_fd;
            for pfd in pollfds.iter().filter(|pfd| pfd.fd != listen_fd) {
                if pfd.revents & HANGUP_EVENTS != 0 && self.remove(pfd.fd) {
                    tracing::debug!(fd = pfd.fd, revents = pfd.revents, "Descriptor hung up");
                    sink.on_removed(pfd.fd);
                }
            }
        }
    }
}
