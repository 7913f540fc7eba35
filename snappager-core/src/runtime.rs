// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Runtime: one handshake connection, any number of handler generations.
//!
//! The runtime maps the backing file once and shares the resulting
//! [`PageOperations`] with every handler created on its connection. All
//! dispatch happens on the thread calling [`Runtime::run`].

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::Pid;

use crate::chunk::ChunkStore;
use crate::config::PagerConfig;
use crate::error::{PagerError, PagerResult};
use crate::handler::UffdHandler;
use crate::pager::{BackingSource, PageOperations};
use crate::reactor::{Connection, EventSink, Reactor};
use crate::tracer::PageFaultTracer;
use crate::working_set::WorkingSet;

pub struct Runtime {
    stream: UnixStream,
    ops: Arc<PageOperations>,
    guest_size: u64,
    peer_pid: Option<Pid>,
    handlers: HashMap<RawFd, UffdHandler>,
}

impl Runtime {
    /// Map `backing_file`, load the working set and prepare the shared page operations.
    ///
    /// In lazy mode `backing_file` is a recipe and `chunk_store` is required.
    pub fn new(
        stream: UnixStream,
        backing_file: &File,
        working_set_file: Option<&Path>,
        tracer: PageFaultTracer,
        lazy: bool,
        chunk_store: Option<Arc<dyn ChunkStore>>,
        threads: usize,
    ) -> PagerResult<Self> {
        let peer_pid = peer_credentials(&stream);

        let source = BackingSource::open(backing_file, lazy, chunk_store)?;
        let guest_size = source.logical_size();

        let working_set = match working_set_file {
            Some(path) => WorkingSet::load(path)?,
            None => WorkingSet::empty(),
        };

        tracing::info!(
            guest_size = guest_size,
            lazy = lazy,
            working_set_pages = working_set.len(),
            threads = threads,
            tracing_enabled = tracer.is_enabled(),
            "Runtime initialized"
        );

        Ok(Self {
            stream,
            ops: Arc::new(PageOperations::new(source, working_set, threads, tracer)),
            guest_size,
            peer_pid,
            handlers: HashMap::new(),
        })
    }

    /// Pid of the hypervisor, when its credentials could be read.
    pub fn peer_pid(&self) -> Option<Pid> {
        self.peer_pid
    }

    /// Operations shared by all handlers of this runtime.
    pub fn page_operations(&self) -> &Arc<PageOperations> {
        &self.ops
    }

    /// Guest memory size every region table must cover.
    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    /// Live handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Poll the handshake socket and every live userfaultfd until the
    /// hypervisor closes the connection.
    ///
    /// `dispatch` is called with the handler whose descriptor became readable.
    /// The tracer is closed before returning.
    pub fn run<F>(&mut self, dispatch: F) -> PagerResult<()>
    where
        F: FnMut(&mut UffdHandler) -> PagerResult<()>,
    {
        let mut reactor = Reactor::new(self.stream.as_raw_fd());
        for &fd in self.handlers.keys() {
            reactor.add(fd);
        }

        let mut sink = RuntimeSink {
            stream: &self.stream,
            ops: &self.ops,
            guest_size: self.guest_size,
            handlers: &mut self.handlers,
            dispatch,
        };
        let result = reactor.run(&mut sink);
        let closed = self.ops.tracer().close();

        match result {
            Ok(()) => {
                tracing::info!("Handshake peer closed, runtime stopped");
                closed
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    tracing::error!(error = %close_err, "Failed to close page fault tracer");
                }
                Err(e)
            }
        }
    }
}

struct RuntimeSink<'a, F> {
    stream: &'a UnixStream,
    ops: &'a Arc<PageOperations>,
    guest_size: u64,
    handlers: &'a mut HashMap<RawFd, UffdHandler>,
    dispatch: F,
}

impl<F> EventSink for RuntimeSink<'_, F>
where
    F: FnMut(&mut UffdHandler) -> PagerResult<()>,
{
    fn on_connection(&mut self) -> PagerResult<Connection> {
        match UffdHandler::from_unix_stream(self.stream, Arc::clone(self.ops), self.guest_size) {
            Ok(handler) => {
                let fd = handler.raw_fd();
                self.handlers.insert(fd, handler);
                Ok(Connection::Registered(fd))
            }
            Err(e) if e.is_eof() => Ok(Connection::Closed),
            Err(e) => Err(e),
        }
    }

    fn on_readable(&mut self, fd: RawFd) -> PagerResult<()> {
        match self.handlers.get_mut(&fd) {
            Some(handler) => (self.dispatch)(handler),
            None => Ok(()),
        }
    }

    fn on_removed(&mut self, fd: RawFd) {
        if self.handlers.remove(&fd).is_some() {
            tracing::info!(uffd = fd, "UFFD handler removed");
        }
    }
}

fn peer_credentials(stream: &UnixStream) -> Option<Pid> {
    match getsockopt(stream, sockopt::PeerCredentials) {
        Ok(creds) => {
            tracing::info!(
                pid = creds.pid(),
                uid = creds.uid(),
                gid = creds.gid(),
                "Hypervisor connected"
            );
            Some(Pid::from_raw(creds.pid()))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not read peer credentials");
            None
        }
    }
}

/// The hypervisor process behind the handshake socket, once it has connected.
///
/// Shared with whoever handles shutdown signals: a hypervisor left running
/// after the page server exits hangs on its next fault.
#[derive(Debug, Default)]
pub struct PeerProcess {
    pid: AtomicI32,
}

impl PeerProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: Pid) {
        self.pid.store(pid.as_raw(), Ordering::Release);
    }

    /// Known peer pid. Never zero or negative, so it cannot name a process group.
    pub fn pid(&self) -> Option<Pid> {
        match self.pid.load(Ordering::Acquire) {
            pid if pid > 0 => Some(Pid::from_raw(pid)),
            _ => None,
        }
    }

    /// Send SIGTERM to the peer. Returns false when no peer has connected.
    pub fn terminate(&self) -> PagerResult<bool> {
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        kill(pid, Signal::SIGTERM).map_err(|e| PagerError::Syscall {
            syscall: "kill",
            message: e.to_string(),
        })?;
        tracing::info!(pid = pid.as_raw(), "Sent SIGTERM to hypervisor");
        Ok(true)
    }
}

fn remove_stale_socket(path: &Path) -> PagerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PagerError::Io {
            context: "removing stale handshake socket",
            source: e,
        }),
    }
}

/// Serve one VM: bind the handshake socket, accept the hypervisor and run
/// the standard dispatch until the connection closes.
///
/// Blocks the calling thread. Returns on handshake failure or graceful
/// peer shutdown.
pub fn start_uffd_handler(
    config: &PagerConfig,
    chunk_store: Option<Arc<dyn ChunkStore>>,
) -> PagerResult<()> {
    start_uffd_handler_with_peer(config, chunk_store, &PeerProcess::new())
}

/// [`start_uffd_handler`], publishing the hypervisor pid to `peer` once it connects.
pub fn start_uffd_handler_with_peer(
    config: &PagerConfig,
    chunk_store: Option<Arc<dyn ChunkStore>>,
    peer: &PeerProcess,
) -> PagerResult<()> {
    let backing_file = File::open(&config.memory_file).map_err(|e| PagerError::Io {
        context: "opening memory file",
        source: e,
    })?;
    let tracer = PageFaultTracer::from_path(config.trace_file.as_deref())?;

    remove_stale_socket(&config.socket_path)?;
    let listener = UnixListener::bind(&config.socket_path).map_err(|e| PagerError::Io {
        context: "binding handshake socket",
        source: e,
    })?;
    tracing::info!(socket = %config.socket_path.display(), "Waiting for hypervisor");

    let (stream, _) = listener.accept().map_err(|e| PagerError::Io {
        context: "accepting handshake connection",
        source: e,
    })?;
    drop(listener);

    let result = Runtime::new(
        stream,
        &backing_file,
        config.working_set_file.as_deref(),
        tracer,
        config.lazy,
        chunk_store,
        config.threads,
    )
    .and_then(|mut runtime| {
        if let Some(pid) = runtime.peer_pid() {
            peer.set(pid);
        }
        runtime.run(|handler| handler.serve_pending_events())
    });

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::debug!(error = %e, "Handshake socket already gone");
    }
    result
}
