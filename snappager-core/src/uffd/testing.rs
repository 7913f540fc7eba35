//! Recording userfaultfd double for unit tests.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use super::abi::{UffdioContinue, UffdioCopy, UffdioRange, UffdioZeropage, UFFD_MSG_SIZE};
use super::{FaultEvent, UserFault};

/// One ioctl issued against the double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Copy(UffdioCopy),
    Zeropage(UffdioZeropage),
    Continue(UffdioContinue),
    Wake(UffdioRange),
}

/// Records every ioctl and answers with scripted errno values.
///
/// Each scripted errno is consumed by the next call of that kind; once a
/// script is empty the call succeeds.
#[derive(Debug, Default)]
pub struct RecordingUffd {
    calls: Mutex<Vec<Call>>,
    messages: Mutex<VecDeque<[u8; UFFD_MSG_SIZE]>>,
    copy_errnos: Mutex<VecDeque<i32>>,
    zeropage_errnos: Mutex<VecDeque<i32>>,
    continue_errnos: Mutex<VecDeque<i32>>,
}

impl RecordingUffd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: FaultEvent) {
        self.messages.lock().unwrap().push_back(event.encode());
    }

    pub fn fail_copy(&self, errno: i32) {
        self.copy_errnos.lock().unwrap().push_back(errno);
    }

    pub fn fail_zeropage(&self, errno: i32) {
        self.zeropage_errnos.lock().unwrap().push_back(errno);
    }

    pub fn fail_continue(&self, errno: i32) {
        self.continue_errnos.lock().unwrap().push_back(errno);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn copies(&self) -> Vec<UffdioCopy> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Copy(copy) => Some(copy),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call, script: &Mutex<VecDeque<i32>>) -> io::Result<i64> {
        self.calls.lock().unwrap().push(call);
        match script.lock().unwrap().pop_front() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(4096),
        }
    }
}

impl UserFault for RecordingUffd {
    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn read_msg(&self, buf: &mut [u8; UFFD_MSG_SIZE]) -> io::Result<usize> {
        match self.messages.lock().unwrap().pop_front() {
            Some(msg) => {
                *buf = msg;
                Ok(UFFD_MSG_SIZE)
            }
            None => Err(io::Error::from_raw_os_error(libc::EAGAIN)),
        }
    }

    fn copy(&self, copy: UffdioCopy) -> io::Result<i64> {
        self.record(Call::Copy(copy), &self.copy_errnos)
    }

    fn zeropage(&self, zero: UffdioZeropage) -> io::Result<i64> {
        self.record(Call::Zeropage(zero), &self.zeropage_errnos)
    }

    fn continue_range(&self, cont: UffdioContinue) -> io::Result<i64> {
        self.record(Call::Continue(cont), &self.continue_errnos)
    }

    fn wake(&self, range: UffdioRange) -> io::Result<()> {
        self.calls.lock().unwrap().push(Call::Wake(range));
        Ok(())
    }
}

/// `Box<dyn UserFault>` that still lets the test inspect the recording.
impl UserFault for std::sync::Arc<RecordingUffd> {
    fn raw_fd(&self) -> RawFd {
        (**self).raw_fd()
    }

    fn read_msg(&self, buf: &mut [u8; UFFD_MSG_SIZE]) -> io::Result<usize> {
        (**self).read_msg(buf)
    }

    fn copy(&self, copy: UffdioCopy) -> io::Result<i64> {
        (**self).copy(copy)
    }

    fn zeropage(&self, zero: UffdioZeropage) -> io::Result<i64> {
        (**self).zeropage(zero)
    }

    fn continue_range(&self, cont: UffdioContinue) -> io::Result<i64> {
        (**self).continue_range(cont)
    }

    fn wake(&self, range: UffdioRange) -> io::Result<()> {
        (**self).wake(range)
    }
}
