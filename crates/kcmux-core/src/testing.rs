//! Scriptable capability set for exercising multiplexor logic without AF_KCM.
//!
//! Group sockets are backed by Unix datagram pairs so reads and writes work;
//! readiness wake-ups and stored socket errors follow a script. Every
//! boundary call is counted.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::attach::Attachable;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::sys::{Interest, Kernel, Watch};

/// One scripted readiness wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Wake, leaving this value in the stored socket error.
    Stored(Option<i32>),
    /// Wake, after which reading the stored error fails with this errno.
    Unqueryable(i32),
    /// The readiness wait itself fails with this errno.
    Fail(i32),
}

/// Number of boundary calls a [`FakeKernel`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_group: usize,
    pub clone_group: usize,
    pub attach: usize,
    pub detach: usize,
    pub socket_error: usize,
    pub watch: usize,
    pub poll: usize,
    pub close: usize,
}

#[derive(Debug, Clone, Copy)]
enum Stored {
    Value(Option<i32>),
    Fails(i32),
}

#[derive(Debug, Default)]
struct State {
    calls: CallCounts,
    wakeups: VecDeque<Wake>,
    stored: HashMap<RawFd, Stored>,
    peers: Vec<UnixDatagram>,
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
    fail_create: Option<i32>,
    fail_clone: Option<i32>,
    fail_attach: Option<i32>,
    fail_detach: Option<i32>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_wakeups(self, wakeups: impl IntoIterator<Item = Wake>) -> Self {
        self.push_wakeups(wakeups);
        self
    }

    #[must_use]
    pub fn fail_create(mut self, errno: i32) -> Self {
        self.fail_create = Some(errno);
        self
    }

    #[must_use]
    pub fn fail_clone(mut self, errno: i32) -> Self {
        self.fail_clone = Some(errno);
        self
    }

    #[must_use]
    pub fn fail_attach(mut self, errno: i32) -> Self {
        self.fail_attach = Some(errno);
        self
    }

    #[must_use]
    pub fn fail_detach(mut self, errno: i32) -> Self {
        self.fail_detach = Some(errno);
        self
    }

    /// Queue more wake-ups, shared by every watch.
    pub fn push_wakeups(&self, wakeups: impl IntoIterator<Item = Wake>) {
        self.lock().wakeups.extend(wakeups);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// The far end of the `index`th group socket created or cloned.
    pub fn peer(&self, index: usize) -> Option<UnixDatagram> {
        self.lock().peers.get(index).and_then(|p| p.try_clone().ok())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_group(&self) -> Result<OwnedFd> {
        let (ours, theirs) = UnixDatagram::pair()?;
        self.lock().peers.push(theirs);
        Ok(OwnedFd::from(ours))
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn datagram(fd: BorrowedFd<'_>) -> Result<UnixDatagram> {
    Ok(UnixDatagram::from(fd.try_clone_to_owned()?))
}

impl Kernel for FakeKernel {
    fn supported(&self) -> Result<()> {
        Ok(())
    }

    fn create_group(&self, _mode: Mode) -> Result<OwnedFd> {
        self.lock().calls.create_group += 1;
        if let Some(code) = self.fail_create {
            return Err(Error::ResourceCreationFailed(errno(code)));
        }
        self.new_group()
    }

    fn clone_group(&self, _group: BorrowedFd<'_>) -> Result<OwnedFd> {
        self.lock().calls.clone_group += 1;
        if let Some(code) = self.fail_clone {
            return Err(Error::ResourceCreationFailed(errno(code)));
        }
        self.new_group()
    }

    fn attach(
        &self,
        _group: BorrowedFd<'_>,
        _conn: BorrowedFd<'_>,
        _classifier: BorrowedFd<'_>,
    ) -> Result<()> {
        self.lock().calls.attach += 1;
        self.fail_attach
            .map_or(Ok(()), |code| Err(Error::AttachRejected(errno(code))))
    }

    fn detach(&self, _group: BorrowedFd<'_>, _conn: BorrowedFd<'_>) -> Result<()> {
        self.lock().calls.detach += 1;
        self.fail_detach
            .map_or(Ok(()), |code| Err(Error::DetachRejected(errno(code))))
    }

    fn socket_error(&self, fd: BorrowedFd<'_>) -> Result<Option<i32>> {
        let mut state = self.lock();
        state.calls.socket_error += 1;
        // Reading SO_ERROR clears it.
        match state.stored.remove(&fd.as_raw_fd()) {
            None => Ok(None),
            Some(Stored::Value(v)) => Ok(v),
            Some(Stored::Fails(code)) => Err(errno(code).into()),
        }
    }

    fn watch_readable(&self, fd: BorrowedFd<'_>) -> Result<Box<dyn Watch>> {
        self.lock().calls.watch += 1;
        Ok(Box::new(FakeWatch {
            fd: fd.as_raw_fd(),
            state: Arc::clone(&self.state),
        }))
    }

    fn poll(
        &self,
        _fd: BorrowedFd<'_>,
        _interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.lock().calls.poll += 1;
        std::thread::sleep(timeout.unwrap_or(Duration::MAX).min(Duration::from_millis(5)));
        Ok(false)
    }

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize> {
        Ok(datagram(fd)?.recv(buf)?)
    }

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize> {
        Ok(datagram(fd)?.send(buf)?)
    }

    fn close(&self, fd: OwnedFd) -> Result<()> {
        self.lock().calls.close += 1;
        drop(fd);
        Ok(())
    }
}

struct FakeWatch {
    fd: RawFd,
    state: Arc<Mutex<State>>,
}

impl Watch for FakeWatch {
    fn wait(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(wake) = state.wakeups.pop_front() else {
            return Err(io::Error::other("no scripted wake-up left").into());
        };
        match wake {
            Wake::Stored(v) => {
                state.stored.insert(self.fd, Stored::Value(v));
                Ok(())
            }
            Wake::Unqueryable(code) => {
                state.stored.insert(self.fd, Stored::Fails(code));
                Ok(())
            }
            Wake::Fail(code) => Err(errno(code).into()),
        }
    }
}

/// How many times a [`TrackedConn`] has been closed.
#[derive(Debug, Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// An attachable connection that counts how often it is closed.
#[derive(Debug)]
pub struct TrackedConn {
    stream: UnixStream,
    controllable: bool,
    closes: CloseCounter,
}

impl TrackedConn {
    pub fn new() -> io::Result<(Self, CloseCounter)> {
        Self::build(true)
    }

    /// A connection whose descriptor cannot be taken over.
    pub fn uncontrollable() -> io::Result<(Self, CloseCounter)> {
        Self::build(false)
    }

    /// Any open descriptor, standing in for a loaded classifier program.
    pub fn classifier() -> io::Result<UnixStream> {
        UnixStream::pair().map(|(a, _)| a)
    }

    fn build(controllable: bool) -> io::Result<(Self, CloseCounter)> {
        let (stream, _) = UnixStream::pair()?;
        let closes = CloseCounter::default();
        let conn = Self {
            stream,
            controllable,
            closes: closes.clone(),
        };
        Ok((conn, closes))
    }
}

impl Attachable for TrackedConn {
    fn control(&self) -> io::Result<BorrowedFd<'_>> {
        if self.controllable {
            Ok(self.stream.as_fd())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "connection does not expose its descriptor",
            ))
        }
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
    }
}
