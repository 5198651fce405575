//! Secondary selectors for blocking reads and writes performed by worker
//! threads. Each selector is a private epoll instance: the worker adds the
//! socket, waits for readiness with the remaining timeout, removes it and
//! returns the selector to the pool. This keeps worker blocking entirely
//! off the main poller's selector.

use crate::net::support::{SocketError, SocketResult, OP_READ};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct BlockingSelector {
    epfd: RawFd,
}

impl BlockingSelector {
    pub fn new() -> io::Result<BlockingSelector> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(BlockingSelector { epfd })
    }

    /// Blocks until `fd` is ready for `ops` or the timeout passes.
    pub fn wait(&self, fd: RawFd, ops: u8, timeout: Duration) -> SocketResult<()> {
        let interest = if ops & OP_READ != 0 {
            libc::EPOLLIN
        } else {
            libc::EPOLLOUT
        };

        let mut event = libc::epoll_event {
            events: (interest | libc::EPOLLERR | libc::EPOLLHUP) as u32,
            u64: fd as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let result = self.wait_registered(timeout);

        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 && result.is_ok() {
            return Err(io::Error::last_os_error().into());
        }

        result
    }

    fn wait_registered(&self, timeout: Duration) -> SocketResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(i32::MAX as u128) as i32;

            if millis == 0 {
                return Err(SocketError::Timeout);
            }

            let mut ready = [libc::epoll_event { events: 0, u64: 0 }];
            let count = unsafe { libc::epoll_wait(self.epfd, ready.as_mut_ptr(), 1, millis) };

            if count > 0 {
                return Ok(());
            }

            if count == 0 {
                return Err(SocketError::Timeout);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}

impl Drop for BlockingSelector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Bounded LIFO pool of blocking selectors. `get` returns None once the
/// creation cap is reached; callers then fall back to gate signalling
/// through the main poller.
pub struct SelectorPool {
    idle: Mutex<Vec<BlockingSelector>>,
    created: AtomicUsize,
    bound: usize,
}

impl SelectorPool {
    pub fn new(bound: usize) -> SelectorPool {
        SelectorPool {
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            bound,
        }
    }

    pub fn get(&self) -> io::Result<Option<BlockingSelector>> {
        if let Some(selector) = self.idle.lock().expect("SelectorPool lock poisoned").pop() {
            return Ok(Some(selector));
        }

        // Optimistically claim a creation slot; undo on contention loss.
        let prior = self.created.fetch_add(1, Ordering::AcqRel);
        if prior >= self.bound {
            self.created.fetch_sub(1, Ordering::AcqRel);
            return Ok(None);
        }

        match BlockingSelector::new() {
            Ok(selector) => Ok(Some(selector)),
            Err(err) => {
                self.created.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    pub fn put(&self, selector: BlockingSelector) {
        self.idle
            .lock()
            .expect("SelectorPool lock poisoned")
            .push(selector);
    }

    /// Closes every idle selector. Outstanding ones close when returned
    /// holders drop them.
    pub fn close(&self) {
        self.idle.lock().expect("SelectorPool lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::support::OP_WRITE;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_wait_readable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let selector = BlockingSelector::new().unwrap();

        // Nothing to read yet.
        let result = selector.wait(client.as_raw_fd(), OP_READ, Duration::from_millis(50));
        assert_eq!(result, Err(SocketError::Timeout));

        server.write_all(b"x").unwrap();
        selector
            .wait(client.as_raw_fd(), OP_READ, Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn test_wait_writable_immediate() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let selector = BlockingSelector::new().unwrap();
        selector
            .wait(client.as_raw_fd(), OP_WRITE, Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn test_pool_bound() {
        let pool = SelectorPool::new(2);

        let first = pool.get().unwrap().unwrap();
        let second = pool.get().unwrap().unwrap();
        assert!(pool.get().unwrap().is_none());

        pool.put(first);
        assert!(pool.get().unwrap().is_some());

        drop(second);
    }
}
