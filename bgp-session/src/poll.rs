// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readiness wait over raw file descriptors, rebuilt on every loop
//! iteration.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Index of a descriptor registered with a [`PollSet`].
pub type Token = usize;

#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Register `fd` with the given interest.
    pub fn add(&mut self, fd: RawFd, read: bool, write: bool) -> Token {
        let mut events = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Wait until a descriptor is ready or `timeout` passes. An interrupted
    /// wait reports nothing ready.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        for p in self.fds.iter_mut() {
            p.revents = 0;
        }
        let n = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        Ok(n as usize)
    }

    fn revents(&self, token: Token) -> libc::c_short {
        self.fds.get(token).map(|p| p.revents).unwrap_or(0)
    }

    /// Readable, or hung up so that a read reports the condition.
    pub fn readable(&self, token: Token) -> bool {
        self.revents(token) & (libc::POLLIN | libc::POLLHUP) != 0
    }

    pub fn writable(&self, token: Token) -> bool {
        self.revents(token) & libc::POLLOUT != 0
    }

    /// The descriptor is in error or invalid.
    pub fn failed(&self, token: Token) -> bool {
        self.revents(token) & (libc::POLLERR | libc::POLLNVAL) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readiness() {
        let (mut a, b) = UnixStream::pair().expect("pair");
        let mut set = PollSet::new();
        let rb = set.add(b.as_raw_fd(), true, false);
        let wa = set.add(a.as_raw_fd(), false, true);

        assert_eq!(set.wait(Duration::from_millis(100)).expect("poll"), 1);
        assert!(!set.readable(rb));
        assert!(set.writable(wa));

        a.write_all(b"x").expect("write");
        set.clear();
        let rb = set.add(b.as_raw_fd(), true, false);
        assert_eq!(set.wait(Duration::from_secs(1)).expect("poll"), 1);
        assert!(set.readable(rb));
        assert!(!set.failed(rb));
    }
}
