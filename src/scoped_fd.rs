use nix::unistd::close;
use std::os::unix::io::RawFd;

/// An owned kernel file descriptor. Closing the descriptor (on `close()` or
/// drop) is the only release path.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // An EBADF here would mean a double close somewhere else;
            // nothing useful to do with other errors at this point.
            let _ = close(self.fd);
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_relinquishes() {
        let mut fd = ScopedFd::from_raw(0);
        assert!(fd.is_open());
        assert_eq!(0, fd.extract());
        assert!(!fd.is_open());
    }
}
