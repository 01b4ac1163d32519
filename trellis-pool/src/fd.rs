//! File-descriptor passing over Unix sockets.
//!
//! Checked-out backend connections travel from the pooler to the session as
//! `SCM_RIGHTS` ancillary data attached to the reply frame. The pooler side
//! of the transfer lives here too so in-process poolers (tests, embedded
//! deployments) can hand fds over with the same code.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Enough control space for a full checkout of every node in a large
/// cluster in one message.
const CMSG_CAPACITY: usize = 1024;

#[repr(C, align(8))]
struct CmsgSpace([u8; CMSG_CAPACITY]);

/// Send `payload` with `fds` attached as `SCM_RIGHTS` ancillary data.
pub fn send_with_fds(sock: RawFd, payload: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let fd_bytes = mem::size_of_val(fds);
    let mut space = CmsgSpace([0; CMSG_CAPACITY]);

    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            let control_len = libc::CMSG_SPACE(fd_bytes as u32) as usize;
            assert!(control_len <= CMSG_CAPACITY, "too many fds in one message");
            msg.msg_control = space.0.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control_len as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                fd_bytes,
            );
        }

        let n = libc::sendmsg(sock, &msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Receive up to `buf.len()` payload bytes plus any fds attached to the
/// message. Returns the payload length and the received fds.
pub fn recv_with_fds(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    let mut space = CmsgSpace([0; CMSG_CAPACITY]);

    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = CMSG_CAPACITY as _;

        let n = libc::recvmsg(sock, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let nbytes = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..nbytes / mem::size_of::<RawFd>() {
                    fds.push(*data.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        Ok((n as usize, fds))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn fds_survive_the_trip() {
        let (tx, rx) = UnixStream::pair().unwrap();
        // the fd we transfer is one end of a second socketpair
        let (carried_a, carried_b) = UnixStream::pair().unwrap();

        let sent = send_with_fds(tx.as_raw_fd(), b"hello", &[carried_a.as_raw_fd()]).unwrap();
        assert_eq!(sent, 5);
        // the kernel duplicated the fd into the message; close the original
        // so the peer sees EOF once the received copy is dropped too
        drop(carried_a);

        let mut buf = [0u8; 16];
        let (n, fds) = recv_with_fds(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fds.len(), 1);

        // prove the received fd is live: write through it, read on the peer
        let mut received = unsafe { UnixStream::from_raw_fd(fds[0]) };
        received.write_all(b"ping").unwrap();
        drop(received);
        let mut got = Vec::new();
        let mut carried_b = carried_b;
        carried_b.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn plain_payloads_carry_no_fds() {
        let (tx, rx) = UnixStream::pair().unwrap();
        send_with_fds(tx.as_raw_fd(), b"no fds here", &[]).unwrap();
        let mut buf = [0u8; 32];
        let (n, fds) = recv_with_fds(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"no fds here");
        assert!(fds.is_empty());
    }
}
