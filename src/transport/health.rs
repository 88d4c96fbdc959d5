//! Transport health probe for stream sockets.
//!
//! On Linux the probe reads the kernel's TCP state through `TCP_INFO`: only
//! `ESTABLISHED` counts as healthy, so a peer that sent FIN (`CLOSE_WAIT`) or
//! reset the connection is reported as gone even while unread bytes remain.
//! Elsewhere the probe falls back to a pending-error check and a
//! non-blocking peek.

use std::net::TcpStream;

#[cfg(target_os = "linux")]
const TCP_ESTABLISHED: u8 = 1;

/// Returns true while `stream` is still an established connection.
#[cfg(target_os = "linux")]
pub fn is_established(stream: &TcpStream) -> bool {
    use std::os::fd::AsRawFd;

    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    // SAFETY: `info` is a properly sized, writable tcp_info and `len` holds
    // its size; the kernel writes at most `len` bytes.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };

    rc == 0 && info.tcpi_state == TCP_ESTABLISHED
}

/// Returns true while `stream` is still an established connection.
#[cfg(not(target_os = "linux"))]
pub fn is_established(stream: &TcpStream) -> bool {
    use std::io::ErrorKind;

    if stream.peer_addr().is_err() {
        return false;
    }
    if !matches!(stream.take_error(), Ok(None)) {
        return false;
    }

    // The relay keeps peer sockets non-blocking already.
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => err.kind() == ErrorKind::WouldBlock,
    }
}
