//! Raw-mode tty access through termios.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use crate::channel::{LineChannel, ReadTimeout};

/// A serial device opened in raw 8N1 mode.
#[derive(Debug)]
pub struct SerialPort {
    file: File,
    timeout: Option<Duration>,
}

fn speed(baud: u32) -> io::Result<libc::speed_t> {
    Ok(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

impl SerialPort {
    pub fn open(path: &Path, baud: u32) -> io::Result<Self> {
        let rate = speed(baud)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)?;
        let fd = file.as_raw_fd();

        // SAFETY: fd is a valid open descriptor owned by `file`; termios is
        // plain data fully initialized by tcgetattr before use.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut tio);
            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;
            if libc::cfsetispeed(&mut tio, rate) != 0 || libc::cfsetospeed(&mut tio, rate) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::tcflush(fd, libc::TCIOFLUSH);
        }
        tracing::debug!(path = %path.display(), baud, "serial port configured");
        Ok(Self {
            file,
            timeout: None,
        })
    }

    fn wait_readable(&self) -> io::Result<bool> {
        let millis = match self.timeout {
            None => -1,
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
        };
        let mut fds = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one pollfd on the stack, count matches.
            let rc = unsafe { libc::poll(&mut fds, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.wait_readable()? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "serial read timed out"));
        }
        self.file.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // SAFETY: valid descriptor owned by self.file.
        if unsafe { libc::tcdrain(self.file.as_raw_fd()) } != 0 {
            let err = io::Error::last_os_error();
            // Not a tty (e.g. a pty stand-in); nothing to drain.
            if err.raw_os_error() != Some(libc::ENOTTY) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl ReadTimeout for SerialPort {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// Open `path` at `baud` and frame replies on `terminator`.
pub fn open_serial_port(
    path: impl AsRef<Path>,
    baud: u32,
    terminator: &[u8],
) -> io::Result<LineChannel<SerialPort>> {
    let path = path.as_ref();
    let port = SerialPort::open(path, baud)?;
    Ok(LineChannel::new(port, terminator, path.display().to_string()))
}
