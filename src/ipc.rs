//! Local control channel between a Master launcher and later Slaves.
//!
//! Frames are a 4-byte little-endian length followed by that many bytes of
//! UTF-8.

use crate::cancel::CancelToken;
use crate::error::LaunchError;
use std::io::{self, Read, Write};
use std::path::Path;

pub const MAX_FRAME_LEN: usize = 1 << 20;

pub fn write_frame<W: Write>(writer: &mut W, message: &str) -> Result<(), LaunchError> {
    let len = message.len();
    if len > MAX_FRAME_LEN {
        return Err(LaunchError::Validation(format!(
            "ipc message of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    writer.write_all(&(len as u32).to_le_bytes())?;
    writer.write_all(message.as_bytes())?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<String, LaunchError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(LaunchError::Validation(format!(
            "ipc frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    String::from_utf8(body).map_err(|err| {
        LaunchError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    })
}

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::config::ensure_parent;
    use std::fs;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;
    use tracing::{debug, warn};

    const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

    pub struct IpcServer {
        listener: UnixListener,
        path: PathBuf,
    }

    impl IpcServer {
        /// Binds `path`, replacing any socket left behind by a dead Master.
        pub fn bind(path: &Path) -> Result<Self, LaunchError> {
            ensure_parent(path)?;
            let _ = fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        /// Accepts one frame per connection until `stop` fires.
        pub fn serve(&self, stop: &CancelToken, mut handler: impl FnMut(String)) -> Result<(), LaunchError> {
            while !stop.is_cancelled() {
                match self.listener.accept() {
                    Ok((mut stream, _addr)) => match receive(&mut stream) {
                        Ok(message) => handler(message),
                        Err(err) => debug!(error = %err, "dropping malformed ipc message"),
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(err) => {
                        warn!(error = %err, "ipc accept failed");
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            }
            Ok(())
        }
    }

    impl Drop for IpcServer {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn receive(stream: &mut UnixStream) -> Result<String, LaunchError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        read_frame(stream)
    }

    pub fn send_message(path: &Path, message: &str) -> Result<(), LaunchError> {
        let mut stream = UnixStream::connect(path).map_err(|err| {
            LaunchError::Process(format!(
                "failed to connect ipc socket {}: {}",
                path.display(),
                err
            ))
        })?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
        write_frame(&mut stream, message)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub struct IpcServer;

    impl IpcServer {
        pub fn bind(_path: &Path) -> Result<Self, LaunchError> {
            Err(LaunchError::Config(
                "ipc channel is only supported on unix hosts".to_string(),
            ))
        }

        pub fn serve(&self, _stop: &CancelToken, _handler: impl FnMut(String)) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    pub fn send_message(_path: &Path, _message: &str) -> Result<(), LaunchError> {
        Err(LaunchError::Config(
            "ipc channel is only supported on unix hosts".to_string(),
        ))
    }
}

pub use imp::{send_message, IpcServer};
