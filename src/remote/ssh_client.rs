//! libssh2 binding of the remote session capability.

use crate::error_handling::types::RemoteError;
use crate::remote::host_key_verifier::HostKeyVerifier;
use crate::remote::remote_session::{
    ConnectionDetails, ExecStatus, OutputStream, RemoteAuth, RemoteConnector, RemoteEntry,
    RemoteSession,
};
use log::{debug, info, warn};
use ssh2::{Channel, HostKeyType, Session};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const CLOSE_TIMEOUT_MS: u32 = 2_000;
const KEEPALIVE_SECS: u32 = 30;

pub struct SshConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl RemoteConnector for SshConnector {
    fn open(
        &self,
        details: &ConnectionDetails,
        verifier: &HostKeyVerifier,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let connection_failed = |reason: String| RemoteError::ConnectionFailed {
            host: details.host.clone(),
            reason,
        };

        let address = (details.host.as_str(), details.port)
            .to_socket_addrs()
            .map_err(|e| connection_failed(e.to_string()))?
            .next()
            .ok_or_else(|| connection_failed("host did not resolve".to_string()))?;
        let tcp = TcpStream::connect_timeout(&address, self.connect_timeout)
            .map_err(|e| connection_failed(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connection_failed(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.connect_timeout));
        session
            .handshake()
            .map_err(|e| connection_failed(e.to_string()))?;

        match session.host_key() {
            Some((key, key_type)) => {
                verifier.verify(&details.host, details.port, key_type_name(key_type), key)?;
            }
            None => {
                return Err(RemoteError::HostKeyRejected {
                    host: details.host.clone(),
                    reason: "server presented no host key".to_string(),
                })
            }
        }

        let auth = match &details.auth {
            RemoteAuth::Password(password) => {
                session.userauth_password(&details.username, password)
            }
            RemoteAuth::PrivateKey {
                key_pem,
                passphrase,
            } => session.userauth_pubkey_memory(
                &details.username,
                None,
                key_pem,
                passphrase.as_deref(),
            ),
        };
        if let Err(e) = auth {
            debug!("Authentication of {}@{} failed: {}", details.username, details.host, e);
            return Err(RemoteError::AuthenticationFailed(details.username.clone()));
        }
        if !session.authenticated() {
            return Err(RemoteError::AuthenticationFailed(details.username.clone()));
        }

        session.set_keepalive(true, KEEPALIVE_SECS);
        session.set_timeout(millis(self.io_timeout));
        info!(
            "Opened SSH session to {}@{}:{}",
            details.username, details.host, details.port
        );

        Ok(Arc::new(SshRemoteSession {
            host: details.host.clone(),
            io_timeout: self.io_timeout,
            session: Mutex::new(session),
            connected: AtomicBool::new(true),
        }))
    }
}

/// One authenticated libssh2 session. Operations on the same session are serialized by the
/// mutex; distinct sessions run in parallel.
pub struct SshRemoteSession {
    host: String,
    io_timeout: Duration,
    session: Mutex<Session>,
    connected: AtomicBool,
}

impl SshRemoteSession {
    fn lock(&self) -> Result<MutexGuard<'_, Session>, RemoteError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RemoteError::RemoteExecution(format!(
                "session to {} is closed",
                self.host
            )));
        }
        Ok(match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// One non-blocking read of both streams. Returns whether any bytes arrived and whether
    /// the channel reached EOF. The session is back in blocking mode when the lock is released.
    fn poll_output(
        &self,
        channel: &mut Channel,
        buf: &mut [u8],
        output: &mut dyn FnMut(OutputStream, &[u8]),
    ) -> Result<(bool, bool), RemoteError> {
        let session = self.lock()?;
        session.set_blocking(false);
        let polled = read_available(channel, buf, output);
        session.set_blocking(true);
        let progressed = polled.map_err(|e| self.exec_error(e))?;
        Ok((progressed, channel.eof()))
    }

    fn exec_error(&self, e: impl std::fmt::Display) -> RemoteError {
        RemoteError::RemoteExecution(format!("{}: {}", self.host, e))
    }

    fn io_error(&self, e: impl std::fmt::Display) -> RemoteError {
        RemoteError::ChunkIo(format!("{}: {}", self.host, e))
    }
}

impl RemoteSession for SshRemoteSession {
    fn host(&self) -> &str {
        &self.host
    }

    /// The session lock is taken for each libssh2 step and released between polls, so file
    /// operations on the same session interleave with a long-running command.
    fn exec(
        &self,
        command: &str,
        deadline: Instant,
        output: &mut dyn FnMut(OutputStream, &[u8]),
    ) -> Result<ExecStatus, RemoteError> {
        let mut channel = {
            let session = self.lock()?;
            let mut channel = session.channel_session().map_err(|e| self.exec_error(e))?;
            channel.exec(command).map_err(|e| self.exec_error(e))?;
            channel
        };

        let mut buf = [0u8; 8192];
        let finished = drain_until(deadline, || {
            self.poll_output(&mut channel, &mut buf, &mut *output)
        })?;
        if !finished {
            warn!("Command on {} hit its deadline, closing the channel", self.host);
            let session = self.lock()?;
            session.set_timeout(CLOSE_TIMEOUT_MS);
            let _ = channel.close();
            let _ = channel.wait_close();
            session.set_timeout(millis(self.io_timeout));
            return Ok(ExecStatus::TimedOut);
        }

        let _session = self.lock()?;
        channel.wait_close().map_err(|e| self.exec_error(e))?;
        let status = channel.exit_status().map_err(|e| self.exec_error(e))?;
        Ok(ExecStatus::Exited(status))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let session = self.lock()?;
        let sftp = session.sftp().map_err(|e| self.io_error(e))?;
        let listing = sftp
            .readdir(Path::new(path))
            .map_err(|e| self.io_error(e))?;
        let mut entries: Vec<RemoteEntry> = listing
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                Some(RemoteEntry {
                    name,
                    is_dir: stat.is_dir(),
                    size: stat.size,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_size(&self, path: &str) -> Result<u64, RemoteError> {
        let session = self.lock()?;
        let sftp = session.sftp().map_err(|e| self.io_error(e))?;
        let stat = sftp.stat(Path::new(path)).map_err(|e| self.io_error(e))?;
        if stat.is_dir() {
            return Err(self.io_error(format!("{} is a directory", path)));
        }
        stat.size
            .ok_or_else(|| self.io_error(format!("size of {} is unknown", path)))
    }

    fn get_file(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, RemoteError> {
        let session = self.lock()?;
        let sftp = session.sftp().map_err(|e| self.io_error(e))?;
        let mut file = sftp.open(Path::new(path)).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(e))?;
        let mut bytes = Vec::with_capacity(len as usize);
        file.take(len)
            .read_to_end(&mut bytes)
            .map_err(|e| self.io_error(e))?;
        Ok(bytes)
    }

    fn put_file(&self, local: &Path, remote_path: &str) -> Result<u64, RemoteError> {
        let session = self.lock()?;
        let sftp = session.sftp().map_err(|e| self.io_error(e))?;

        if let Some(parent) = Path::new(remote_path).parent() {
            let mut current = PathBuf::new();
            for part in parent.components() {
                current.push(part);
                if current.as_os_str().is_empty() || sftp.stat(&current).is_ok() {
                    continue;
                }
                let created = sftp.mkdir(&current, 0o755);
                settle_mkdir(&current, created, || {
                    sftp.stat(&current).map(|stat| stat.is_dir()).unwrap_or(false)
                })
                .map_err(|e| self.io_error(e))?;
            }
        }

        let mut source = std::fs::File::open(local).map_err(|e| self.io_error(e))?;
        let mut target = sftp
            .create(Path::new(remote_path))
            .map_err(|e| self.io_error(e))?;
        let written = std::io::copy(&mut source, &mut target).map_err(|e| self.io_error(e))?;
        target.flush().map_err(|e| self.io_error(e))?;
        Ok(written)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let session = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        session.set_timeout(CLOSE_TIMEOUT_MS);
        if let Err(e) = session.disconnect(None, "session released", None) {
            debug!("Disconnect from {} failed: {}", self.host, e);
        }
        info!("Closed SSH session to {}", self.host);
    }
}

/// Polls until the channel reports EOF with nothing left to read (`Ok(true)`) or the deadline
/// passes (`Ok(false)`). `poll` owns any locking; nothing is held while sleeping.
fn drain_until(
    deadline: Instant,
    mut poll: impl FnMut() -> Result<(bool, bool), RemoteError>,
) -> Result<bool, RemoteError> {
    loop {
        let (progressed, eof) = poll()?;
        if eof && !progressed {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// A failed mkdir is fine when the directory exists afterwards (another upload created it
/// first); anything else is reported instead of surfacing later as a confusing create error.
fn settle_mkdir(
    dir: &Path,
    created: Result<(), ssh2::Error>,
    exists: impl FnOnce() -> bool,
) -> Result<(), String> {
    match created {
        Ok(()) => Ok(()),
        Err(e) if exists() => {
            debug!("mkdir {} failed but the directory exists: {}", dir.display(), e);
            Ok(())
        }
        Err(e) => {
            warn!("Unable to create remote directory {}: {}", dir.display(), e);
            Err(format!("unable to create directory {}: {}", dir.display(), e))
        }
    }
}

fn read_available(
    channel: &mut Channel,
    buf: &mut [u8],
    output: &mut dyn FnMut(OutputStream, &[u8]),
) -> std::io::Result<bool> {
    let mut progressed = false;
    for stream in [OutputStream::Stdout, OutputStream::Stderr] {
        let read = match stream {
            OutputStream::Stdout => channel.read(buf),
            OutputStream::Stderr => channel.stderr().read(buf),
        };
        match read {
            Ok(n) if n > 0 => {
                output(stream, &buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(progressed)
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_host_key_types_use_openssh_names() {
        assert_eq!(key_type_name(HostKeyType::Ed25519), "ssh-ed25519");
        assert_eq!(key_type_name(HostKeyType::Rsa), "ssh-rsa");
        assert_eq!(
            key_type_name(HostKeyType::Ecdsa256),
            "ecdsa-sha2-nistp256"
        );
    }

    #[test]
    fn test_drain_stops_at_eof_once_output_is_consumed() {
        let mut polls = vec![(true, false), (true, true), (false, true)].into_iter();
        let finished = drain_until(Instant::now() + Duration::from_secs(5), || {
            Ok(polls.next().unwrap_or((false, true)))
        })
        .unwrap();
        assert!(finished);
        assert_eq!(polls.len(), 0);
    }

    #[test]
    fn test_drain_reports_deadline() {
        let started = Instant::now();
        let finished = drain_until(started + Duration::from_millis(50), || Ok((false, false)))
            .unwrap();
        assert!(!finished);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_session_is_free_between_polls() {
        let session = Arc::new(Mutex::new(()));
        let side_calls = Arc::new(AtomicUsize::new(0));

        // A file operation on the same session keeps trying while a command runs.
        let lister = {
            let session = session.clone();
            let side_calls = side_calls.clone();
            std::thread::spawn(move || {
                let until = Instant::now() + Duration::from_millis(150);
                while Instant::now() < until {
                    if session.try_lock().is_ok() {
                        side_calls.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let finished = drain_until(Instant::now() + Duration::from_millis(200), || {
            let _guard = session.lock().unwrap();
            Ok((false, false))
        })
        .unwrap();
        lister.join().unwrap();

        assert!(!finished);
        assert!(side_calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_mkdir_failure_is_reported_unless_directory_exists() {
        let dir = Path::new("/srv/uploads/2024");
        let denied = || Err(ssh2::Error::new(ssh2::ErrorCode::SFTP(3), "permission denied"));

        assert!(settle_mkdir(dir, Ok(()), || false).is_ok());
        assert!(settle_mkdir(dir, denied(), || true).is_ok());

        let error = settle_mkdir(dir, denied(), || false).unwrap_err();
        assert!(error.contains("/srv/uploads/2024"));
        assert!(error.contains("permission denied"));
    }
}
