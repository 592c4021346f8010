use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client;
use russh::keys::known_hosts::{known_host_keys_path, learn_known_hosts_path};
use russh::keys::ssh_key;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::AsyncWriteExt;

use backy_types::content_id::ContentId;
use backy_types::error::{BackyError, Result};

use super::{Credential, RemoteStore, RemoteTarget, ASYNC_RUNTIME};

/// Connection timeout for the SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout for an established session. Hitting it surfaces as a
/// transient transfer error; the next attempt reconnects.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH client handler that enforces known-host checks (TOFU).
struct SshHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match verify_or_learn_host_key(
            &self.host,
            self.port,
            &self.known_hosts_path,
            server_public_key,
        ) {
            Ok(HostKeyState::Matched) => Ok(true),
            Ok(HostKeyState::Learned) => {
                tracing::warn!(
                    host = %self.host,
                    port = self.port,
                    "learned new SSH host key via TOFU"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    host = %self.host,
                    port = self.port,
                    "SSH host key verification failed: {e}"
                );
                Err(e)
            }
        }
    }
}

/// Outcome of host key verification.
enum HostKeyState {
    Matched,
    Learned,
}

/// An active SSH + SFTP connection.
struct SftpConn {
    sftp: SftpSession,
    // Keep handle alive so the session isn't dropped.
    _session: client::Handle<SshHandler>,
}

/// SFTP transporter for one backup job.
///
/// Holds at most one SSH+SFTP connection, established lazily and discarded
/// after a transient failure so the retry layer reconnects cleanly.
/// Sessions are never shared across jobs. The remote mirrors the local
/// store layout: `chunks/<shard>/<hex>` and `manifests/<name>` under the
/// target's base path.
pub struct SftpTransporter {
    target: RemoteTarget,
    root: String,
    conn: Mutex<Option<SftpConn>>,
}

impl SftpTransporter {
    pub fn new(target: RemoteTarget) -> Self {
        let root = normalize_root(&target.remote_path);
        Self {
            target,
            root,
            conn: Mutex::new(None),
        }
    }

    fn chunk_key(&self, id: &ContentId) -> String {
        join_root(&self.root, &format!("chunks/{}/{}", id.shard_prefix(), id.to_hex()))
    }

    fn manifest_key(&self, name: &str) -> String {
        join_root(&self.root, &format!("manifests/{name}"))
    }

    /// Run `op` with a live session, connecting first if none is cached.
    /// A transient failure discards the connection so the next call
    /// reconnects from scratch.
    fn with_conn<T>(&self, op_name: &str, op: impl FnOnce(&SftpSession) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(ASYNC_RUNTIME.block_on(connect(&self.target))?);
        }
        let conn = match guard.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection established above"),
        };

        let result = op(&conn.sftp);
        if let Err(e) = &result {
            if e.is_transient() {
                tracing::debug!("SFTP {op_name}: dropping connection after transient error: {e}");
                *guard = None;
            }
        }
        result
    }

    /// Upload a body: parents created on demand, bytes staged under a
    /// `.part` name and renamed into place so an interrupted transfer never
    /// leaves a valid-looking entry.
    fn upload(&self, path: &str, data: &[u8]) -> Result<()> {
        let part = format!("{path}.part");
        self.with_conn("put", |sftp| {
            ASYNC_RUNTIME.block_on(async {
                if let Some((parent, _)) = path.rsplit_once('/') {
                    if !parent.is_empty() {
                        mkdir_p(sftp, parent).await?;
                    }
                }

                let mut file = sftp
                    .open_with_flags(
                        &part,
                        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                    )
                    .await
                    .map_err(|e| sftp_error("create", &part, e))?;
                file.write_all(data)
                    .await
                    .map_err(|e| io_error("write", &part, e))?;
                file.flush()
                    .await
                    .map_err(|e| io_error("flush", &part, e))?;
                file.shutdown()
                    .await
                    .map_err(|e| io_error("close", &part, e))?;

                // SFTP renames fail on existing targets; clear any stale
                // entry first. A not-found failure here is fine — rename
                // reports anything else.
                let _ = sftp.remove_file(path).await;
                sftp.rename(part.as_str(), path)
                    .await
                    .map_err(|e| sftp_error("rename", path, e))?;
                Ok(())
            })
        })
    }
}

impl RemoteStore for SftpTransporter {
    fn prepare(&self) -> Result<()> {
        self.with_conn("connect", |_| Ok(()))
    }

    fn has_chunk(&self, id: &ContentId) -> Result<bool> {
        let path = self.chunk_key(id);
        self.with_conn("stat", |sftp| {
            ASYNC_RUNTIME.block_on(async {
                match sftp.metadata(&path).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(sftp_error("stat", &path, e)),
                }
            })
        })
    }

    fn put_chunk(&self, id: &ContentId, data: &[u8]) -> Result<()> {
        self.upload(&self.chunk_key(id), data)
    }

    fn put_manifest(&self, name: &str, data: &[u8]) -> Result<()> {
        self.upload(&self.manifest_key(name), data)
    }

    fn location(&self, name: &str) -> String {
        let path = if name.is_empty() {
            join_root(&self.root, "manifests")
        } else {
            self.manifest_key(name)
        };
        format!(
            "sftp://{}@{}:{}{path}",
            self.target.username, self.target.host, self.target.port
        )
    }
}

/// Establish a new SSH + SFTP connection and authenticate.
async fn connect(target: &RemoteTarget) -> Result<SftpConn> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..Default::default()
    });
    let handler = SshHandler {
        host: target.host.clone(),
        port: target.port,
        known_hosts_path: default_known_hosts_path()?,
    };

    let addr = (target.host.as_str(), target.port);
    let mut session = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
        .await
        .map_err(|_| {
            BackyError::Network(format!(
                "SSH connect to {}:{} timed out after {}s",
                target.host,
                target.port,
                CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| ssh_error("connect", target, e))?;

    let auth = match &target.credential {
        Credential::Password(password) => session
            .authenticate_password(&target.username, password)
            .await
            .map_err(|e| ssh_error("authenticate", target, e))?,
        Credential::KeyFile(key_path) => {
            let key = load_secret_key(key_path, None).map_err(|e| {
                BackyError::Auth(format!("load SSH key {}: {e}", key_path.display()))
            })?;
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .map_err(|e| ssh_error("negotiate hash algorithm", target, e))?
                .flatten();
            session
                .authenticate_publickey(
                    &target.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| ssh_error("authenticate", target, e))?
        }
    };

    if !auth.success() {
        return Err(BackyError::Auth(format!(
            "credentials rejected for user '{}' on {}:{}",
            target.username, target.host, target.port
        )));
    }

    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| ssh_error("open channel", target, e))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| ssh_error("request sftp subsystem", target, e))?;
    let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
        sftp_error(
            "session init",
            &format!("{}:{}", target.host, target.port),
            e,
        )
    })?;

    Ok(SftpConn {
        sftp,
        _session: session,
    })
}

/// Normalize the configured remote base path.
fn normalize_root(root: &str) -> String {
    let root = root.trim_matches('/');
    if root.is_empty() {
        "/".to_string()
    } else {
        format!("/{root}")
    }
}

fn join_root(root: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if root == "/" {
        format!("/{key}")
    } else {
        format!("{root}/{key}")
    }
}

fn default_known_hosts_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BackyError::Storage("cannot determine home directory".into()))?;

    #[cfg(target_os = "windows")]
    {
        Ok(home.join("ssh").join("known_hosts"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(home.join(".ssh").join("known_hosts"))
    }
}

fn ensure_known_hosts_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    let open_result = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o600)
            .open(path)
    };

    #[cfg(not(unix))]
    let open_result = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path);

    match open_result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn verify_or_learn_host_key(
    host: &str,
    port: u16,
    known_hosts_path: &Path,
    server_public_key: &ssh_key::PublicKey,
) -> std::result::Result<HostKeyState, russh::Error> {
    ensure_known_hosts_file(known_hosts_path).map_err(russh::Error::IO)?;

    let known = known_host_keys_path(host, port, known_hosts_path)?;
    if known
        .iter()
        .any(|(_, existing_key)| existing_key == server_public_key)
    {
        return Ok(HostKeyState::Matched);
    }

    if known.is_empty() {
        learn_known_hosts_path(host, port, server_public_key, known_hosts_path)?;
        return Ok(HostKeyState::Learned);
    }

    Err(russh::Error::KeyChanged { line: known[0].0 })
}

/// Map SSH-level errors: transient link failures become `Network` so the
/// retry layer reconnects; protocol and host-key failures are trust
/// problems and map to `Auth`, which is never retried.
fn ssh_error(op: &str, target: &RemoteTarget, e: russh::Error) -> BackyError {
    let msg = format!("SSH {op} {}:{}: {e}", target.host, target.port);
    if is_retryable_ssh_error(&e) {
        BackyError::Network(msg)
    } else {
        BackyError::Auth(msg)
    }
}

fn sftp_error(op: &str, path: &str, e: russh_sftp::client::error::Error) -> BackyError {
    let msg = format!("SFTP {op} '{path}': {e}");
    if is_retryable_sftp_error(&e) {
        BackyError::Transfer(msg)
    } else {
        BackyError::Storage(msg)
    }
}

fn io_error(op: &str, path: &str, e: std::io::Error) -> BackyError {
    let retryable = matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
    );

    let msg = format!("SFTP {op} '{path}': {e}");
    if retryable {
        BackyError::Transfer(msg)
    } else {
        BackyError::Storage(msg)
    }
}

fn is_retryable_ssh_error(e: &russh::Error) -> bool {
    matches!(
        e,
        russh::Error::KexInit
            | russh::Error::Kex
            | russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::ConnectionTimeout
            | russh::Error::KeepaliveTimeout
            | russh::Error::InactivityTimeout
            | russh::Error::SendError
            | russh::Error::Pending
            | russh::Error::IO(_)
            | russh::Error::Elapsed(_)
    )
}

fn is_retryable_sftp_error(e: &russh_sftp::client::error::Error) -> bool {
    match e {
        russh_sftp::client::error::Error::Timeout => true,
        russh_sftp::client::error::Error::IO(_) => true,
        russh_sftp::client::error::Error::Limited(_) => true,
        russh_sftp::client::error::Error::UnexpectedPacket => true,
        russh_sftp::client::error::Error::UnexpectedBehavior(_) => true,
        russh_sftp::client::error::Error::Status(status) => matches!(
            status.status_code,
            StatusCode::NoConnection | StatusCode::ConnectionLost | StatusCode::BadMessage
        ),
    }
}

/// Whether an SFTP error indicates "not found".
fn is_not_found(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(s)
            if s.status_code == StatusCode::NoSuchFile
    )
}

/// Recursively create remote parent directories for a path.
async fn mkdir_p(sftp: &SftpSession, path: &str) -> Result<()> {
    let mut current = String::new();
    for component in path.split('/') {
        if component.is_empty() {
            current.push('/');
            continue;
        }
        if current.is_empty() || current == "/" {
            current = format!("{current}{component}");
        } else {
            current = format!("{current}/{component}");
        }
        match sftp.create_dir(&current).await {
            Ok(()) => {}
            Err(e) => match &e {
                russh_sftp::client::error::Error::Status(s)
                    if s.status_code == StatusCode::Failure =>
                {
                    // Likely already exists; verify with metadata.
                    if let Err(meta_err) = sftp.metadata(&current).await {
                        return Err(sftp_error("mkdir", &current, meta_err));
                    }
                }
                _ => {
                    return Err(sftp_error("mkdir", &current, e));
                }
            },
        }
    }
    Ok(())
}
