use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use crate::backend::FuzzyBackend;
use crate::session::StorageContext;
use crate::stats::GenericStat;

/// Close the backend, reopen it, restart the periodic drain.
pub const CONTROL_RELOAD: u8 = 1;
/// Drain the pending queue now (non-final).
pub const CONTROL_SYNC: u8 = 2;
/// Dump statistics to a file whose descriptor rides back on the reply.
pub const CONTROL_STAT: u8 = 3;

/// Reopens the backend on RELOAD.
pub type BackendFactory =
    Arc<dyn Fn() -> Result<Arc<dyn FuzzyBackend>> + Send + Sync>;

fn stat_entry(stat: &GenericStat) -> Value {
    json!({
        "checked": stat.checked,
        "checked_per_hour": stat.checked_ctr.mean,
        "matched": stat.matched,
        "matched_per_hour": stat.matched_ctr.mean,
        "added": stat.added,
        "deleted": stat.deleted,
        "errors": stat.errors,
    })
}

/// Serializes the worker statistics in the layout consumed by the admin
/// tooling.
pub fn stats_document(ctx: &StorageContext, with_ips: bool) -> Value {
    let mut keys = Map::new();
    for (key_id, key) in ctx.keys.iter() {
        let key_stat = key.stat.lock().unwrap();
        let mut entry = stat_entry(&key_stat.stat);

        if with_ips {
            let mut ips = Map::new();
            for (ip, stat) in key_stat.last_ips.iter() {
                ips.insert(ip.to_string(), stat_entry(stat));
            }
            entry["ips"] = Value::Object(ips);
        }

        entry["keypair"] = json!({ "pubkey": key_id.to_base32() });
        keys.insert(key_id.short(), entry);
    }

    let stats = ctx.stats.lock().unwrap();
    let mut doc = json!({
        "keys": keys,
        "fuzzy_stored": stats.hashes_stored,
        "fuzzy_expired": stats.hashes_expired,
        "invalid_requests": stats.invalid_requests,
        "delayed_hashes": stats.delayed_hashes,
        "fuzzy_checked": stats.checked.to_vec(),
        "fuzzy_shingles": stats.shingles_checked.to_vec(),
        "fuzzy_found": stats.found.to_vec(),
    });

    if with_ips {
        let mut errors = Map::new();
        for (ip, count) in ctx.errors_ips.lock().unwrap().iter() {
            errors.insert(ip.to_string(), json!(count));
        }
        doc["errors_ips"] = Value::Object(errors);
    }

    doc
}

/// Writes the stat document to an anonymous temp file and returns its
/// read-positioned descriptor, the mkstemp-then-unlink discipline.
fn stat_file(ctx: &StorageContext) -> Result<std::fs::File> {
    let mut file = tempfile::tempfile().context("cannot make temporary stat file")?;
    let doc = stats_document(ctx, true);
    file.write_all(doc.to_string().as_bytes())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Sends a one-byte status, attaching `fd` via SCM_RIGHTS when present.
fn send_reply(stream: &UnixStream, status: u8, fd: Option<RawFd>) -> std::io::Result<usize> {
    let payload = [status];
    let iov = [std::io::IoSlice::new(&payload)];
    let fds = fd.map(|fd| [fd]);
    let result = match &fds {
        Some(fds) => sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            &[ControlMessage::ScmRights(fds)],
            MsgFlags::empty(),
            None,
        ),
        None => sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
    };
    result.map_err(std::io::Error::from)
}

async fn reply_with_fd(stream: &UnixStream, status: u8, fd: Option<RawFd>) -> Result<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || send_reply(stream, status, fd)) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

async fn handle_client(
    ctx: Arc<StorageContext>,
    factory: BackendFactory,
    mut stream: UnixStream,
) -> Result<()> {
    let mut cmd = [0u8; 1];
    if stream.read_exact(&mut cmd).await.is_err() {
        return Ok(());
    }

    match cmd[0] {
        CONTROL_RELOAD => {
            info!("reloading fuzzy storage after receiving reload command");
            ctx.backend().close().await;
            match factory() {
                Ok(backend) => {
                    ctx.swap_backend(backend);
                    if let Ok(count) = ctx.backend().count().await {
                        ctx.stats.lock().unwrap().hashes_stored = count;
                    }
                    reply_with_fd(&stream, 0, None).await?;
                }
                Err(err) => {
                    error!(error = %err, "cannot open backend after reload");
                    reply_with_fd(&stream, 1, None).await?;
                }
            }
        }
        CONTROL_SYNC => {
            if let Some(queue) = &ctx.queue {
                let backend = ctx.backend();
                if let Ok(count) = backend.count().await {
                    ctx.stats.lock().unwrap().hashes_stored = count;
                }
                queue.drain(&backend, &ctx.stats, false).await;
            }
            reply_with_fd(&stream, 0, None).await?;
        }
        CONTROL_STAT => match stat_file(&ctx) {
            Ok(file) => {
                reply_with_fd(&stream, 0, Some(file.as_raw_fd())).await?;
                // The descriptor was duplicated into the peer; ours closes
                // with `file`.
            }
            Err(err) => {
                error!(error = %err, "cannot serialize fuzzy stats");
                reply_with_fd(&stream, 1, None).await?;
            }
        },
        other => {
            warn!(cmd = other, "unknown control command");
            reply_with_fd(&stream, 2, None).await?;
        }
    }

    Ok(())
}

/// Binds the control socket and serves admin commands until the listener
/// task is dropped.
pub fn spawn_control(
    ctx: Arc<StorageContext>,
    path: PathBuf,
    factory: BackendFactory,
) -> Result<tokio::task::JoinHandle<()>> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("cannot bind control socket {}", path.display()))?;
    info!(path = %path.display(), "control socket ready");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&ctx);
                    let factory = Arc::clone(&factory);
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(ctx, factory, stream).await {
                            error!(error = %err, "control client failed");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "control accept failed");
                    return;
                }
            }
        }
    }))
}

/// Client side of the control protocol; used by the admin CLI and tests.
/// Returns the status byte and the stat file when one was attached.
pub fn control_request(path: &Path, cmd: u8) -> Result<(u8, Option<std::fs::File>)> {
    use std::os::unix::net::UnixStream as StdUnixStream;

    let stream = StdUnixStream::connect(path)
        .with_context(|| format!("cannot connect control socket {}", path.display()))?;
    (&stream).write_all(&[cmd])?;

    let mut status = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut status)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(std::io::Error::from)?;

    let mut file = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // Safety: the kernel just handed us this descriptor.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                file = Some(std::fs::File::from(owned));
            }
        }
    }

    Ok((status[0], file))
}

/// Reads the whole stat document from a descriptor returned by STAT.
pub fn read_stat_document(file: &mut std::fs::File) -> Result<Value> {
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    Ok(serde_json::from_str(&raw)?)
}
