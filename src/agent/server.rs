//! Pod registration listener.
//!
//! Pods on the same host discover the agent through the `.port` sidecar
//! file, connect over TCP, and send their 4-byte big-endian process id. The
//! agent answers with the fixed-width name of a freshly created shared page
//! and closes the socket; the handler thread then runs the pod's RDMA
//! session until teardown.
//!
//! A failing handler kills only itself: the accept loop survives, the pod's
//! resources are released, and the shared object name is reused on retry.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};
use socket2::{Domain, Socket, Type};

use crate::config::PORT_FILE;
use crate::shm::{self, SharedPage, NAME_WIRE_LEN};

use super::{session, AgentCtx};

/// Bind the registration listener, publish the `.port` sidecar, and serve
/// registrations forever.
pub fn run(ctx: Arc<AgentCtx>) -> Result<()> {
    let listener = bind_listener(ctx.config.listen_port)?;
    let port = listener.local_addr()?.port();

    let sidecar = ctx.config.work_dir.join(PORT_FILE);
    std::fs::write(&sidecar, port.to_string())
        .with_context(|| format!("failed to write {:?}", sidecar))?;
    log::info!("agent listening for pods on port {}", port);

    loop {
        match listener.accept() {
            Ok((stream, from)) => {
                let ctx = Arc::clone(&ctx);
                thread::Builder::new()
                    .name("pod-handler".to_owned())
                    .spawn(move || {
                        if let Err(e) = handle_pod(&ctx, stream) {
                            log::error!("pod handler ({}) failed: {:#}", from, e);
                        }
                    })
                    .with_context(|| "failed to spawn pod handler")?;
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
}

/// `SO_REUSEADDR` must be set before bind so agent restarts do not stall in
/// TIME_WAIT.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind registration listener to {}", addr))?;
    socket.listen(5)?;
    Ok(socket.into())
}

/// Serve one pod: handshake, then the RDMA session until it ends.
fn handle_pod(ctx: &AgentCtx, mut stream: TcpStream) -> Result<()> {
    let mut pid_buf = [0u8; 4];
    stream
        .read_exact(&mut pid_buf)
        .with_context(|| "failed to read pod id")?;
    let pid = u32::from_be_bytes(pid_buf);
    log::info!("new pod {} registered", pid);

    let name = shm::page_name(pid);
    let page = SharedPage::create(&name, ctx.config.block_size)?;

    let mut name_buf = [0u8; NAME_WIRE_LEN];
    name_buf[..name.len()].copy_from_slice(name.as_bytes());
    stream
        .write_all(&name_buf)
        .with_context(|| "failed to send page name")?;
    drop(stream);

    let result = session::run(ctx, pid, page);

    match shm::unlink(&name) {
        Ok(()) => log::debug!("pod {}: unlinked {}", pid, name),
        Err(e) if ctx.config.ignore_unlink_errors => {
            // Known to fail intermittently in deployment; cause not yet
            // pinned down.
            log::warn!("pod {}: {}", pid, e);
        }
        Err(e) => return result.and(Err(e.into())),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PodRegistry;
    use crate::config::AgentConfig;
    use std::time::Duration;

    fn test_ctx(dir: &std::path::Path) -> Arc<AgentCtx> {
        Arc::new(AgentCtx {
            config: AgentConfig {
                // Nothing listens here; the RDMA session will fail fast and
                // the handler must clean up without touching the handshake.
                peer_addr: "127.0.0.1".to_owned(),
                peer_port: 1,
                work_dir: dir.to_path_buf(),
                ..AgentConfig::default()
            },
            registry: PodRegistry::new(),
        })
    }

    fn read_sidecar_port(dir: &std::path::Path) -> u16 {
        let path = dir.join(PORT_FILE);
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(&path) {
                return s.trim().parse().unwrap();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("no {:?} sidecar", path);
    }

    #[test]
    fn handshake_returns_padded_page_name() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        thread::spawn(move || {
            let _ = run(ctx);
        });
        let port = read_sidecar_port(dir.path());

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&4242u32.to_be_bytes()).unwrap();

        let mut name_buf = [0u8; NAME_WIRE_LEN];
        stream.read_exact(&mut name_buf).unwrap();
        let name = std::str::from_utf8(&name_buf)
            .unwrap()
            .trim_end_matches('\0');
        assert_eq!(name, "shm-4242");
        // Server closes after the name.
        assert_eq!(stream.read(&mut [0u8; 1]).unwrap(), 0);
    }

    #[test]
    fn accept_loop_survives_a_bad_client() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        thread::spawn(move || {
            let _ = run(ctx);
        });
        let port = read_sidecar_port(dir.path());

        // Connect and hang up without sending a pod id.
        drop(TcpStream::connect(("127.0.0.1", port)).unwrap());

        // A well-behaved pod must still be admitted.
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&7u32.to_be_bytes()).unwrap();
        let mut name_buf = [0u8; NAME_WIRE_LEN];
        stream.read_exact(&mut name_buf).unwrap();
        assert!(name_buf.starts_with(b"shm-7\0"));
    }
}
