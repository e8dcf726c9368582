//! Pod-side registration client.
//!
//! A pod discovers the agent through the `.port` sidecar file, registers by
//! sending its process id, receives the name of its shared page, and maps
//! it read-write. Everything after that — the metric layout inside the page
//! and the update API — is the application's business; updates are plain
//! stores into the mapping, no syscalls involved.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;

use anyhow::{Context as _, Result};

use crate::config::PORT_FILE;
use crate::shm::{SharedPage, NAME_WIRE_LEN};

/// Read the agent's registration port from the `.port` sidecar in `dir`.
pub fn discover_port(dir: &Path) -> Result<u16> {
    let path = dir.join(PORT_FILE);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {:?}", path))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("{:?} does not contain a port", path))
}

/// Register `pid` with the agent and return the assigned page name.
pub fn register(agent: SocketAddr, pid: u32) -> Result<String> {
    let mut stream = TcpStream::connect(agent)
        .with_context(|| format!("failed to connect to agent at {}", agent))?;

    stream
        .write_all(&pid.to_be_bytes())
        .with_context(|| "failed to send pod id")?;

    let mut name_buf = [0u8; NAME_WIRE_LEN];
    stream
        .read_exact(&mut name_buf)
        .with_context(|| "failed to read page name")?;

    let end = name_buf
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_WIRE_LEN);
    let name = std::str::from_utf8(&name_buf[..end])
        .with_context(|| "page name is not ASCII")?
        .to_owned();
    Ok(name)
}

/// Full client flow: discover the agent in `dir`, register, and map the
/// returned page.
pub fn attach(dir: &Path, pid: u32, block_size: usize) -> Result<SharedPage> {
    let port = discover_port(dir)?;
    let agent = SocketAddr::from(([127, 0, 0, 1], port));
    let name = register(agent, pid)?;
    log::info!("pod {}: assigned page {}", pid, name);
    SharedPage::open(&name, block_size)
        .with_context(|| format!("failed to map page {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn discover_port_parses_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PORT_FILE), "12345").unwrap();
        assert_eq!(discover_port(dir.path()).unwrap(), 12345);
    }

    #[test]
    fn discover_port_fails_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_port(dir.path()).is_err());
    }

    #[test]
    fn register_round_trip() {
        // A minimal stand-in for the agent's handshake side.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let agent = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut pid_buf = [0u8; 4];
            stream.read_exact(&mut pid_buf).unwrap();
            let pid = u32::from_be_bytes(pid_buf);

            let mut reply = [0u8; NAME_WIRE_LEN];
            let name = format!("shm-{}", pid);
            reply[..name.len()].copy_from_slice(name.as_bytes());
            stream.write_all(&reply).unwrap();
            pid
        });

        let name = register(agent, 1111).unwrap();
        assert_eq!(name, "shm-1111");
        assert_eq!(server.join().unwrap(), 1111);
    }
}
