//! Streaming exec: an ephemeral child container with FD-wired stdio.
//!
//! Each invocation creates a weak child inside the target container, hands
//! the backend `/dev/fd/<n>` paths pointing at our end of a PTY or pipe
//! set, and shuttles bytes between those FDs and the kubelet connection
//! until the child exits. The weak flag makes the backend reap the child
//! if this connection dies abruptly.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::pty::openpty;
use nix::unistd::pipe;
use portoshim_client::rpc::{TContainerCommandArgv, TContainerSpec};
use portoshim_client::PortoClient;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command;
use crate::config::ShimConfig;
use crate::error::{Result, ShimError};
use crate::ids::create_id;

/// One requested exec session, registered by the gRPC `Exec` verb and
/// executed when kubelet connects to the streaming URL.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

fn dev_fd(fd: &OwnedFd) -> String {
    format!("/dev/fd/{}", fd.as_raw_fd())
}

fn spawn_copy(
    mut from: impl Read + Send + 'static,
    mut to: impl Write + Send + 'static,
    name: &'static str,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = std::io::copy(&mut from, &mut to) {
            debug!(stream = name, error = %err, "exec copy ended");
        }
        let _ = to.flush();
    })
}

/// Run one exec session over an upgraded kubelet connection.
pub async fn run(
    config: Arc<ShimConfig>,
    spec: ExecSpec,
    stream: tokio::net::TcpStream,
) -> Result<()> {
    let mut pc = PortoClient::connect(&config.porto_socket).await?;

    let id = format!("{}/{}", spec.container_id, create_id("exec"));
    pc.create_weak(&id).await?;

    let argv = command::resolve(
        &spec.cmd,
        &[],
        &[],
        &[],
        &config.root_path(&spec.container_id),
    );
    pc.update_from_spec(TContainerSpec {
        name: Some(id.clone()),
        env: None,
        command_argv: Some(TContainerCommandArgv { argv }),
    })
    .await?;

    pc.set_property(&id, "isolate", "false").await?;
    pc.set_property(&id, "net", "inherited").await?;

    let stream = stream.into_std().map_err(ShimError::Io)?;
    stream.set_nonblocking(false).map_err(ShimError::Io)?;

    let mut copies: Vec<JoinHandle<()>> = Vec::new();

    if spec.tty {
        // One PTY pair: the child gets the slave on all three streams,
        // we shuttle bytes through the master.
        let pty = openpty(None, None).map_err(|err| ShimError::Io(err.into()))?;

        if spec.stdin {
            pc.set_property(&id, "stdin_path", &dev_fd(&pty.slave)).await?;
        }
        pc.set_property(&id, "stdout_path", &dev_fd(&pty.slave)).await?;
        pc.set_property(&id, "stderr_path", &dev_fd(&pty.slave)).await?;

        pc.start(&id).await?;
        drop(pty.slave);

        let master = File::from(pty.master);
        if spec.stdin {
            copies.push(spawn_copy(
                stream.try_clone().map_err(ShimError::Io)?,
                master.try_clone().map_err(ShimError::Io)?,
                "stdin",
            ));
        }
        copies.push(spawn_copy(
            master,
            stream.try_clone().map_err(ShimError::Io)?,
            "stdout",
        ));
    } else {
        let mut stdin_pipe = None;
        let mut stdout_pipe = None;
        let mut stderr_pipe = None;

        if spec.stdin {
            let (read, write) = pipe().map_err(|err| ShimError::Io(err.into()))?;
            pc.set_property(&id, "stdin_path", &dev_fd(&read)).await?;
            stdin_pipe = Some((read, write));
        }
        if spec.stdout {
            let (read, write) = pipe().map_err(|err| ShimError::Io(err.into()))?;
            pc.set_property(&id, "stdout_path", &dev_fd(&write)).await?;
            stdout_pipe = Some((read, write));
        }
        if spec.stderr {
            let (read, write) = pipe().map_err(|err| ShimError::Io(err.into()))?;
            pc.set_property(&id, "stderr_path", &dev_fd(&write)).await?;
            stderr_pipe = Some((read, write));
        }

        pc.start(&id).await?;

        // Close the child-side ends; the copies own the parent side.
        if let Some((read, write)) = stdin_pipe {
            drop(read);
            copies.push(spawn_copy(
                stream.try_clone().map_err(ShimError::Io)?,
                File::from(write),
                "stdin",
            ));
        }
        if let Some((read, write)) = stdout_pipe {
            drop(write);
            copies.push(spawn_copy(
                File::from(read),
                stream.try_clone().map_err(ShimError::Io)?,
                "stdout",
            ));
        }
        if let Some((read, write)) = stderr_pipe {
            drop(write);
            copies.push(spawn_copy(
                File::from(read),
                stream.try_clone().map_err(ShimError::Io)?,
                "stderr",
            ));
        }
    }

    if let Err(err) = pc.wait(&[id.clone()], None).await {
        warn!(exec = %id, error = %err, "wait failed");
    }

    // Unblock the copy tasks and let them drain.
    let _ = stream.shutdown(std::net::Shutdown::Both);
    for copy in copies {
        let _ = copy.await;
    }

    // Dropping the connection reaps the weak child.
    Ok(())
}
