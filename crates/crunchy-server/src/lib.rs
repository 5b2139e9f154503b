//! TCP front end for the honeypot: accepts connections, captures
//! credentials, and hands each peer its own sandboxed shell session.

pub mod auth;
pub mod connection;
pub mod telnet;

use crate::connection::{ConnectionContext, handle_connection};
use crunchy_config::ShellConfig;
use crunchy_shell::shutdown_signal;
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Hostname shown to peers: configured, else the host's, else `localhost`.
pub fn resolve_hostname(shell: &ShellConfig) -> String {
    if let Some(hostname) = shell.hostname.as_deref().filter(|name| !name.is_empty()) {
        return hostname.to_string();
    }
    std::fs::read_to_string(KERNEL_HOSTNAME)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Accept loop over a bound listener.
pub struct Server {
    listener: TcpListener,
    context: ConnectionContext,
}

impl Server {
    pub fn new(listener: TcpListener, context: ConnectionContext) -> Self {
        Self { listener, context }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` flips, then wait for every session to close.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let peer = addr.to_string();
                        info!("connection accepted (peer={})", peer);
                        sessions.spawn(handle_connection(
                            stream,
                            peer,
                            self.context.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => warn!("accept failed (error={})", err),
                },
                _ = shutdown_signal(&mut stop) => break,
            }
            while let Some(finished) = sessions.try_join_next() {
                if let Err(err) = finished {
                    warn!("session task failed (error={})", err);
                }
            }
        }
        info!("shutting down (open_sessions={})", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            match finished {
                Ok(end) => debug!("session drained (reason={})", end),
                Err(err) => warn!("session task failed (error={})", err),
            }
        }
    }
}
