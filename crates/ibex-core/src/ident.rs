use std::{fmt, io, net::SocketAddr};

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Well-known public resolvers used only to pick the outbound interface; nothing is sent.
const ROUTE_PROBES: [&str; 2] = ["223.5.5.5:80", "8.8.8.8:80"];

#[derive(Error, Debug)]
pub enum IdentError {
    #[error("no route to determine local ip: {0}")]
    NoRoute(#[source] io::Error),
    #[error("read hostname: {0}")]
    Hostname(#[source] io::Error),
    #[error("hostname is not valid utf-8")]
    NotUtf8,
    #[error("ident is empty")]
    Empty,
}

/// How this agent names itself in `Server.Report`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostIdent {
    Literal(String),
    /// `$ip`: address of the interface that routes to the outside.
    Ip,
    /// `$hostname`
    Hostname,
}

impl HostIdent {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "$ip" => HostIdent::Ip,
            "$hostname" => HostIdent::Hostname,
            other => HostIdent::Literal(other.to_string()),
        }
    }

    pub async fn resolve(&self) -> Result<String, IdentError> {
        let ident = match self {
            HostIdent::Literal(s) => s.clone(),
            HostIdent::Ip => local_ip().await?,
            HostIdent::Hostname => hostname::get()
                .map_err(IdentError::Hostname)?
                .into_string()
                .map_err(|_| IdentError::NotUtf8)?,
        };
        if ident.is_empty() {
            return Err(IdentError::Empty);
        }
        Ok(ident)
    }
}

impl fmt::Display for HostIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostIdent::Literal(s) => f.write_str(s),
            HostIdent::Ip => f.write_str("$ip"),
            HostIdent::Hostname => f.write_str("$hostname"),
        }
    }
}

async fn local_ip() -> Result<String, IdentError> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no probe address");
    for probe in ROUTE_PROBES {
        match route_from(probe).await {
            Ok(addr) => return Ok(addr.ip().to_string()),
            Err(e) => {
                debug!(target: "ibex.heartbeat", probe, error = %e, "route probe failed");
                last = e;
            }
        }
    }
    Err(IdentError::NoRoute(last))
}

async fn route_from(probe: &str) -> io::Result<SocketAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(probe).await?;
    socket.local_addr()
}
