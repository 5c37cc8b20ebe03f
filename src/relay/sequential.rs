//! Sequential policy (normal mode): try each target in order, first
//! success wins.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error};

use super::outbound::{self, OutboundConn};
use super::Services;
use crate::config::Rule;

/// Handle one accepted connection in normal mode. Failure of every target
/// closes the incoming connection.
pub async fn handle(client: TcpStream, rule: Arc<Rule>, services: Arc<Services>) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let mut target: Option<(OutboundConn, &str)> = None;
    for candidate in &rule.targets {
        match outbound::dial(&services, &candidate.address).await {
            Ok(conn) => {
                target = Some((conn, &candidate.address));
                break;
            }
            Err(e) => {
                error!(
                    rule = %rule.name,
                    remote = %peer,
                    target = %candidate.address,
                    error = %e,
                    "unable to establish connection, trying next target"
                );
            }
        }
    }

    let Some((conn, addr)) = target else {
        error!(rule = %rule.name, remote = %peer, "all targets failed, dropping connection");
        return;
    };

    debug!(rule = %rule.name, remote = %peer, target = %addr, "established");
    conn.relay(client).await;
}
