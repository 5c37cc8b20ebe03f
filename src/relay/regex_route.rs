//! First-packet regex routing.
//!
//! Reads up to 4096 bytes of the client's first packet under the rule's
//! read deadline, matches each target's precompiled pattern in order, and
//! replays the captured bytes to the chosen target before piping.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error};

use super::outbound;
use super::Services;
use crate::config::Rule;

/// Maximum first-packet capture.
const FIRST_PACKET_LIMIT: usize = 4096;

/// Handle one accepted connection in regex mode. An unreadable first
/// packet or an unmatched one drops the connection.
pub async fn handle(mut client: TcpStream, rule: Arc<Rule>, services: Arc<Services>) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let deadline = Duration::from_millis(rule.timeout.max(1));
    let mut first_packet = vec![0u8; FIRST_PACKET_LIMIT];
    let n = match timeout(deadline, client.read(&mut first_packet)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => {
            debug!(rule = %rule.name, remote = %peer, "client closed before first packet");
            return;
        }
        Ok(Err(e)) => {
            error!(rule = %rule.name, remote = %peer, error = %e, "failed to read first packet");
            return;
        }
        Err(_) => {
            error!(rule = %rule.name, remote = %peer, "first packet deadline exceeded");
            return;
        }
    };
    first_packet.truncate(n);

    // First matching pattern picks the target; a failed dial tries the
    // remaining matches.
    let mut conn = None;
    for target in &rule.targets {
        let Some(re) = &target.pattern else { continue };
        if !re.is_match(&first_packet) {
            continue;
        }
        match outbound::dial(&services, &target.address).await {
            Ok(c) => {
                conn = Some((c, &target.address));
                break;
            }
            Err(e) => {
                error!(
                    rule = %rule.name,
                    remote = %peer,
                    target = %target.address,
                    error = %e,
                    "unable to establish connection"
                );
            }
        }
    }

    let Some((mut conn, addr)) = conn else {
        error!(rule = %rule.name, remote = %peer, "no pattern matched, dropping connection");
        return;
    };

    debug!(rule = %rule.name, remote = %peer, target = %addr, "established");

    // Replay the captured bytes before any further bytes flow.
    if let Err(e) = conn.write_all(&first_packet).await {
        error!(rule = %rule.name, target = %addr, error = %e, "first packet replay failed");
        return;
    }
    conn.relay(client).await;
}
