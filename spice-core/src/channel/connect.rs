//! Opening a linked transport for one channel.

use std::time::Duration;

use tracing::{debug, info};

use crate::capabilities::Capabilities;
use crate::config::Target;
use crate::error::SpiceError;
use crate::link::{self, LinkError, LinkRequest};
use crate::message::ChannelIdentity;
use crate::transport::{self, Peer};

use super::env::ChannelEnv;

/// Connect and link `identity` to `target`, honoring the channel's
/// connection mode: unsecure first when allowed, then TLS when the
/// server demands it or unsecure is not allowed.
pub(crate) async fn establish(
    env: &ChannelEnv,
    target: &Target,
    identity: ChannelIdentity,
    caps: &Capabilities,
    connection_id: u32,
    deadline: Duration,
) -> Result<(Peer, Capabilities), SpiceError> {
    let request = LinkRequest {
        connection_id,
        identity,
        caps,
        password: env.password(),
    };
    tokio::time::timeout(deadline, open(env, target, &request))
        .await
        .map_err(|_| SpiceError::Timeout(deadline))?
}

async fn open(
    env: &ChannelEnv,
    target: &Target,
    request: &LinkRequest<'_>,
) -> Result<(Peer, Capabilities), SpiceError> {
    let mode = env.options.mode_for(request.identity.channel_type);
    let host = target.host.as_str();

    if let (true, Some(port)) = (mode.allow_unsecure(), target.port) {
        debug!(channel = %request.identity, host, port, "connecting");
        let mut peer = transport::connect_unsecure(host, port).await?;
        match link::link(&mut peer, request, env.sealer()).await {
            Ok(remote) => return Ok((peer, remote)),
            Err(SpiceError::Link(LinkError::NeedSecured))
                if mode.allow_secure() && target.sport.is_some() =>
            {
                info!(channel = %request.identity, "server requires TLS; switching to secure port");
                peer.close();
            }
            Err(e) => return Err(e),
        }
    }

    if let (true, Some(sport)) = (mode.allow_secure(), target.sport) {
        debug!(channel = %request.identity, host, sport, "connecting over TLS");
        let mut peer = transport::connect_secure(&env.options.host_auth, host, sport).await?;
        let remote = link::link(&mut peer, request, env.sealer()).await?;
        return Ok((peer, remote));
    }

    Err(SpiceError::ConnectFailed {
        addr: host.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no port allowed for {mode:?} connections"),
        ),
    })
}
