//! HELO feature negotiation.

use crate::engine::EngineResult;
use crate::protocol::{Datatype, Feature, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use tracing::debug;

pub(super) fn hello_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let request = cookie.request().clone();

    if !request.key().is_empty() {
        let agent = String::from_utf8_lossy(request.key()).into_owned();
        conn.set_agent_name(agent);
    }

    let requested: Vec<u16> = request
        .value()
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let mut accepted: Vec<Feature> = Vec::new();
    for code in &requested {
        let Some(feature) = Feature::from_u16(*code) else {
            continue;
        };
        if accepted.contains(&feature) {
            continue;
        }
        let accept = match feature {
            // Nagle toggles are mutually exclusive; the later one wins.
            Feature::TcpNodelay => !requested_contains(&requested, Feature::TcpDelay),
            Feature::TcpDelay => !requested_contains(&requested, Feature::TcpNodelay),
            // Push notifications need a channel the server may write to
            // at will.
            Feature::ClustermapChangeNotification => {
                requested_contains(&requested, Feature::Duplex)
            }
            // A CDC session has its own ordering contract.
            Feature::UnorderedExecution => conn.dcp().is_none(),
            Feature::Tls => false,
            _ => true,
        };
        if accept {
            accepted.push(feature);
        }
    }

    for feature in &accepted {
        conn.features_mut().enable(*feature);
    }
    conn.reset_budget();

    debug!(
        "{}: hello from {:?}: accepted {:?}",
        conn.id(),
        conn.agent_name(),
        accepted
    );

    let mut body = Vec::with_capacity(accepted.len() * 2);
    for feature in accepted {
        body.extend_from_slice(&(feature as u16).to_be_bytes());
    }
    cookie.send_response(conn, Status::Success, &[], &[], &body, Datatype::RAW, 0)
}

fn requested_contains(requested: &[u16], feature: Feature) -> bool {
    requested.contains(&(feature as u16))
}
