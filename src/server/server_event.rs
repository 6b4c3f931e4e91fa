//! Out-of-band messages pushed to clients.
//!
//! Server events queue on a connection's FIFO and are drained by the
//! state machine at idle boundaries, framing server-request packets onto
//! the output stream. An event that cannot make progress (output queue
//! full) reports `false` and is retried on the next wake-up.

use super::connection::Connection;
use crate::protocol::{RequestBuilder, ServerOpcode};
use bytes::{Bytes, BytesMut};

/// A unit of work to be pushed to the client.
pub trait ServerEvent: Send {
    /// Human-readable description for logs.
    fn description(&self) -> String;

    /// Try to push the event. Returns true when consumed, false to retry
    /// on the next event-loop wake-up.
    fn execute(&mut self, conn: &mut Connection) -> bool;
}

/// Forwarded SASL authentication request, pushed to the connection that
/// registered as the external authentication provider.
pub struct AuthenticationRequestEvent {
    /// Correlation token routing the provider's answer back
    pub opaque: u32,
    /// JSON payload with the mechanism, challenge and step flag
    pub payload: String,
}

impl ServerEvent for AuthenticationRequestEvent {
    fn description(&self) -> String {
        format!("authentication request (opaque {:#x})", self.opaque)
    }

    fn execute(&mut self, conn: &mut Connection) -> bool {
        let mut packet = BytesMut::new();
        RequestBuilder::server(ServerOpcode::Authenticate)
            .opaque(self.opaque)
            .value(self.payload.as_bytes())
            .build(&mut packet);
        conn.copy_to_output_stream(&packet).is_ok()
    }
}

/// Periodic broadcast of currently-authenticated external users.
pub struct ActiveUsersEvent {
    /// JSON array of user names
    pub payload: String,
}

impl ServerEvent for ActiveUsersEvent {
    fn description(&self) -> String {
        "active external users".to_string()
    }

    fn execute(&mut self, conn: &mut Connection) -> bool {
        let mut packet = BytesMut::new();
        RequestBuilder::server(ServerOpcode::ActiveExternalUsers)
            .value(self.payload.as_bytes())
            .build(&mut packet);
        conn.copy_to_output_stream(&packet).is_ok()
    }
}

/// Cluster map change notification for the connection's bucket.
pub struct ClustermapNotificationEvent {
    /// Bucket the map belongs to
    pub bucket: String,
    /// Map revision
    pub revision: u64,
    /// The serialized cluster map
    pub config: Bytes,
}

impl ServerEvent for ClustermapNotificationEvent {
    fn description(&self) -> String {
        format!(
            "clustermap change notification ({} rev {})",
            self.bucket, self.revision
        )
    }

    fn execute(&mut self, conn: &mut Connection) -> bool {
        // Only meaningful while the connection is still on this bucket.
        if conn.bucket().name() != self.bucket {
            return true;
        }
        let revision = (self.revision.min(u64::from(u32::MAX)) as u32).to_be_bytes();
        let mut packet = BytesMut::new();
        RequestBuilder::server(ServerOpcode::ClustermapChangeNotification)
            .extras(&revision)
            .key(self.bucket.as_bytes())
            .value(&self.config)
            .build(&mut packet);
        conn.copy_to_output_stream(&packet).is_ok()
    }
}
