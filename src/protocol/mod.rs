//! Binary wire protocol implementation.
//!
//! Every packet on the wire starts with a fixed 24-byte header followed by
//! an optional body. The header layout is identical for requests and
//! responses; the magic byte selects the interpretation of the shared
//! fields (vbucket for requests, status for responses). Alternative
//! "framing" magics prefix the body with a sequence of typed frame-info
//! items carrying per-request meta data such as reorder permission or
//! durability requirements.
//!
//! All integers are big-endian on the wire.

mod builder;
mod frame_info;
mod header;
mod parser;

pub use builder::{RequestBuilder, ResponseBuilder};
pub use frame_info::{
    decode_frame_infos, encode_frame_info, encode_raw_frame_info, DurabilityLevel,
    DurabilityRequirement, FrameInfo, FrameInfoId,
};
pub use header::{Frame, Header, ParseOutcome, HEADER_LEN};
pub use parser::PacketParser;

/// Magic byte identifying the packet family and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Magic {
    /// Request sent from a client
    ClientRequest = 0x80,
    /// Response to a client request
    ClientResponse = 0x81,
    /// Client request with framing extras
    AltClientRequest = 0x08,
    /// Client response with framing extras
    AltClientResponse = 0x18,
    /// Request initiated by the server (push)
    ServerRequest = 0x82,
    /// Response to a server-initiated request
    ServerResponse = 0x83,
}

impl Magic {
    /// Decode a magic byte. Any value outside the six recognized ones is
    /// rejected.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Magic::ClientRequest),
            0x81 => Some(Magic::ClientResponse),
            0x08 => Some(Magic::AltClientRequest),
            0x18 => Some(Magic::AltClientResponse),
            0x82 => Some(Magic::ServerRequest),
            0x83 => Some(Magic::ServerResponse),
            _ => None,
        }
    }

    /// True for the two magics that carry framing extras.
    #[inline]
    pub fn is_alt(self) -> bool {
        matches!(self, Magic::AltClientRequest | Magic::AltClientResponse)
    }

    /// True for request packets (client or server initiated).
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Magic::ClientRequest | Magic::AltClientRequest | Magic::ServerRequest
        )
    }

    /// True for packets flowing in the client protocol (not server push).
    #[inline]
    pub fn is_client(self) -> bool {
        !matches!(self, Magic::ServerRequest | Magic::ServerResponse)
    }
}

/// Command opcodes for client-initiated packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ClientOpcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Getq = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    Getk = 0x0c,
    Getkq = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Setq = 0x11,
    Addq = 0x12,
    Replaceq = 0x13,
    Deleteq = 0x14,
    Incrementq = 0x15,
    Decrementq = 0x16,
    Quitq = 0x17,
    Flushq = 0x18,
    Appendq = 0x19,
    Prependq = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    Gatq = 0x1e,
    Hello = 0x1f,

    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,

    IoctlGet = 0x23,
    IoctlSet = 0x24,

    ConfigValidate = 0x25,
    ConfigReload = 0x26,

    AuditPut = 0x27,
    AuditConfigReload = 0x28,

    Shutdown = 0x29,

    DcpOpen = 0x50,
    DcpAddStream = 0x51,
    DcpCloseStream = 0x52,
    DcpStreamReq = 0x53,
    DcpGetFailoverLog = 0x54,
    DcpStreamEnd = 0x55,
    DcpSnapshotMarker = 0x56,
    DcpMutation = 0x57,
    DcpDeletion = 0x58,
    DcpExpiration = 0x59,
    DcpSetVbucketState = 0x5b,
    DcpNoop = 0x5c,
    DcpBufferAcknowledgement = 0x5d,
    DcpControl = 0x5e,
    DcpSystemEvent = 0x5f,
    DcpPrepare = 0x60,
    DcpSeqnoAcknowledged = 0x61,
    DcpCommit = 0x62,
    DcpAbort = 0x63,

    ListBuckets = 0x87,
    SelectBucket = 0x89,

    GetLocked = 0x94,
    UnlockKey = 0x95,
    GetFailoverLog = 0x96,

    GetMeta = 0xa0,
    GetqMeta = 0xa1,

    SetClusterConfig = 0xb4,
    GetClusterConfig = 0xb5,
    GetRandomKey = 0xb6,

    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    SubdocGetCount = 0xd2,

    IsaslRefresh = 0xf1,
    SslCertsRefresh = 0xf2,
    SetCtrlToken = 0xf4,
    GetCtrlToken = 0xf5,
    UpdateExternalUserPermissions = 0xf6,
    RbacRefresh = 0xf7,
    AuthProvider = 0xf8,
    DropPrivilege = 0xfb,
    GetErrorMap = 0xfe,
}

impl ClientOpcode {
    /// Decode an opcode byte. Opcodes outside the implemented surface
    /// return `None` and fall through to the unknown-command path.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Get,
            0x01 => Self::Set,
            0x02 => Self::Add,
            0x03 => Self::Replace,
            0x04 => Self::Delete,
            0x05 => Self::Increment,
            0x06 => Self::Decrement,
            0x07 => Self::Quit,
            0x08 => Self::Flush,
            0x09 => Self::Getq,
            0x0a => Self::Noop,
            0x0b => Self::Version,
            0x0c => Self::Getk,
            0x0d => Self::Getkq,
            0x0e => Self::Append,
            0x0f => Self::Prepend,
            0x10 => Self::Stat,
            0x11 => Self::Setq,
            0x12 => Self::Addq,
            0x13 => Self::Replaceq,
            0x14 => Self::Deleteq,
            0x15 => Self::Incrementq,
            0x16 => Self::Decrementq,
            0x17 => Self::Quitq,
            0x18 => Self::Flushq,
            0x19 => Self::Appendq,
            0x1a => Self::Prependq,
            0x1b => Self::Verbosity,
            0x1c => Self::Touch,
            0x1d => Self::Gat,
            0x1e => Self::Gatq,
            0x1f => Self::Hello,
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x23 => Self::IoctlGet,
            0x24 => Self::IoctlSet,
            0x25 => Self::ConfigValidate,
            0x26 => Self::ConfigReload,
            0x27 => Self::AuditPut,
            0x28 => Self::AuditConfigReload,
            0x29 => Self::Shutdown,
            0x50 => Self::DcpOpen,
            0x51 => Self::DcpAddStream,
            0x52 => Self::DcpCloseStream,
            0x53 => Self::DcpStreamReq,
            0x54 => Self::DcpGetFailoverLog,
            0x55 => Self::DcpStreamEnd,
            0x56 => Self::DcpSnapshotMarker,
            0x57 => Self::DcpMutation,
            0x58 => Self::DcpDeletion,
            0x59 => Self::DcpExpiration,
            0x5b => Self::DcpSetVbucketState,
            0x5c => Self::DcpNoop,
            0x5d => Self::DcpBufferAcknowledgement,
            0x5e => Self::DcpControl,
            0x5f => Self::DcpSystemEvent,
            0x60 => Self::DcpPrepare,
            0x61 => Self::DcpSeqnoAcknowledged,
            0x62 => Self::DcpCommit,
            0x63 => Self::DcpAbort,
            0x87 => Self::ListBuckets,
            0x89 => Self::SelectBucket,
            0x94 => Self::GetLocked,
            0x95 => Self::UnlockKey,
            0x96 => Self::GetFailoverLog,
            0xa0 => Self::GetMeta,
            0xa1 => Self::GetqMeta,
            0xb4 => Self::SetClusterConfig,
            0xb5 => Self::GetClusterConfig,
            0xb6 => Self::GetRandomKey,
            0xc5 => Self::SubdocGet,
            0xc6 => Self::SubdocExists,
            0xc7 => Self::SubdocDictAdd,
            0xc8 => Self::SubdocDictUpsert,
            0xc9 => Self::SubdocDelete,
            0xca => Self::SubdocReplace,
            0xcb => Self::SubdocArrayPushLast,
            0xcc => Self::SubdocArrayPushFirst,
            0xcd => Self::SubdocArrayInsert,
            0xce => Self::SubdocArrayAddUnique,
            0xcf => Self::SubdocCounter,
            0xd0 => Self::SubdocMultiLookup,
            0xd1 => Self::SubdocMultiMutation,
            0xd2 => Self::SubdocGetCount,
            0xf1 => Self::IsaslRefresh,
            0xf2 => Self::SslCertsRefresh,
            0xf4 => Self::SetCtrlToken,
            0xf5 => Self::GetCtrlToken,
            0xf6 => Self::UpdateExternalUserPermissions,
            0xf7 => Self::RbacRefresh,
            0xf8 => Self::AuthProvider,
            0xfb => Self::DropPrivilege,
            0xfe => Self::GetErrorMap,
            _ => return None,
        })
    }

    /// True for the "quiet" variants that suppress their success response.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            Self::Getq
                | Self::Getkq
                | Self::Setq
                | Self::Addq
                | Self::Replaceq
                | Self::Deleteq
                | Self::Incrementq
                | Self::Decrementq
                | Self::Quitq
                | Self::Flushq
                | Self::Appendq
                | Self::Prependq
                | Self::Gatq
                | Self::GetqMeta
        )
    }

    /// True when the server may execute this command out of order with
    /// respect to other reorder-tagged commands on the same connection.
    pub fn reorder_supported(self) -> bool {
        matches!(
            self,
            Self::Get
                | Self::Getq
                | Self::Getk
                | Self::Getkq
                | Self::GetLocked
                | Self::UnlockKey
                | Self::Touch
                | Self::Gat
                | Self::Gatq
                | Self::SaslListMechs
                | Self::Delete
                | Self::Deleteq
                | Self::IsaslRefresh
                | Self::SslCertsRefresh
                | Self::ListBuckets
                | Self::GetMeta
                | Self::GetqMeta
                | Self::Verbosity
                | Self::AuditPut
                | Self::Increment
                | Self::Decrement
                | Self::Incrementq
                | Self::Decrementq
                | Self::IoctlGet
                | Self::IoctlSet
                | Self::ConfigValidate
                | Self::ConfigReload
                | Self::AuditConfigReload
                | Self::Version
                | Self::GetErrorMap
                | Self::AuthProvider
                | Self::RbacRefresh
        )
    }
}

/// Opcodes for server-initiated push messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOpcode {
    /// Cluster map changed for the connection's bucket
    ClustermapChangeNotification = 0x01,
    /// Authentication request forwarded to an external provider
    Authenticate = 0x02,
    /// Periodic list of active externally-authenticated users
    ActiveExternalUsers = 0x03,
}

impl ServerOpcode {
    /// Decode a server opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ClustermapChangeNotification),
            0x02 => Some(Self::Authenticate),
            0x03 => Some(Self::ActiveExternalUsers),
            _ => None,
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum Status {
    Success = 0x0000,
    KeyEnoent = 0x0001,
    KeyEexists = 0x0002,
    E2big = 0x0003,
    Einval = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,
    NoBucket = 0x0008,
    Locked = 0x0009,
    AuthStale = 0x001f,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    Erange = 0x0022,
    Rollback = 0x0023,
    Eaccess = 0x0024,
    NotInitialized = 0x0025,

    UnknownCommand = 0x0081,
    Enomem = 0x0082,
    NotSupported = 0x0083,
    Einternal = 0x0084,
    Ebusy = 0x0085,
    Etmpfail = 0x0086,
    XattrEinval = 0x0087,
    UnknownCollection = 0x0088,
    NoCollectionsManifest = 0x0089,

    DurabilityInvalidLevel = 0x00a0,
    DurabilityImpossible = 0x00a1,
    SyncWriteInProgress = 0x00a2,
    SyncWriteAmbiguous = 0x00a3,
    SyncWriteReCommitInProgress = 0x00a4,

    SubdocPathEnoent = 0x00c0,
    SubdocPathMismatch = 0x00c1,
    SubdocPathEinval = 0x00c2,
    SubdocPathE2big = 0x00c3,
    SubdocDocE2deep = 0x00c4,
    SubdocValueCantinsert = 0x00c5,
    SubdocDocNotJson = 0x00c6,
    SubdocNumErange = 0x00c7,
    SubdocDeltaEinval = 0x00c8,
    SubdocPathEexists = 0x00c9,
    SubdocValueEtoodeep = 0x00ca,
    SubdocInvalidCombo = 0x00cb,
    SubdocMultiPathFailure = 0x00cc,
    SubdocSuccessDeleted = 0x00cd,
    SubdocXattrInvalidFlagCombo = 0x00ce,
    SubdocXattrInvalidKeyCombo = 0x00cf,
    SubdocXattrUnknownMacro = 0x00d0,
    SubdocMultiPathFailureDeleted = 0x00d3,
}

impl Status {
    /// Decode a wire status code.
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0000 => Self::Success,
            0x0001 => Self::KeyEnoent,
            0x0002 => Self::KeyEexists,
            0x0003 => Self::E2big,
            0x0004 => Self::Einval,
            0x0005 => Self::NotStored,
            0x0006 => Self::DeltaBadval,
            0x0007 => Self::NotMyVbucket,
            0x0008 => Self::NoBucket,
            0x0009 => Self::Locked,
            0x001f => Self::AuthStale,
            0x0020 => Self::AuthError,
            0x0021 => Self::AuthContinue,
            0x0022 => Self::Erange,
            0x0023 => Self::Rollback,
            0x0024 => Self::Eaccess,
            0x0025 => Self::NotInitialized,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::Enomem,
            0x0083 => Self::NotSupported,
            0x0084 => Self::Einternal,
            0x0085 => Self::Ebusy,
            0x0086 => Self::Etmpfail,
            0x0087 => Self::XattrEinval,
            0x0088 => Self::UnknownCollection,
            0x0089 => Self::NoCollectionsManifest,
            0x00a0 => Self::DurabilityInvalidLevel,
            0x00a1 => Self::DurabilityImpossible,
            0x00a2 => Self::SyncWriteInProgress,
            0x00a3 => Self::SyncWriteAmbiguous,
            0x00a4 => Self::SyncWriteReCommitInProgress,
            0x00c0 => Self::SubdocPathEnoent,
            0x00c1 => Self::SubdocPathMismatch,
            0x00c2 => Self::SubdocPathEinval,
            0x00c3 => Self::SubdocPathE2big,
            0x00c4 => Self::SubdocDocE2deep,
            0x00c5 => Self::SubdocValueCantinsert,
            0x00c6 => Self::SubdocDocNotJson,
            0x00c7 => Self::SubdocNumErange,
            0x00c8 => Self::SubdocDeltaEinval,
            0x00c9 => Self::SubdocPathEexists,
            0x00ca => Self::SubdocValueEtoodeep,
            0x00cb => Self::SubdocInvalidCombo,
            0x00cc => Self::SubdocMultiPathFailure,
            0x00cd => Self::SubdocSuccessDeleted,
            0x00ce => Self::SubdocXattrInvalidFlagCombo,
            0x00cf => Self::SubdocXattrInvalidKeyCombo,
            0x00d0 => Self::SubdocXattrUnknownMacro,
            0x00d3 => Self::SubdocMultiPathFailureDeleted,
            _ => return None,
        })
    }

    /// True for statuses whose response body keeps the payload produced by
    /// the executor rather than being replaced with an error JSON object.
    pub fn keeps_payload(self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::SubdocSuccessDeleted
                | Status::SubdocMultiPathFailure
                | Status::SubdocMultiPathFailureDeleted
                | Status::Rollback
                | Status::NotMyVbucket
                | Status::AuthContinue
        )
    }
}

/// Datatype bits describing the value encoding of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Datatype(u8);

impl Datatype {
    /// Uninterpreted bytes
    pub const RAW: Datatype = Datatype(0x00);
    /// Value is JSON
    pub const JSON: Datatype = Datatype(0x01);
    /// Value is snappy-compressed
    pub const SNAPPY: Datatype = Datatype(0x02);
    /// Value carries extended attributes before the body
    pub const XATTR: Datatype = Datatype(0x04);

    const ALL: u8 = 0x07;

    /// Wrap a raw datatype byte.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Datatype(bits)
    }

    /// The raw byte as it appears on the wire.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if no bits outside the defined set are present.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & !Self::ALL == 0
    }

    /// True if the JSON bit is set.
    #[inline]
    pub fn is_json(self) -> bool {
        self.0 & Self::JSON.0 != 0
    }

    /// True if the snappy bit is set.
    #[inline]
    pub fn is_snappy(self) -> bool {
        self.0 & Self::SNAPPY.0 != 0
    }

    /// True if the xattr bit is set.
    #[inline]
    pub fn is_xattr(self) -> bool {
        self.0 & Self::XATTR.0 != 0
    }

    /// Union of two datatype sets.
    #[inline]
    pub fn union(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }

    /// Intersection with a permitted set, used to strip bits the peer has
    /// not negotiated.
    #[inline]
    pub fn intersect(self, permitted: Datatype) -> Datatype {
        Datatype(self.0 & permitted.0)
    }
}

/// Feature codes negotiated in the HELO handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Feature {
    /// TLS (informational; transport already decided at accept time)
    Tls = 0x0002,
    /// Disable Nagle's algorithm
    TcpNodelay = 0x0003,
    /// Include mutation sequence numbers in mutation responses
    MutationSeqno = 0x0004,
    /// Re-enable Nagle's algorithm
    TcpDelay = 0x0005,
    /// Extended attribute support
    Xattr = 0x0006,
    /// Extended error codes may be returned instead of disconnecting
    Xerror = 0x0007,
    /// SELECT_BUCKET is permitted
    SelectBucket = 0x0008,
    /// Values may be snappy-compressed
    Snappy = 0x000a,
    /// Datatype JSON bit is honored
    Json = 0x000b,
    /// Server may initiate messages on this connection
    Duplex = 0x000c,
    /// Push cluster map change notifications
    ClustermapChangeNotification = 0x000d,
    /// Out-of-order execution of tagged requests
    UnorderedExecution = 0x000e,
    /// Collect and return per-request trace information
    Tracing = 0x000f,
    /// Client understands alt-request framing
    AltRequestSupport = 0x0010,
    /// Client understands durability requirements
    SyncReplication = 0x0011,
    /// Collection-aware key encoding
    Collections = 0x0012,
}

impl Feature {
    /// Decode a feature code; unknown codes are silently not echoed.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0002 => Some(Self::Tls),
            0x0003 => Some(Self::TcpNodelay),
            0x0004 => Some(Self::MutationSeqno),
            0x0005 => Some(Self::TcpDelay),
            0x0006 => Some(Self::Xattr),
            0x0007 => Some(Self::Xerror),
            0x0008 => Some(Self::SelectBucket),
            0x000a => Some(Self::Snappy),
            0x000b => Some(Self::Json),
            0x000c => Some(Self::Duplex),
            0x000d => Some(Self::ClustermapChangeNotification),
            0x000e => Some(Self::UnorderedExecution),
            0x000f => Some(Self::Tracing),
            0x0010 => Some(Self::AltRequestSupport),
            0x0011 => Some(Self::SyncReplication),
            0x0012 => Some(Self::Collections),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_round_trip() {
        for value in [0x80u8, 0x81, 0x08, 0x18, 0x82, 0x83] {
            let magic = Magic::from_u8(value).unwrap();
            assert_eq!(magic as u8, value);
        }
        assert!(Magic::from_u8(0x00).is_none());
        assert!(Magic::from_u8(0xff).is_none());
    }

    #[test]
    fn alt_magics() {
        assert!(Magic::AltClientRequest.is_alt());
        assert!(Magic::AltClientResponse.is_alt());
        assert!(!Magic::ClientRequest.is_alt());
        assert!(!Magic::ServerRequest.is_alt());
    }

    #[test]
    fn opcode_round_trip() {
        for value in 0u8..=255 {
            if let Some(opcode) = ClientOpcode::from_u8(value) {
                assert_eq!(opcode as u8, value);
            }
        }
    }

    #[test]
    fn quiet_variants() {
        assert!(ClientOpcode::Getq.is_quiet());
        assert!(ClientOpcode::Setq.is_quiet());
        assert!(!ClientOpcode::Get.is_quiet());
        assert!(!ClientOpcode::Set.is_quiet());
    }

    #[test]
    fn reorder_whitelist() {
        assert!(ClientOpcode::Get.reorder_supported());
        assert!(ClientOpcode::Delete.reorder_supported());
        // Mutations and handshake commands are barriers.
        assert!(!ClientOpcode::Set.reorder_supported());
        assert!(!ClientOpcode::Hello.reorder_supported());
        assert!(!ClientOpcode::SaslAuth.reorder_supported());
        assert!(!ClientOpcode::DcpOpen.reorder_supported());
    }

    #[test]
    fn datatype_bits() {
        let dt = Datatype::JSON.union(Datatype::SNAPPY);
        assert!(dt.is_json());
        assert!(dt.is_snappy());
        assert!(!dt.is_xattr());
        assert!(dt.is_valid());
        assert!(!Datatype::from_bits(0x80).is_valid());
    }

    #[test]
    fn status_payload_rules() {
        assert!(Status::Success.keeps_payload());
        assert!(Status::NotMyVbucket.keeps_payload());
        assert!(!Status::KeyEnoent.keeps_payload());
        assert!(!Status::Eaccess.keeps_payload());
    }
}
