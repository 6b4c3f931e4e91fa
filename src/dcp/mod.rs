//! CDC producer shim.
//!
//! Translates engine producer callbacks into wire frames on a
//! connection's output stream. Each message is built into a scratch
//! buffer (header, extras, key) and the document value — an engine-owned,
//! reference-counted buffer — is chained behind it without copying; the
//! reference is released once the bytes have been handed to the kernel.
//! When a stream id is attached the message uses the alt-request magic
//! with a stream-id frame info.
//!
//! A message that cannot be queued leaves the connection in an
//! indeterminate state (a partial message may already be buffered), so
//! queue failures surface as `Disconnect`.

use crate::engine::{DcpMessageProducers, EngineError, EngineResult, Item};
use crate::protocol::{ClientOpcode, FrameInfo, RequestBuilder, ResponseBuilder, Status};
use crate::server::connection::Connection;
use bytes::{Bytes, BytesMut};

/// The producer shim bound to one connection.
pub struct ProducerShim<'a> {
    conn: &'a mut Connection,
}

impl<'a> ProducerShim<'a> {
    /// Wrap a connection for one `step` call.
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    fn queue(&mut self, packet: &[u8]) -> EngineResult<()> {
        self.conn
            .copy_to_output_stream(packet)
            .map_err(|_| EngineError::Disconnect)
    }

    fn queue_with_value(&mut self, prefix: &[u8], value: Bytes) -> EngineResult<()> {
        self.queue(prefix)?;
        self.conn
            .chain_data_to_output_stream(value, None)
            .map_err(|_| EngineError::Disconnect)
    }

    fn request(opcode: ClientOpcode, stream_id: Option<u16>) -> RequestBuilder {
        let builder = RequestBuilder::new(opcode);
        match stream_id {
            Some(sid) => builder.frame_info(&FrameInfo::DcpStreamId(sid)),
            None => builder,
        }
    }
}

impl DcpMessageProducers for ProducerShim<'_> {
    fn add_stream_rsp(
        &mut self,
        opaque: u32,
        stream_opaque: u32,
        status: Status,
    ) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        ResponseBuilder::new(ClientOpcode::DcpAddStream)
            .status(status)
            .opaque(opaque)
            .extras(&stream_opaque.to_be_bytes())
            .build(&mut packet);
        self.queue(&packet)
    }

    fn marker(
        &mut self,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 20];
        extras[0..8].copy_from_slice(&start_seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&end_seqno.to_be_bytes());
        extras[16..20].copy_from_slice(&flags.to_be_bytes());

        let mut packet = BytesMut::new();
        Self::request(ClientOpcode::DcpSnapshotMarker, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&extras)
            .build(&mut packet);
        self.queue(&packet)
    }

    fn mutation(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        lock_time: u32,
        nru: u8,
        meta: Bytes,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 31];
        extras[0..8].copy_from_slice(&item.meta.seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&item.meta.rev_seqno.to_be_bytes());
        extras[16..20].copy_from_slice(&item.meta.flags.to_be_bytes());
        extras[20..24].copy_from_slice(&item.meta.exptime.to_be_bytes());
        extras[24..28].copy_from_slice(&lock_time.to_be_bytes());
        extras[28..30].copy_from_slice(&(meta.len() as u16).to_be_bytes());
        extras[30] = nru;

        let mut prefix = BytesMut::new();
        Self::request(ClientOpcode::DcpMutation, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .cas(item.meta.cas)
            .datatype(item.meta.datatype)
            .extras(&extras)
            .key(&item.key)
            .write_prefix(&mut prefix, item.value.len() + meta.len());

        self.queue_with_value(&prefix, item.value)?;
        if !meta.is_empty() {
            self.queue(&meta)?;
        }
        Ok(())
    }

    fn deletion(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        meta: Bytes,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 18];
        extras[0..8].copy_from_slice(&item.meta.seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&item.meta.rev_seqno.to_be_bytes());
        extras[16..18].copy_from_slice(&(meta.len() as u16).to_be_bytes());

        let mut prefix = BytesMut::new();
        Self::request(ClientOpcode::DcpDeletion, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .cas(item.meta.cas)
            .datatype(item.meta.datatype)
            .extras(&extras)
            .key(&item.key)
            .write_prefix(&mut prefix, item.value.len() + meta.len());

        self.queue_with_value(&prefix, item.value)?;
        if !meta.is_empty() {
            self.queue(&meta)?;
        }
        Ok(())
    }

    fn deletion_v2(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        delete_time: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        self.deletion_like(
            ClientOpcode::DcpDeletion,
            opaque,
            item,
            vbucket,
            delete_time,
            stream_id,
        )
    }

    fn expiration(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        delete_time: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        self.deletion_like(
            ClientOpcode::DcpExpiration,
            opaque,
            item,
            vbucket,
            delete_time,
            stream_id,
        )
    }

    fn prepare(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        lock_time: u32,
        nru: u8,
        document_state_deleted: bool,
        level: u8,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 31];
        extras[0..8].copy_from_slice(&item.meta.seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&item.meta.rev_seqno.to_be_bytes());
        extras[16..20].copy_from_slice(&item.meta.flags.to_be_bytes());
        extras[20..24].copy_from_slice(&item.meta.exptime.to_be_bytes());
        extras[24..28].copy_from_slice(&lock_time.to_be_bytes());
        extras[28] = nru;
        extras[29] = u8::from(document_state_deleted);
        extras[30] = level;

        let mut prefix = BytesMut::new();
        Self::request(ClientOpcode::DcpPrepare, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .cas(item.meta.cas)
            .datatype(item.meta.datatype)
            .extras(&extras)
            .key(&item.key)
            .write_prefix(&mut prefix, item.value.len());

        self.queue_with_value(&prefix, item.value)
    }

    fn seqno_acknowledged(
        &mut self,
        opaque: u32,
        vbucket: u16,
        prepared_seqno: u64,
    ) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpSeqnoAcknowledged)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&prepared_seqno.to_be_bytes())
            .build(&mut packet);
        self.queue(&packet)
    }

    fn commit(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        prepared_seqno: u64,
        commit_seqno: u64,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 16];
        extras[0..8].copy_from_slice(&prepared_seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&commit_seqno.to_be_bytes());

        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpCommit)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&extras)
            .key(key)
            .build(&mut packet);
        self.queue(&packet)
    }

    fn abort(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        prepared_seqno: u64,
        abort_seqno: u64,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 16];
        extras[0..8].copy_from_slice(&prepared_seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&abort_seqno.to_be_bytes());

        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpAbort)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&extras)
            .key(key)
            .build(&mut packet);
        self.queue(&packet)
    }

    fn stream_end(
        &mut self,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        Self::request(ClientOpcode::DcpStreamEnd, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&flags.to_be_bytes())
            .build(&mut packet);
        self.queue(&packet)
    }

    fn set_vbucket_state(&mut self, opaque: u32, vbucket: u16, state: u8) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpSetVbucketState)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&[state])
            .build(&mut packet);
        self.queue(&packet)
    }

    fn noop(&mut self, opaque: u32) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpNoop)
            .opaque(opaque)
            .build(&mut packet);
        self.queue(&packet)
    }

    fn buffer_acknowledgement(
        &mut self,
        opaque: u32,
        vbucket: u16,
        bytes: u32,
    ) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpBufferAcknowledgement)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&bytes.to_be_bytes())
            .build(&mut packet);
        self.queue(&packet)
    }

    fn control(&mut self, opaque: u32, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut packet = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpControl)
            .opaque(opaque)
            .key(key)
            .value(value)
            .build(&mut packet);
        self.queue(&packet)
    }

    fn system_event(
        &mut self,
        opaque: u32,
        vbucket: u16,
        event: u32,
        by_seqno: u64,
        version: u8,
        key: &[u8],
        event_data: &[u8],
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 13];
        extras[0..8].copy_from_slice(&by_seqno.to_be_bytes());
        extras[8..12].copy_from_slice(&event.to_be_bytes());
        extras[12] = version;

        let mut packet = BytesMut::new();
        Self::request(ClientOpcode::DcpSystemEvent, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .extras(&extras)
            .key(key)
            .value(event_data)
            .build(&mut packet);
        self.queue(&packet)
    }
}

impl ProducerShim<'_> {
    /// Shared framing for deletion-v2 and expiration, which differ only
    /// in opcode.
    fn deletion_like(
        &mut self,
        opcode: ClientOpcode,
        opaque: u32,
        item: Item,
        vbucket: u16,
        delete_time: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut extras = [0u8; 24];
        extras[0..8].copy_from_slice(&item.meta.seqno.to_be_bytes());
        extras[8..16].copy_from_slice(&item.meta.rev_seqno.to_be_bytes());
        extras[16..20].copy_from_slice(&delete_time.to_be_bytes());
        extras[20..24].copy_from_slice(&0u32.to_be_bytes());

        let mut prefix = BytesMut::new();
        Self::request(opcode, stream_id)
            .opaque(opaque)
            .vbucket(vbucket)
            .cas(item.meta.cas)
            .datatype(item.meta.datatype)
            .extras(&extras)
            .key(&item.key)
            .write_prefix(&mut prefix, item.value.len());

        self.queue_with_value(&prefix, item.value)
    }

}
