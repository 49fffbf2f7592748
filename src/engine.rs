//! Protocol engine: the per-connection state machine.
//!
//! The engine is synchronous. It consumes decoded [`Message`]s, advances the
//! single [`TransferState`], raises [`TransferEvent`]s and returns the reply
//! (if any) that must be written back to the peer. Outbound operations are
//! split into steps that each return the next message to write; the async
//! [`Session`](crate::Session) drives those steps and writes the messages
//! while holding the engine lock, so write order always equals state order.
//!
//! Operations that wait for an acknowledgement register a oneshot sender
//! keyed by `(ack opcode, id)`. Every registered sender is resolved exactly
//! once: by the matching ack, or with an error by [`Engine::cleanup`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{PeerVersion, SessionConfig};
use crate::error::{Result, WireDropError};
use crate::events::{EventSender, ReceivedFile, TransferEvent};
use crate::protocol::{
    Ack, BulkEndRequest, BulkStartRequest, FileSegment, FileStartRequest, Message, Opcode, Reason,
};
use crate::transfer::{
    AcceptPolicy, BulkOffer, BulkPhase, Direction, FileOffer, FilePhase, TransferState,
};
use crate::version::Compatibility;

/// Resolves with the peer's acknowledgement, or with the reason the wait
/// was abandoned.
pub type AckReceiver = oneshot::Receiver<Result<Ack>>;

type AckSender = oneshot::Sender<Result<Ack>>;

/// An outbound request together with the wait for its acknowledgement.
#[derive(Debug)]
pub struct Outbound {
    /// File id or bulk id assigned to the request.
    pub id: u16,
    pub message: Message,
    pub ack: AckReceiver,
}

/// Per-connection protocol state machine.
pub struct Engine {
    state: TransferState,
    config: SessionConfig,
    compatibility: Compatibility,
    policy: Arc<dyn AcceptPolicy>,
    events: EventSender,
    pending: HashMap<(Opcode, u16), AckSender>,
    next_file_id: u16,
    next_bulk_id: u16,
}

impl Engine {
    /// Create an engine. Transfers are refused until a compatible peer
    /// version is known, either from `config.peer_version` or a later
    /// [`Engine::update_version`].
    pub fn new(config: SessionConfig, policy: Arc<dyn AcceptPolicy>, events: EventSender) -> Self {
        let mut engine = Self {
            state: TransferState::new(),
            compatibility: Compatibility::Incompatible("peer version not negotiated".into()),
            policy,
            events,
            pending: HashMap::new(),
            next_file_id: 1,
            next_bulk_id: 1,
            config,
        };
        if let Some(peer) = engine.config.peer_version {
            engine.update_version(peer);
        }
        engine
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn compatibility(&self) -> &Compatibility {
        &self.compatibility
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// File number of the current transfer.
    pub fn current_file_no(&self) -> u16 {
        self.state.file_no
    }

    /// Files in the current batch: the bulk size inside a bulk, otherwise
    /// the total given for the current file.
    pub fn total_files_to_transfer(&self) -> u16 {
        if self.state.bulk_active() {
            self.state.total_files_in_bulk
        } else {
            self.state.total_files
        }
    }

    /// Record the peer's versions and recompute compatibility.
    ///
    /// Becoming incompatible ends every transfer and fails pending
    /// operations with `Incompatible`.
    pub fn update_version(&mut self, peer: PeerVersion) -> Compatibility {
        let version = self.config.connection_version(peer);
        let compatibility = version.compute();

        match &compatibility {
            Compatibility::Compatible => {
                info!(
                    local = version.local_version,
                    remote = version.remote_version,
                    "protocol versions compatible"
                );
            }
            Compatibility::Incompatible(reason) => {
                warn!(%reason, "protocol versions incompatible, refusing transfers");
                let reason = reason.clone();
                self.cleanup(|| WireDropError::Incompatible(reason.clone()));
            }
        }
        self.compatibility = compatibility.clone();
        compatibility
    }

    fn ensure_compatible(&self) -> Result<()> {
        match &self.compatibility {
            Compatibility::Compatible => Ok(()),
            Compatibility::Incompatible(reason) => Err(WireDropError::Incompatible(reason.clone())),
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn register(&mut self, opcode: Opcode, id: u16) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.pending.insert((opcode, id), tx) {
            let _ = stale.send(Err(WireDropError::Cancelled));
        }
        rx
    }

    fn cancel_pending(&mut self, opcode: Opcode, id: u16) {
        if let Some(tx) = self.pending.remove(&(opcode, id)) {
            let _ = tx.send(Err(WireDropError::Cancelled));
        }
    }

    fn allocate_file_id(&mut self) -> u16 {
        let id = self.next_file_id;
        self.next_file_id = self.next_file_id.wrapping_add(1);
        id
    }

    fn allocate_bulk_id(&mut self) -> u16 {
        let id = self.next_bulk_id;
        self.next_bulk_id = self.next_bulk_id.wrapping_add(1);
        id
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one inbound message and return the reply to write, if any.
    ///
    /// Errors are per-message: the engine is always left in a consistent
    /// state and keeps accepting further messages.
    pub fn handle(&mut self, message: Message) -> Result<Option<Message>> {
        match message {
            Message::FileStart(req) => Ok(Some(self.on_file_start(req))),
            Message::FileSegment(seg) => self.on_file_segment(seg).map(|_| None),
            Message::FileEnd { file_id } => Ok(Some(self.on_file_end(file_id))),
            Message::BulkStart(req) => Ok(Some(self.on_bulk_start(req))),
            Message::BulkEnd(req) => Ok(Some(self.on_bulk_end(req))),
            Message::FileStartAck(ack) => self.on_ack(Opcode::FileStartAck, ack).map(|_| None),
            Message::FileEndAck(ack) => self.on_ack(Opcode::FileEndAck, ack).map(|_| None),
            Message::BulkStartAck(ack) => self.on_ack(Opcode::BulkStartAck, ack).map(|_| None),
            Message::BulkEndAck(ack) => self.on_ack(Opcode::BulkEndAck, ack).map(|_| None),
        }
    }

    fn on_file_start(&mut self, req: FileStartRequest) -> Message {
        let file_id = req.file_id;
        let reject = |reason| Message::FileStartAck(Ack::reject(file_id, reason));

        if let Compatibility::Incompatible(reason) = &self.compatibility {
            warn!(file_id, %reason, "refusing file start, versions incompatible");
            return reject(Reason::Incompatible);
        }
        if self.state.file_active() {
            warn!(
                file_id,
                active = self.state.file_id,
                "refusing file start, transfer already in progress"
            );
            return reject(Reason::TransferAlreadyInProgress);
        }
        if self.state.in_bulk(Direction::Receiving)
            && self.state.files_completed_in_bulk >= self.state.total_files_in_bulk
        {
            warn!(
                file_id,
                bulk_id = self.state.bulk_id,
                total = self.state.total_files_in_bulk,
                "refusing file start, every announced bulk file already arrived"
            );
            return reject(Reason::IncompleteTransfer);
        }

        let offer = FileOffer {
            file_id,
            client_type: req.client_type,
            file_no: req.file_no,
            fragment_count: req.fragment_count,
            total_size: req.total_size,
            filename: req.filename.clone(),
            in_bulk: self.state.in_bulk(Direction::Receiving),
        };
        if let Err(reason) = self.policy.accept_file(&offer) {
            info!(file_id, ?reason, "file rejected by accept policy");
            return reject(reason);
        }

        if let Err(e) = self.state.begin_receive(
            file_id,
            req.file_no,
            req.fragment_count,
            req.total_size,
            req.filename,
        ) {
            warn!(file_id, "refusing file start: {}", e);
            return reject(Reason::TransferAlreadyInProgress);
        }

        debug!(
            file_id,
            fragments = req.fragment_count,
            size = req.total_size,
            "receiving file"
        );
        self.emit(TransferEvent::FileTransferAccepted {
            file_id,
            file_no: req.file_no,
            total: self.state.total_files,
        });
        Message::FileStartAck(Ack::accept(file_id))
    }

    fn on_file_segment(&mut self, seg: FileSegment) -> Result<()> {
        self.ensure_compatible()?;

        let receiving = self.state.direction == Direction::Receiving
            && self.state.phase == FilePhase::Transferring;
        let unexpected = WireDropError::UnexpectedFragment {
            expected: self.state.next_expected_fragment,
            received: seg.fragment_index,
        };
        if !receiving {
            warn!(
                file_id = seg.file_id,
                fragment = seg.fragment_index,
                "fragment with no receiving transfer"
            );
            return Err(unexpected);
        }
        if seg.file_id != self.state.file_id {
            warn!(
                file_id = seg.file_id,
                active = self.state.file_id,
                "fragment for another file, aborting transfer"
            );
            self.fail_inbound(Reason::UnexpectedFragment);
            return Err(unexpected);
        }

        match self.state.append_fragment(seg.fragment_index, seg.payload) {
            Ok(seq) => {
                let total = self.state.total_fragments;
                self.emit(TransferEvent::FragmentReceived {
                    file_id: seg.file_id,
                    index: seq,
                    total,
                    progress: self.state.progress(seq + 1),
                });
                Ok(())
            }
            Err(e) => {
                warn!(file_id = seg.file_id, "aborting transfer: {}", e);
                self.fail_inbound(Reason::UnexpectedFragment);
                Err(e)
            }
        }
    }

    fn on_file_end(&mut self, file_id: u16) -> Message {
        let reject = |reason| Message::FileEndAck(Ack::reject(file_id, reason));

        if !self.compatibility.is_compatible() {
            return reject(Reason::Incompatible);
        }
        let receiving = self.state.direction == Direction::Receiving
            && self.state.phase == FilePhase::Transferring
            && self.state.file_id == file_id;
        if !receiving {
            warn!(file_id, "file end with no matching receiving transfer");
            return reject(Reason::IncompleteTransfer);
        }

        match self.state.reassemble() {
            Ok(payload) => {
                let received = ReceivedFile {
                    file_id,
                    file_no: self.state.file_no,
                    filename: self.state.filename.clone(),
                    payload,
                    in_bulk: self.state.is_part_of_bulk,
                };
                if self.state.is_part_of_bulk {
                    self.state.files_completed_in_bulk =
                        self.state.files_completed_in_bulk.saturating_add(1);
                }
                self.state.clear_file();

                info!(file_id, size = received.payload.len(), "file received");
                self.emit(TransferEvent::ReceivedFile(received));
                self.emit(TransferEvent::FileTransferCompleted { file_id });
                Message::FileEndAck(Ack::accept(file_id))
            }
            Err(e) => {
                warn!(file_id, "file incomplete: {}", e);
                self.fail_inbound(Reason::IncompleteTransfer);
                reject(Reason::IncompleteTransfer)
            }
        }
    }

    /// Drop the inbound file without delivering anything.
    fn fail_inbound(&mut self, reason: Reason) {
        let file_id = self.state.file_id;
        self.state.clear_file();
        self.emit(TransferEvent::FileTransferFailed { file_id, reason });
    }

    fn on_bulk_start(&mut self, req: BulkStartRequest) -> Message {
        let bulk_id = req.bulk_id;
        let reject = |reason| Message::BulkStartAck(Ack::reject(bulk_id, reason));

        if let Compatibility::Incompatible(reason) = &self.compatibility {
            warn!(bulk_id, %reason, "refusing bulk start, versions incompatible");
            return reject(Reason::Incompatible);
        }
        if self.state.bulk_active() {
            warn!(
                bulk_id,
                active = self.state.bulk_id,
                "refusing bulk start, bulk already in progress"
            );
            return reject(Reason::TransferAlreadyInProgress);
        }
        let offer = BulkOffer {
            bulk_id,
            client_type: req.client_type,
            file_count: req.file_count,
        };
        if let Err(reason) = self.policy.accept_bulk(&offer) {
            info!(bulk_id, ?reason, "bulk rejected by accept policy");
            return reject(reason);
        }

        self.state.bulk_phase = BulkPhase::Active;
        self.state.bulk_direction = Direction::Receiving;
        self.state.bulk_id = bulk_id;
        self.state.total_files_in_bulk = req.file_count;
        self.state.files_completed_in_bulk = 0;

        debug!(bulk_id, files = req.file_count, "receiving bulk");
        self.emit(TransferEvent::BulkTransferAccepted {
            accepted: true,
            bulk_id,
            total: req.file_count,
        });
        Message::BulkStartAck(Ack::accept(bulk_id))
    }

    fn on_bulk_end(&mut self, req: BulkEndRequest) -> Message {
        let bulk_id = req.bulk_id;
        if !self.compatibility.is_compatible() {
            return Message::BulkEndAck(Ack::reject(bulk_id, Reason::Incompatible));
        }
        let matches = self.state.bulk_active()
            && self.state.bulk_direction == Direction::Receiving
            && self.state.bulk_id == bulk_id;
        if !matches {
            warn!(bulk_id, "bulk end with no matching bulk");
            return Message::BulkEndAck(Ack::reject(bulk_id, Reason::NoTransferActive));
        }

        if req.aborted
            && self.state.file_active()
            && self.state.direction == Direction::Receiving
            && self.state.is_part_of_bulk
        {
            self.fail_inbound(Reason::Aborted);
        }

        let completed = self.state.files_completed_in_bulk;
        let total = self.state.total_files_in_bulk;
        let success = !req.aborted && completed == total;
        let reason = if success {
            Reason::Accepted
        } else if req.aborted {
            Reason::Aborted
        } else {
            Reason::IncompleteTransfer
        };
        self.state.clear_bulk();

        if success {
            info!(bulk_id, files = total, "bulk received");
        } else {
            warn!(bulk_id, completed, total, aborted = req.aborted, "bulk ended unsuccessfully");
        }
        self.emit(TransferEvent::BulkTransferEnded { success, bulk_id });
        Message::BulkEndAck(Ack {
            id: bulk_id,
            ok: success,
            reason,
        })
    }

    fn on_ack(&mut self, opcode: Opcode, ack: Ack) -> Result<()> {
        let Some(tx) = self.pending.remove(&(opcode, ack.id)) else {
            warn!(?opcode, id = ack.id, "unsolicited ack ignored");
            return Err(WireDropError::UnsolicitedAck { opcode, id: ack.id });
        };

        match opcode {
            Opcode::FileStartAck => {
                let file_id = ack.id;
                if ack.ok {
                    self.state.phase = FilePhase::Transferring;
                    debug!(file_id, "file accepted by peer");
                    self.emit(TransferEvent::FileTransferAccepted {
                        file_id,
                        file_no: self.state.file_no,
                        total: self.state.total_files,
                    });
                } else {
                    info!(file_id, reason = ?ack.reason, "file rejected by peer");
                    self.state.clear_file();
                    self.emit(TransferEvent::FileTransferFailed {
                        file_id,
                        reason: ack.reason,
                    });
                }
            }
            Opcode::FileEndAck => {
                let file_id = ack.id;
                if ack.ok && self.state.is_part_of_bulk {
                    self.state.files_completed_in_bulk =
                        self.state.files_completed_in_bulk.saturating_add(1);
                }
                self.state.clear_file();
                if ack.ok {
                    info!(file_id, "file delivered");
                    self.emit(TransferEvent::FileTransferCompleted { file_id });
                } else {
                    warn!(file_id, reason = ?ack.reason, "peer reported failed file");
                    self.emit(TransferEvent::FileTransferFailed {
                        file_id,
                        reason: ack.reason,
                    });
                }
            }
            Opcode::BulkStartAck => {
                let total = self.state.total_files_in_bulk;
                if ack.ok {
                    self.state.bulk_phase = BulkPhase::Active;
                } else {
                    info!(bulk_id = ack.id, reason = ?ack.reason, "bulk rejected by peer");
                    self.state.clear_bulk();
                }
                self.emit(TransferEvent::BulkTransferAccepted {
                    accepted: ack.ok,
                    bulk_id: ack.id,
                    total,
                });
            }
            Opcode::BulkEndAck => {
                self.state.clear_bulk();
                self.emit(TransferEvent::BulkTransferEnded {
                    success: ack.ok,
                    bulk_id: ack.id,
                });
            }
            _ => {}
        }

        let _ = tx.send(Ok(ack));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Occupy the slot for an outbound file and build its `FileStart`.
    pub fn begin_send_file(
        &mut self,
        data: Bytes,
        file_no: u16,
        total: u16,
        filename: Bytes,
    ) -> Result<Outbound> {
        self.ensure_compatible()?;
        if self.state.file_active() {
            return Err(WireDropError::TransferAlreadyInProgress);
        }

        let file_id = self.next_file_id;
        self.state.begin_send(
            file_id,
            file_no,
            total,
            filename,
            data,
            self.config.fragment_size,
        )?;
        self.allocate_file_id();

        let request = FileStartRequest {
            file_id,
            client_type: self.config.client_type,
            fragment_count: self.state.total_fragments,
            total_size: self.state.total_size,
            file_no,
            filename: self.state.filename.clone(),
        };
        debug!(
            file_id,
            fragments = request.fragment_count,
            size = request.total_size,
            "sending file"
        );
        let ack = self.register(Opcode::FileStartAck, file_id);
        Ok(Outbound {
            id: file_id,
            message: Message::FileStart(request),
            ack,
        })
    }

    fn is_sending(&self, file_id: u16, phase: FilePhase) -> bool {
        self.state.direction == Direction::Sending
            && self.state.phase == phase
            && self.state.file_id == file_id
    }

    /// Next `FileSegment` of an accepted outbound file, or `None` once
    /// every fragment has been produced.
    ///
    /// Fails with `Cancelled` if the transfer was cleaned up meanwhile.
    pub fn next_fragment(&mut self, file_id: u16) -> Result<Option<Message>> {
        if !self.is_sending(file_id, FilePhase::Transferring) {
            return Err(WireDropError::Cancelled);
        }
        let seq = self.state.next_expected_fragment;
        let Some(payload) = self.state.outbound_fragment(seq) else {
            return Ok(None);
        };
        self.state.next_expected_fragment += 1;

        self.emit(TransferEvent::FragmentSent {
            file_id,
            index: seq,
            total: self.state.total_fragments,
            progress: self.state.progress(seq + 1),
        });
        Ok(Some(Message::FileSegment(FileSegment {
            file_id,
            fragment_index: seq as u8,
            payload,
        })))
    }

    /// Build `FileEnd` once all fragments are out and start waiting for
    /// the verdict.
    pub fn finish_send(&mut self, file_id: u16) -> Result<Outbound> {
        if !self.is_sending(file_id, FilePhase::Transferring) {
            return Err(WireDropError::Cancelled);
        }
        if self.state.next_expected_fragment != self.state.total_fragments {
            return Err(WireDropError::IncompleteTransfer {
                received: self.state.next_expected_fragment,
                expected: self.state.total_fragments,
            });
        }
        self.state.phase = FilePhase::AwaitingEndAck;
        self.state.outbound_payload = None;

        let ack = self.register(Opcode::FileEndAck, file_id);
        Ok(Outbound {
            id: file_id,
            message: Message::FileEnd { file_id },
            ack,
        })
    }

    /// Give up on an outbound file. No-op if `file_id` is no longer the
    /// active outbound transfer.
    pub fn abandon_file(&mut self, file_id: u16) {
        if !(self.state.file_active()
            && self.state.direction == Direction::Sending
            && self.state.file_id == file_id)
        {
            return;
        }
        debug!(file_id, "abandoning outbound file");
        self.cancel_pending(Opcode::FileStartAck, file_id);
        self.cancel_pending(Opcode::FileEndAck, file_id);
        self.state.clear_file();
        self.emit(TransferEvent::FileTransferFailed {
            file_id,
            reason: Reason::Aborted,
        });
    }

    /// Open an outbound bulk session of `total` files.
    pub fn begin_bulk(&mut self, total: u16) -> Result<Outbound> {
        self.ensure_compatible()?;
        if self.state.bulk_active() {
            return Err(WireDropError::TransferAlreadyInProgress);
        }
        let bulk_id = self.allocate_bulk_id();
        self.state.bulk_phase = BulkPhase::AwaitingStartAck;
        self.state.bulk_direction = Direction::Sending;
        self.state.bulk_id = bulk_id;
        self.state.total_files_in_bulk = total;
        self.state.files_completed_in_bulk = 0;

        debug!(bulk_id, files = total, "starting bulk");
        let ack = self.register(Opcode::BulkStartAck, bulk_id);
        Ok(Outbound {
            id: bulk_id,
            message: Message::BulkStart(BulkStartRequest {
                bulk_id,
                client_type: self.config.client_type,
                file_count: total,
            }),
            ack,
        })
    }

    /// Close the outbound bulk session. Aborting also abandons the file in
    /// flight, if any.
    pub fn end_bulk(&mut self, aborted: bool, reason: Reason) -> Result<Outbound> {
        if !self.state.in_bulk(Direction::Sending) {
            return Err(WireDropError::NoBulkActive);
        }
        if aborted && self.state.is_part_of_bulk && self.state.direction == Direction::Sending {
            self.abandon_file(self.state.file_id);
        }

        let bulk_id = self.state.bulk_id;
        self.state.bulk_phase = BulkPhase::AwaitingEndAck;
        debug!(bulk_id, aborted, "ending bulk");

        let ack = self.register(Opcode::BulkEndAck, bulk_id);
        Ok(Outbound {
            id: bulk_id,
            message: Message::BulkEnd(BulkEndRequest {
                bulk_id,
                aborted,
                reason,
            }),
            ack,
        })
    }

    /// Forget an outbound bulk whose request never reached the peer.
    pub fn abandon_bulk(&mut self, bulk_id: u16) {
        if !(self.state.bulk_active()
            && self.state.bulk_direction == Direction::Sending
            && self.state.bulk_id == bulk_id)
        {
            return;
        }
        self.cancel_pending(Opcode::BulkStartAck, bulk_id);
        self.cancel_pending(Opcode::BulkEndAck, bulk_id);
        self.state.clear_bulk();
    }

    /// Reset the transfer state and resolve every pending operation with
    /// the error built by `err`.
    pub fn cleanup<F>(&mut self, err: F)
    where
        F: Fn() -> WireDropError,
    {
        if self.state.file_active() {
            self.emit(TransferEvent::FileTransferFailed {
                file_id: self.state.file_id,
                reason: Reason::Aborted,
            });
        }
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "resolving pending operations");
        }
        self.state.clear();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err()));
        }
    }

    /// Number of operations waiting for an acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventReceiver};
    use crate::protocol::ClientType;
    use crate::transfer::{AcceptAll, MaxFileSize};

    fn config() -> SessionConfig {
        SessionConfig {
            fragment_size: 4,
            peer_version: Some(PeerVersion {
                version: 0,
                min_supported: 0,
            }),
            ..SessionConfig::default()
        }
    }

    fn engine_with(config: SessionConfig, policy: Arc<dyn AcceptPolicy>) -> (Engine, EventReceiver) {
        let (tx, rx) = events::channel();
        (Engine::new(config, policy, tx), rx)
    }

    fn engine() -> (Engine, EventReceiver) {
        engine_with(config(), Arc::new(AcceptAll))
    }

    fn drain(rx: &mut EventReceiver) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn file_start(file_id: u16, fragments: u16, size: u32) -> Message {
        Message::FileStart(FileStartRequest {
            file_id,
            client_type: ClientType::IosApp,
            fragment_count: fragments,
            total_size: size,
            file_no: 0,
            filename: Bytes::from_static(b"a.txt"),
        })
    }

    fn segment(file_id: u16, index: u8, payload: &'static [u8]) -> Message {
        Message::FileSegment(FileSegment {
            file_id,
            fragment_index: index,
            payload: Bytes::from_static(payload),
        })
    }

    /// Run `outbound` through `receiver` and feed the reply back into
    /// `sender`.
    fn exchange(sender: &mut Engine, receiver: &mut Engine, outbound: Message) -> Option<Message> {
        let reply = receiver.handle(outbound).unwrap();
        if let Some(reply) = reply.clone() {
            sender.handle(reply).unwrap();
        }
        reply
    }

    #[test]
    fn test_receive_file() {
        let (mut engine, mut events) = engine();

        let reply = engine.handle(file_start(7, 3, 10)).unwrap();
        assert_eq!(reply, Some(Message::FileStartAck(Ack::accept(7))));

        for (i, chunk) in [&b"0123"[..], b"4567", b"89"].iter().enumerate() {
            let seg = Message::FileSegment(FileSegment {
                file_id: 7,
                fragment_index: i as u8,
                payload: Bytes::copy_from_slice(chunk),
            });
            assert_eq!(engine.handle(seg).unwrap(), None);
        }

        let reply = engine.handle(Message::FileEnd { file_id: 7 }).unwrap();
        assert_eq!(reply, Some(Message::FileEndAck(Ack::accept(7))));
        assert!(!engine.state().file_active());

        let events = drain(&mut events);
        assert_eq!(
            events[0],
            TransferEvent::FileTransferAccepted {
                file_id: 7,
                file_no: 0,
                total: 1
            }
        );
        assert!(matches!(
            events[3],
            TransferEvent::FragmentReceived { index: 2, total: 3, progress, .. } if progress.file == 1.0
        ));
        match &events[4] {
            TransferEvent::ReceivedFile(file) => {
                assert_eq!(&file.payload[..], b"0123456789");
                assert_eq!(file.filename_str(), Some("a.txt"));
                assert!(!file.in_bulk);
            }
            other => panic!("expected ReceivedFile, got {:?}", other),
        }
        assert_eq!(events[5], TransferEvent::FileTransferCompleted { file_id: 7 });
    }

    #[test]
    fn test_second_file_start_rejected_and_state_untouched() {
        let (mut engine, _events) = engine();
        engine.handle(file_start(1, 2, 8)).unwrap();
        engine.handle(segment(1, 0, b"abcd")).unwrap();
        let before = format!("{:?}", engine.state());

        let reply = engine.handle(file_start(2, 1, 1)).unwrap();
        assert_eq!(
            reply,
            Some(Message::FileStartAck(Ack::reject(
                2,
                Reason::TransferAlreadyInProgress
            )))
        );
        assert_eq!(format!("{:?}", engine.state()), before);
    }

    #[test]
    fn test_send_while_receiving_rejected() {
        let (mut engine, _events) = engine();
        engine.handle(file_start(1, 2, 8)).unwrap();

        let err = engine
            .begin_send_file(Bytes::from_static(b"x"), 0, 1, Bytes::new())
            .unwrap_err();
        assert!(matches!(err, WireDropError::TransferAlreadyInProgress));
        assert_eq!(engine.state().file_id, 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_fragment_aborts_transfer() {
        let (mut engine, mut events) = engine();
        engine.handle(file_start(1, 3, 12)).unwrap();
        engine.handle(segment(1, 0, b"abcd")).unwrap();

        let err = engine.handle(segment(1, 2, b"ijkl")).unwrap_err();
        assert!(matches!(
            err,
            WireDropError::UnexpectedFragment { expected: 1, received: 2 }
        ));
        assert!(!engine.state().file_active());
        assert!(drain(&mut events).contains(&TransferEvent::FileTransferFailed {
            file_id: 1,
            reason: Reason::UnexpectedFragment
        }));

        // Sender's FileEnd still gets an answer.
        let reply = engine.handle(Message::FileEnd { file_id: 1 }).unwrap();
        assert_eq!(
            reply,
            Some(Message::FileEndAck(Ack::reject(1, Reason::IncompleteTransfer)))
        );
    }

    #[test]
    fn test_fragment_without_transfer() {
        let (mut engine, mut events) = engine();
        let err = engine.handle(segment(1, 0, b"abcd")).unwrap_err();
        assert!(matches!(err, WireDropError::UnexpectedFragment { .. }));
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_file_end_with_missing_fragments() {
        let (mut engine, mut events) = engine();
        engine.handle(file_start(4, 2, 8)).unwrap();
        engine.handle(segment(4, 0, b"abcd")).unwrap();

        let reply = engine.handle(Message::FileEnd { file_id: 4 }).unwrap();
        assert_eq!(
            reply,
            Some(Message::FileEndAck(Ack::reject(4, Reason::IncompleteTransfer)))
        );
        assert!(!engine.state().file_active());

        let events = drain(&mut events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::ReceivedFile(_))));
        assert_eq!(
            events.last(),
            Some(&TransferEvent::FileTransferFailed {
                file_id: 4,
                reason: Reason::IncompleteTransfer
            })
        );
    }

    #[test]
    fn test_unsolicited_ack_is_ignored() {
        let (mut engine, mut events) = engine();
        let before = format!("{:?}", engine.state());

        let err = engine
            .handle(Message::FileEndAck(Ack::accept(99)))
            .unwrap_err();
        assert!(matches!(
            err,
            WireDropError::UnsolicitedAck {
                opcode: Opcode::FileEndAck,
                id: 99
            }
        ));
        assert_eq!(format!("{:?}", engine.state()), before);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_policy_rejection() {
        let (mut engine, mut events) = engine_with(config(), Arc::new(MaxFileSize(5)));
        let reply = engine.handle(file_start(1, 3, 10)).unwrap();
        assert_eq!(
            reply,
            Some(Message::FileStartAck(Ack::reject(1, Reason::ResourceUnavailable)))
        );
        assert!(!engine.state().file_active());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_refuses_transfers_until_version_known() {
        let cfg = SessionConfig {
            peer_version: None,
            ..config()
        };
        let (mut engine, _events) = engine_with(cfg, Arc::new(AcceptAll));

        let reply = engine.handle(file_start(1, 1, 1)).unwrap();
        assert_eq!(
            reply,
            Some(Message::FileStartAck(Ack::reject(1, Reason::Incompatible)))
        );
        assert!(matches!(
            engine.handle(segment(1, 0, b"x")),
            Err(WireDropError::Incompatible(_))
        ));
        assert!(matches!(
            engine.begin_send_file(Bytes::from_static(b"x"), 0, 1, Bytes::new()),
            Err(WireDropError::Incompatible(_))
        ));
        assert!(matches!(
            engine.begin_bulk(2),
            Err(WireDropError::Incompatible(_))
        ));

        let compat = engine.update_version(PeerVersion {
            version: 0,
            min_supported: 0,
        });
        assert!(compat.is_compatible());
        assert_eq!(
            engine.handle(file_start(1, 1, 1)).unwrap(),
            Some(Message::FileStartAck(Ack::accept(1)))
        );
    }

    #[test]
    fn test_becoming_incompatible_cancels_pending() {
        let (mut engine, _events) = engine();
        let mut out = engine
            .begin_send_file(Bytes::from_static(b"data"), 0, 1, Bytes::new())
            .unwrap();

        let compat = engine.update_version(PeerVersion {
            version: 0,
            min_supported: 3,
        });
        assert!(!compat.is_compatible());
        assert!(!engine.state().file_active());
        assert!(matches!(
            out.ack.try_recv().unwrap(),
            Err(WireDropError::Incompatible(_))
        ));
    }

    #[test]
    fn test_send_ten_bytes_in_fours() {
        let (mut sender, mut events) = engine();
        let (mut receiver, mut receiver_events) = engine();

        let mut start = sender
            .begin_send_file(
                Bytes::from_static(b"0123456789"),
                0,
                1,
                Bytes::from_static(b"a.txt"),
            )
            .unwrap();
        match &start.message {
            Message::FileStart(req) => {
                assert_eq!(req.fragment_count, 3);
                assert_eq!(req.total_size, 10);
                assert_eq!(&req.filename[..], b"a.txt");
            }
            other => panic!("expected FileStart, got {:?}", other),
        }
        exchange(&mut sender, &mut receiver, start.message.clone());
        assert!(start.ack.try_recv().unwrap().unwrap().ok);

        let mut sizes = Vec::new();
        while let Some(seg) = sender.next_fragment(start.id).unwrap() {
            if let Message::FileSegment(s) = &seg {
                sizes.push(s.payload.len());
            }
            assert_eq!(exchange(&mut sender, &mut receiver, seg), None);
        }
        assert_eq!(sizes, vec![4, 4, 2]);

        let mut end = sender.finish_send(start.id).unwrap();
        assert_eq!(end.message, Message::FileEnd { file_id: start.id });
        exchange(&mut sender, &mut receiver, end.message.clone());
        assert!(end.ack.try_recv().unwrap().unwrap().ok);

        assert!(!sender.state().file_active());
        assert!(drain(&mut events).contains(&TransferEvent::FileTransferCompleted { file_id: 1 }));
        assert!(drain(&mut receiver_events).iter().any(|e| matches!(
            e,
            TransferEvent::ReceivedFile(f) if &f.payload[..] == b"0123456789"
        )));
    }

    #[test]
    fn test_empty_file_has_no_segments() {
        let (mut sender, _events) = engine();
        let (mut receiver, _receiver_events) = engine();

        let start = sender
            .begin_send_file(Bytes::new(), 0, 1, Bytes::from_static(b"empty"))
            .unwrap();
        exchange(&mut sender, &mut receiver, start.message);
        assert_eq!(sender.next_fragment(start.id).unwrap(), None);

        let end = sender.finish_send(start.id).unwrap();
        let reply = exchange(&mut sender, &mut receiver, end.message);
        assert_eq!(reply, Some(Message::FileEndAck(Ack::accept(start.id))));
    }

    #[test]
    fn test_rejected_start_frees_slot() {
        let (mut sender, mut events) = engine();
        let mut start = sender
            .begin_send_file(Bytes::from_static(b"data"), 0, 1, Bytes::new())
            .unwrap();

        sender
            .handle(Message::FileStartAck(Ack::reject(
                start.id,
                Reason::ResourceUnavailable,
            )))
            .unwrap();

        let ack = start.ack.try_recv().unwrap().unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.reason, Reason::ResourceUnavailable);
        assert!(!sender.state().file_active());
        assert!(matches!(
            sender.next_fragment(start.id),
            Err(WireDropError::Cancelled)
        ));
        assert_eq!(
            drain(&mut events),
            vec![TransferEvent::FileTransferFailed {
                file_id: start.id,
                reason: Reason::ResourceUnavailable
            }]
        );
    }

    #[test]
    fn test_cleanup_resolves_pending() {
        let (mut sender, _events) = engine();
        let mut bulk = sender.begin_bulk(2).unwrap();
        let mut file = sender
            .begin_send_file(Bytes::from_static(b"data"), 0, 2, Bytes::new())
            .unwrap();
        assert_eq!(sender.pending_count(), 2);

        sender.cleanup(|| WireDropError::Cancelled);

        assert!(matches!(bulk.ack.try_recv().unwrap(), Err(WireDropError::Cancelled)));
        assert!(matches!(file.ack.try_recv().unwrap(), Err(WireDropError::Cancelled)));
        assert_eq!(sender.pending_count(), 0);
        assert!(!sender.state().file_active());
        assert!(!sender.state().bulk_active());
    }

    #[test]
    fn test_bulk_of_two_files() {
        let (mut sender, mut events) = engine();
        let (mut receiver, mut receiver_events) = engine();

        let mut bulk = sender.begin_bulk(2).unwrap();
        assert_eq!(
            exchange(&mut sender, &mut receiver, bulk.message.clone()),
            Some(Message::BulkStartAck(Ack::accept(bulk.id)))
        );
        assert!(bulk.ack.try_recv().unwrap().unwrap().ok);
        assert_eq!(sender.total_files_to_transfer(), 2);

        for file_no in 0..2u16 {
            let start = sender
                .begin_send_file(Bytes::from_static(b"abcdef"), file_no, 2, Bytes::from_static(b"f"))
                .unwrap();
            assert!(sender.state().is_part_of_bulk);
            exchange(&mut sender, &mut receiver, start.message);
            assert_eq!(receiver.current_file_no(), file_no);
            while let Some(seg) = sender.next_fragment(start.id).unwrap() {
                exchange(&mut sender, &mut receiver, seg);
            }
            let end = sender.finish_send(start.id).unwrap();
            exchange(&mut sender, &mut receiver, end.message);
            assert_eq!(sender.state().files_completed_in_bulk, file_no + 1);
            assert_eq!(receiver.state().files_completed_in_bulk, file_no + 1);
        }

        let mut end = sender.end_bulk(false, Reason::Accepted).unwrap();
        assert_eq!(
            exchange(&mut sender, &mut receiver, end.message.clone()),
            Some(Message::BulkEndAck(Ack::accept(bulk.id)))
        );
        assert!(end.ack.try_recv().unwrap().unwrap().ok);
        assert!(!sender.state().bulk_active());
        assert!(!receiver.state().bulk_active());

        let bulk_ended = TransferEvent::BulkTransferEnded {
            success: true,
            bulk_id: bulk.id,
        };
        assert_eq!(drain(&mut events).last(), Some(&bulk_ended));
        assert_eq!(drain(&mut receiver_events).last(), Some(&bulk_ended));
    }

    #[test]
    fn test_bulk_end_short_of_count_fails() {
        let (mut receiver, _events) = engine();
        receiver
            .handle(Message::BulkStart(BulkStartRequest {
                bulk_id: 3,
                client_type: ClientType::MacApp,
                file_count: 2,
            }))
            .unwrap();

        let reply = receiver
            .handle(Message::BulkEnd(BulkEndRequest {
                bulk_id: 3,
                aborted: false,
                reason: Reason::Accepted,
            }))
            .unwrap();
        assert_eq!(
            reply,
            Some(Message::BulkEndAck(Ack::reject(3, Reason::IncompleteTransfer)))
        );
    }

    #[test]
    fn test_bulk_refuses_files_beyond_announced_count() {
        let (mut receiver, mut events) = engine();
        receiver
            .handle(Message::BulkStart(BulkStartRequest {
                bulk_id: 5,
                client_type: ClientType::MacApp,
                file_count: 1,
            }))
            .unwrap();
        receiver.handle(file_start(1, 0, 0)).unwrap();
        assert_eq!(
            receiver.handle(Message::FileEnd { file_id: 1 }).unwrap(),
            Some(Message::FileEndAck(Ack::accept(1)))
        );

        for file_id in 2..1000 {
            assert_eq!(
                receiver.handle(file_start(file_id, 0, 0)).unwrap(),
                Some(Message::FileStartAck(Ack::reject(
                    file_id,
                    Reason::IncompleteTransfer
                )))
            );
        }
        assert_eq!(receiver.state().files_completed_in_bulk, 1);
        assert!(!receiver.state().file_active());

        let reply = receiver
            .handle(Message::BulkEnd(BulkEndRequest {
                bulk_id: 5,
                aborted: false,
                reason: Reason::Accepted,
            }))
            .unwrap();
        assert_eq!(reply, Some(Message::BulkEndAck(Ack::accept(5))));
        assert!(drain(&mut events).contains(&TransferEvent::BulkTransferEnded {
            success: true,
            bulk_id: 5
        }));
    }

    #[test]
    fn test_bulk_end_without_bulk() {
        let (mut receiver, _events) = engine();
        let reply = receiver
            .handle(Message::BulkEnd(BulkEndRequest {
                bulk_id: 1,
                aborted: false,
                reason: Reason::Accepted,
            }))
            .unwrap();
        assert_eq!(
            reply,
            Some(Message::BulkEndAck(Ack::reject(1, Reason::NoTransferActive)))
        );

        let (mut sender, _events) = engine();
        assert!(matches!(
            sender.end_bulk(false, Reason::Accepted),
            Err(WireDropError::NoBulkActive)
        ));
    }

    #[test]
    fn test_second_bulk_rejected() {
        let (mut receiver, _events) = engine();
        let bulk = |id| {
            Message::BulkStart(BulkStartRequest {
                bulk_id: id,
                client_type: ClientType::MacApp,
                file_count: 1,
            })
        };
        receiver.handle(bulk(1)).unwrap();
        assert_eq!(
            receiver.handle(bulk(2)).unwrap(),
            Some(Message::BulkStartAck(Ack::reject(
                2,
                Reason::TransferAlreadyInProgress
            )))
        );
        assert_eq!(receiver.state().bulk_id, 1);
    }

    #[test]
    fn test_abort_bulk_mid_file() {
        let (mut sender, _events) = engine();
        let (mut receiver, mut receiver_events) = engine();

        let bulk = sender.begin_bulk(2).unwrap();
        exchange(&mut sender, &mut receiver, bulk.message);
        let mut start = sender
            .begin_send_file(Bytes::from_static(b"abcdefgh"), 0, 2, Bytes::new())
            .unwrap();
        exchange(&mut sender, &mut receiver, start.message.clone());
        let first = sender.next_fragment(start.id).unwrap().unwrap();
        exchange(&mut sender, &mut receiver, first);

        let end = sender.end_bulk(true, Reason::Aborted).unwrap();
        assert!(!sender.state().file_active());
        assert!(matches!(
            sender.next_fragment(start.id),
            Err(WireDropError::Cancelled)
        ));
        // FileStartAck was already consumed; nothing left for the file.
        assert!(start.ack.try_recv().is_ok());

        let reply = exchange(&mut sender, &mut receiver, end.message);
        assert_eq!(
            reply,
            Some(Message::BulkEndAck(Ack::reject(bulk.id, Reason::Aborted)))
        );
        assert!(!receiver.state().file_active());
        let events = drain(&mut receiver_events);
        assert!(events.contains(&TransferEvent::FileTransferFailed {
            file_id: start.id,
            reason: Reason::Aborted
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::ReceivedFile(_))));
    }

    #[test]
    fn test_ids_are_independent_and_increment() {
        let (mut sender, _events) = engine();
        let a = sender.begin_bulk(1).unwrap();
        let f = sender
            .begin_send_file(Bytes::new(), 0, 1, Bytes::new())
            .unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(f.id, 1);

        sender.abandon_file(f.id);
        let g = sender
            .begin_send_file(Bytes::new(), 0, 1, Bytes::new())
            .unwrap();
        assert_eq!(g.id, 2);
    }
}
