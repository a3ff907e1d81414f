use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::Packet;
use crate::device::{ConnectionState, DeviceRecord, LockState};
use crate::error::ErrorKind;
use crate::events::LockEvent;
use crate::hw::PeerId;
use crate::offline::SessionValue;
use crate::protocol::{Destination, PACKET_SIZE, ResultCode};
use crate::utils::format_hex;

/// Strict FIFO of encrypted packets with at most one in flight.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    pending: VecDeque<Packet>,
}

impl CommandQueue {
    /// Appends a packet. Returns `true` when the queue was idle, meaning the
    /// new head must be transmitted now.
    pub(crate) fn push(&mut self, packet: Packet) -> bool {
        let was_idle = self.pending.is_empty();
        self.pending.push_back(packet);
        was_idle
    }

    pub(crate) fn head(&self) -> Option<&Packet> {
        self.pending.front()
    }

    /// Drops the acknowledged head and returns the next packet to transmit.
    pub(crate) fn advance(&mut self) -> Option<Packet> {
        self.pending.pop_front();
        self.pending.front().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Side effects requested by a session transition. The manager applies them
/// in order after releasing its lock.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionEffect {
    Transmit(Packet),
    RecordResponse {
        response: String,
        session: SessionValue,
    },
    ClearUploads,
    FlushUploads,
    ConfirmRestore {
        command_id: u8,
    },
    Disconnect,
    Emit(LockEvent),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum QueueAction {
    Advance,
    Abort,
}

/// An in-progress connection attempt that may be cancelled.
#[derive(Debug, Clone)]
pub(crate) struct ConnectAttempt {
    id: u64,
    cancel: CancellationToken,
}

impl ConnectAttempt {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Connection state, command queue and decode state for one lock.
#[derive(Debug)]
pub(crate) struct DeviceSession {
    record: DeviceRecord,
    queue: CommandQueue,
    restoring: bool,
    shut_down: bool,
    peer: Option<PeerId>,
    firmware_update: bool,
    connect_attempt: Option<ConnectAttempt>,
}

impl DeviceSession {
    pub(crate) fn new(mut record: DeviceRecord) -> Self {
        record.reset_connection();
        Self {
            record,
            queue: CommandQueue::default(),
            restoring: false,
            shut_down: false,
            peer: None,
            firmware_update: false,
            connect_attempt: None,
        }
    }

    pub(crate) fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut DeviceRecord {
        &mut self.record
    }

    pub(crate) fn address(&self) -> &str {
        self.record.address()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.record.connection_state()
    }

    pub(crate) fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub(crate) fn is_restoring(&self) -> bool {
        self.restoring
    }

    /// Whether the lock can take commands on this connection. A lock that
    /// reported `SHUTDOWN` accepts nothing until it reconnects.
    pub(crate) fn accepts_commands(&self) -> bool {
        self.state().has_session() && self.record.session().is_some() && !self.shut_down
    }

    pub(crate) fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub(crate) fn set_peer(&mut self, peer: PeerId) {
        self.peer = Some(peer);
    }

    pub(crate) fn is_firmware_update(&self) -> bool {
        self.firmware_update
    }

    pub(crate) fn set_firmware_update(&mut self, firmware_update: bool) {
        self.firmware_update = firmware_update;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.record.set_connection_state(state);
    }

    /// Starts a connection attempt and moves to `Connecting`.
    pub(crate) fn begin_connect(&mut self, attempt: ConnectAttempt) {
        if let Some(previous) = self.connect_attempt.replace(attempt) {
            previous.cancel.cancel();
        }
        self.set_state(ConnectionState::Connecting);
    }

    /// Whether `attempt_id` is still the live attempt for this lock.
    pub(crate) fn is_current_attempt(&self, attempt_id: u64) -> bool {
        self.connect_attempt
            .as_ref()
            .is_some_and(|attempt| attempt.id == attempt_id)
            && self.state() == ConnectionState::Connecting
    }

    /// Ends the current attempt without touching the connection state.
    pub(crate) fn finish_connect(&mut self) {
        self.connect_attempt = None;
    }

    /// Cancels a pending attempt after a timeout. The lock can be re-derived
    /// from its advertisements, so it returns to `Discovered`.
    pub(crate) fn abandon_connect(&mut self) {
        if let Some(attempt) = self.connect_attempt.take() {
            attempt.cancel.cancel();
        }
        self.clear_connection();
        self.set_state(ConnectionState::Discovered);
    }

    /// Ends a pending attempt that the transport refused. The lock stays in
    /// `Error` until it is seen advertising again or reconnected.
    pub(crate) fn fail_connect(&mut self) {
        if let Some(attempt) = self.connect_attempt.take() {
            attempt.cancel.cancel();
        }
        self.clear_connection();
        self.set_state(ConnectionState::Error);
    }

    /// Stores the session value read after connecting.
    pub(crate) fn session_established(&mut self, session: SessionValue) -> Vec<SessionEffect> {
        self.connect_attempt = None;
        self.record.set_session(session);
        self.set_state(ConnectionState::Connected);
        debug!(address = %self.address(), %session, "session established");

        vec![SessionEffect::Emit(LockEvent::Connected {
            address: self.address().to_string(),
            battery_millivolts: session.battery_millivolts(),
        })]
    }

    /// Resets to `Disconnected`, dropping the queue unsent. Returns `false`
    /// when the lock was already disconnected.
    pub(crate) fn disconnected(&mut self) -> bool {
        if let Some(attempt) = self.connect_attempt.take() {
            attempt.cancel.cancel();
        }
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        if !self.queue.is_empty() {
            warn!(
                address = %self.address(),
                dropped = self.queue.len(),
                "dropping unsent commands on disconnect"
            );
        }
        self.clear_connection();
        self.set_state(ConnectionState::Disconnected);
        true
    }

    /// Queues packets, transmitting the head if nothing was in flight.
    pub(crate) fn enqueue(
        &mut self,
        packets: impl IntoIterator<Item = Packet>,
        restoring: bool,
    ) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.shut_down {
            warn!(address = %self.address(), "lock has shut down; dropping commands");
            return effects;
        }
        let mut transmit_head = false;
        for packet in packets {
            transmit_head |= self.queue.push(packet);
        }
        if self.queue.is_empty() {
            return effects;
        }
        if restoring {
            self.restoring = true;
        }

        if self.state() != ConnectionState::Syncing {
            self.set_state(ConnectionState::Syncing);
            effects.push(SessionEffect::Emit(LockEvent::Syncing {
                address: self.address().to_string(),
            }));
        }
        if transmit_head && let Some(head) = self.queue.head() {
            effects.push(SessionEffect::Transmit(*head));
        }
        effects
    }

    /// Decodes one inbound packet from the receive characteristic.
    pub(crate) fn receive(&mut self, bytes: &[u8]) -> Vec<SessionEffect> {
        trace!(address = %self.address(), payload = %format_hex(bytes), "received packet");

        if bytes.len() != PACKET_SIZE {
            return vec![self.error(
                ErrorKind::InvalidPacket,
                format!("expected {PACKET_SIZE} bytes, got {}", bytes.len()),
            )];
        }

        match Destination::from_repr(bytes[0]) {
            Some(Destination::Server) => self.receive_server(bytes),
            Some(Destination::App) => self.receive_app(bytes),
            _ => vec![self.error(
                ErrorKind::InvalidPacket,
                format!("unexpected destination byte 0x{:02x}", bytes[0]),
            )],
        }
    }

    fn receive_server(&self, bytes: &[u8]) -> Vec<SessionEffect> {
        let Some(session) = self.record.session() else {
            warn!(address = %self.address(), "dropping log response received without a session");
            return Vec::new();
        };
        vec![SessionEffect::RecordResponse {
            response: hex::encode(bytes),
            session: *session,
        }]
    }

    fn receive_app(&mut self, bytes: &[u8]) -> Vec<SessionEffect> {
        let code = bytes[1];
        match ResultCode::from_repr(code) {
            Some(ResultCode::Success) => self.on_success(bytes[2]),
            Some(ResultCode::Shutdown) => self.on_shutdown(bytes[2], bytes[3]),
            Some(ResultCode::InvalidKey) => {
                self.on_failure(ErrorKind::InvalidKey, QueueAction::Abort)
            }
            Some(result) => {
                let kind =
                    ErrorKind::from_result_code(result).unwrap_or(ErrorKind::UnknownResult(code));
                self.on_failure(kind, QueueAction::Advance)
            }
            None => self.on_failure(ErrorKind::UnknownResult(code), QueueAction::Advance),
        }
    }

    fn on_success(&mut self, command_id: u8) -> Vec<SessionEffect> {
        if self.restoring {
            debug!(address = %self.address(), command_id, "restore acknowledged");
            self.restoring = false;
            self.queue.clear();
            self.set_state(ConnectionState::Connected);
            return vec![
                SessionEffect::ClearUploads,
                SessionEffect::ConfirmRestore { command_id },
                SessionEffect::Disconnect,
            ];
        }

        if let Some(next) = self.queue.advance() {
            return vec![SessionEffect::Transmit(next)];
        }

        self.record.set_lock_state(LockState::Unlocked);
        self.set_state(ConnectionState::Unlocked);
        vec![
            SessionEffect::Emit(LockEvent::Unlocked {
                address: self.address().to_string(),
            }),
            SessionEffect::FlushUploads,
        ]
    }

    fn on_shutdown(&mut self, lock_state: u8, timeout_flag: u8) -> Vec<SessionEffect> {
        let is_locked = lock_state == 1;
        self.queue.clear();
        self.restoring = false;
        self.shut_down = true;
        self.record.set_lock_state(if is_locked {
            LockState::Locked
        } else {
            LockState::Unlocked
        });
        if self.state() == ConnectionState::Syncing {
            self.set_state(ConnectionState::Connected);
        }

        vec![SessionEffect::Emit(LockEvent::ShutDown {
            address: self.address().to_string(),
            is_locked,
            did_timeout: timeout_flag != 1,
        })]
    }

    fn on_failure(&mut self, kind: ErrorKind, action: QueueAction) -> Vec<SessionEffect> {
        self.restoring = false;
        let mut effects = vec![self.error(kind, format!("lock reported {kind}"))];
        match action {
            QueueAction::Abort => self.queue.clear(),
            QueueAction::Advance => {
                if let Some(next) = self.queue.advance() {
                    effects.push(SessionEffect::Transmit(next));
                }
            }
        }
        if self.queue.is_empty() && self.state() == ConnectionState::Syncing {
            self.set_state(ConnectionState::Connected);
        }
        effects
    }

    fn error(&self, kind: ErrorKind, message: String) -> SessionEffect {
        SessionEffect::Emit(LockEvent::error(kind, message, Some(self.address())))
    }

    fn clear_connection(&mut self) {
        self.queue.clear();
        self.restoring = false;
        self.shut_down = false;
        self.firmware_update = false;
        self.record.clear_session();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn packet(fill: u8) -> Packet {
        Packet::new([fill; PACKET_SIZE])
    }

    fn app(result: u8, byte2: u8, byte3: u8) -> [u8; PACKET_SIZE] {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0] = Destination::App as u8;
        bytes[1] = result;
        bytes[2] = byte2;
        bytes[3] = byte3;
        bytes
    }

    fn connected_session() -> DeviceSession {
        let record = DeviceRecord::builder().address(ADDRESS).build();
        let mut session = DeviceSession::new(record);
        session.begin_connect(ConnectAttempt::new(1));
        let _ = session.session_established(SessionValue::new([0x22; PACKET_SIZE]));
        session
    }

    fn transmitted(effects: &[SessionEffect]) -> Vec<Packet> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::Transmit(packet) => Some(*packet),
                _ => None,
            })
            .collect()
    }

    fn error_kinds(effects: &[SessionEffect]) -> Vec<ErrorKind> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::Emit(LockEvent::Error { kind, .. }) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn queue_push_reports_idle_transition_only_once() {
        let mut queue = CommandQueue::default();
        assert_eq!(true, queue.push(packet(1)));
        assert_eq!(false, queue.push(packet(2)));
        assert_eq!(Some(packet(2)), queue.advance());
        assert_eq!(None, queue.advance());
        assert_eq!(true, queue.is_empty());
    }

    #[test]
    fn session_established_moves_to_connected_with_battery() {
        let record = DeviceRecord::builder().address(ADDRESS).build();
        let mut session = DeviceSession::new(record);
        session.begin_connect(ConnectAttempt::new(3));
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[2] = 0xE8;
        bytes[3] = 0x03;

        let effects = session.session_established(SessionValue::new(bytes));

        assert_eq!(ConnectionState::Connected, session.state());
        assert_eq!(false, session.is_current_attempt(3));
        assert_eq!(
            vec![SessionEffect::Emit(LockEvent::Connected {
                address: ADDRESS.to_string(),
                battery_millivolts: 1000,
            })],
            effects
        );
    }

    #[test]
    fn commands_are_sent_one_at_a_time_in_order() {
        let mut session = connected_session();

        let effects = session.enqueue([packet(1), packet(2), packet(3)], false);
        assert_eq!(vec![packet(1)], transmitted(&effects));
        assert_eq!(ConnectionState::Syncing, session.state());

        let more = session.enqueue([packet(4)], false);
        assert_eq!(Vec::<Packet>::new(), transmitted(&more));

        let mut sent = vec![packet(1)];
        for _ in 0..3 {
            let effects = session.receive(&app(0x60, 0, 0));
            sent.extend(transmitted(&effects));
        }
        assert_eq!(vec![packet(1), packet(2), packet(3), packet(4)], sent);
        assert_eq!(ConnectionState::Syncing, session.state());
    }

    #[test]
    fn success_draining_queue_unlocks_and_flushes() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1)], false);

        let effects = session.receive(&app(0x60, 0, 0));

        assert_eq!(
            vec![
                SessionEffect::Emit(LockEvent::Unlocked {
                    address: ADDRESS.to_string()
                }),
                SessionEffect::FlushUploads,
            ],
            effects
        );
        assert_eq!(ConnectionState::Unlocked, session.state());
        assert_eq!(LockState::Unlocked, session.record().lock_state());
    }

    #[test]
    fn invalid_key_aborts_remaining_queue() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2), packet(3)], false);

        let effects = session.receive(&app(0x61, 0, 0));

        assert_eq!(vec![ErrorKind::InvalidKey], error_kinds(&effects));
        assert_eq!(Vec::<Packet>::new(), transmitted(&effects));
        assert_eq!(true, session.queue().is_empty());
        assert_eq!(ConnectionState::Connected, session.state());
    }

    #[rstest]
    #[case(0x62, ErrorKind::InvalidCmd)]
    #[case(0x63, ErrorKind::InvalidPermission)]
    #[case(0x65, ErrorKind::InvalidData)]
    #[case(0x66, ErrorKind::UnknownResult(0x66))]
    #[case(0x68, ErrorKind::FailedToLock)]
    #[case(0x69, ErrorKind::FailedToUnlock)]
    #[case(0x6A, ErrorKind::FailedToUnshackle)]
    #[case(0xFF, ErrorKind::InvalidResult)]
    #[case(0x42, ErrorKind::UnknownResult(0x42))]
    fn non_key_errors_advance_the_queue(#[case] result: u8, #[case] expected: ErrorKind) {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2)], false);

        let effects = session.receive(&app(result, 0, 0));

        assert_eq!(vec![expected], error_kinds(&effects));
        assert_eq!(vec![packet(2)], transmitted(&effects));
        assert_eq!(1, session.queue().len());
    }

    #[rstest]
    #[case(0x00)]
    #[case(0x52)]
    #[case(0xFF)]
    fn unexpected_destinations_do_not_advance(#[case] destination: u8) {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2)], false);
        let mut bytes = app(0x60, 0, 0);
        bytes[0] = destination;

        let effects = session.receive(&bytes);

        assert_eq!(vec![ErrorKind::InvalidPacket], error_kinds(&effects));
        assert_eq!(Vec::<Packet>::new(), transmitted(&effects));
        assert_eq!(2, session.queue().len());
    }

    #[test]
    fn short_packets_are_invalid() {
        let mut session = connected_session();
        let effects = session.receive(&[0x51, 0x60]);
        assert_eq!(vec![ErrorKind::InvalidPacket], error_kinds(&effects));
    }

    #[test]
    fn server_packets_are_recorded_with_session() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1)], false);
        let mut bytes = [0x11u8; PACKET_SIZE];
        bytes[0] = Destination::Server as u8;

        let effects = session.receive(&bytes);

        assert_matches!(
            effects.as_slice(),
            [SessionEffect::RecordResponse { response, session: value }]
                if *response == hex::encode(bytes)
                    && *value == SessionValue::new([0x22; PACKET_SIZE])
        );
        assert_eq!(1, session.queue().len());
    }

    #[rstest]
    #[case(1, 1, true, false)]
    #[case(0, 0, false, true)]
    #[case(1, 2, true, true)]
    fn shutdown_clears_queue_and_reports_flags(
        #[case] lock_byte: u8,
        #[case] timeout_byte: u8,
        #[case] is_locked: bool,
        #[case] did_timeout: bool,
    ) {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2)], false);

        let effects = session.receive(&app(0x64, lock_byte, timeout_byte));

        assert_eq!(
            vec![SessionEffect::Emit(LockEvent::ShutDown {
                address: ADDRESS.to_string(),
                is_locked,
                did_timeout,
            })],
            effects
        );
        assert_eq!(true, session.queue().is_empty());
        assert_eq!(false, session.accepts_commands());
    }

    #[test]
    fn shut_down_lock_ignores_commands_until_reconnected() {
        let mut session = connected_session();
        let _ = session.receive(&app(0x64, 1, 1));

        assert_eq!(Vec::<SessionEffect>::new(), session.enqueue([packet(3)], false));
        assert_eq!(true, session.queue().is_empty());

        assert_eq!(true, session.disconnected());
        session.begin_connect(ConnectAttempt::new(2));
        let _ = session.session_established(SessionValue::new([0x33; PACKET_SIZE]));

        assert_eq!(true, session.accepts_commands());
        assert_eq!(vec![packet(3)], transmitted(&session.enqueue([packet(3)], false)));
    }

    #[test]
    fn restore_success_is_terminal() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2), packet(3)], true);
        assert_eq!(true, session.is_restoring());

        let effects = session.receive(&app(0x60, 0x2A, 0));

        assert_eq!(
            vec![
                SessionEffect::ClearUploads,
                SessionEffect::ConfirmRestore { command_id: 0x2A },
                SessionEffect::Disconnect,
            ],
            effects
        );
        assert_eq!(true, session.queue().is_empty());
        assert_eq!(false, session.is_restoring());
    }

    #[test]
    fn restore_error_clears_flag_without_confirming() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1)], true);

        let effects = session.receive(&app(0x62, 0, 0));

        assert_eq!(vec![ErrorKind::InvalidCmd], error_kinds(&effects));
        assert_eq!(false, session.is_restoring());
        assert_eq!(
            false,
            effects
                .iter()
                .any(|effect| matches!(effect, SessionEffect::ConfirmRestore { .. }))
        );
    }

    #[test]
    fn disconnect_drops_queue_and_session_once() {
        let mut session = connected_session();
        let _ = session.enqueue([packet(1), packet(2)], true);

        assert_eq!(true, session.disconnected());
        assert_eq!(false, session.disconnected());
        assert_eq!(ConnectionState::Disconnected, session.state());
        assert_eq!(true, session.queue().is_empty());
        assert_eq!(None, session.record().session());
        assert_eq!(false, session.is_restoring());
    }

    #[test]
    fn abandon_connect_cancels_attempt_and_returns_to_discovered() {
        let record = DeviceRecord::builder().address(ADDRESS).build();
        let mut session = DeviceSession::new(record);
        let attempt = ConnectAttempt::new(9);
        let token = attempt.cancel_token();
        session.begin_connect(attempt);
        assert_eq!(true, session.is_current_attempt(9));

        session.abandon_connect();

        assert_eq!(true, token.is_cancelled());
        assert_eq!(ConnectionState::Discovered, session.state());
        assert_eq!(false, session.is_current_attempt(9));
    }

    #[test]
    fn failed_connect_enters_error_without_holding_the_slot() {
        let record = DeviceRecord::builder().address(ADDRESS).build();
        let mut session = DeviceSession::new(record);
        let attempt = ConnectAttempt::new(4);
        let token = attempt.cancel_token();
        session.begin_connect(attempt);

        session.fail_connect();

        assert_eq!(true, token.is_cancelled());
        assert_eq!(ConnectionState::Error, session.state());
        assert_eq!(false, session.state().is_active());
        assert_eq!(None, session.record().session());
    }
}
