// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CP-side state machine (component H, §4.H): per-PD FSM, command queue,
//! and the PHY sub-FSM that drives one command/reply exchange at a time.

use crate::channel::{Channel, Clock, FileOps};
use crate::codec::{
    AcuRxSize, CmdBuzzer, CmdKeyset, CmdLed, CmdOutput, CmdText, CommandId, ComSet, FtStat, Mfg,
    NakReason, PdId, ReplyId,
};
use crate::config::{PdFlags, PdInfo};
use crate::crypto::{self, ScContext as CryptoScContext, SessionKeys, SC_KEY_LEN};
use crate::error::OsdpError;
use crate::file_transfer::{SenderSession, FRAGMENT_OVERHEAD_SLACK};
use crate::pcap::{Capture, Direction, NullWriter, PcapWriter};
use crate::phy::{self, BuildOptions, Role, ScContext};
use crate::queue::{Queue, CP_CMD_POOL_SIZE};
use crate::ring::{RxRing, RX_RING_SIZE};
use crate::wire::PACKET_BUF_SIZE;
use log::{debug, warn};

/// Time between unsolicited polls when the command queue is empty.
pub const POLL_TIMEOUT_MS: i64 = 50;
/// Time to wait for a reply before treating the exchange as failed.
pub const RESP_TIMEOUT_MS: i64 = 200;
/// Time to wait after a `BUSY` reply before resending.
pub const CMD_RETRY_WAIT_MS: i64 = 500;
/// Consecutive phy failures before a PD is marked `OFFLINE`.
pub const MAX_RETRY: u8 = 3;
/// Back-off before re-attempting the secure channel handshake after a
/// failure, in seconds.
pub const SC_RETRY_SEC: i64 = 600;
/// Back-off before re-probing an `OFFLINE` PD, in seconds.
pub const ERR_RETRY_SEC: i64 = 300;

/// Per-PD top-level state (§4.H).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpState {
    Init,
    Capdet,
    AcuRxSize,
    ScChlng,
    ScScrypt,
    SetScbk,
    Online,
    Offline,
    Disabled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PhySubState {
    Idle,
    SendCmd,
    ReplyWait,
    WaitBusy,
}

/// Outcome of driving a PD one step; callers may use this to decide whether
/// to keep yielding CPU within the same tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickResult {
    None,
    InProgress,
    CanYield,
    Err,
}

/// An application-submitted command, queued per PD and sent FIFO.
#[derive(Copy, Clone, Debug)]
pub enum Command {
    Output(CmdOutput),
    Led(CmdLed),
    Buzzer(CmdBuzzer),
    Text(CmdText),
    Comset(ComSet),
    Keyset(CmdKeyset),
    Mfg(Mfg),
    /// Starts (or, with `cancel`, cancels) a chunked file transfer. Carries
    /// no wire encoding of its own: popping this off the queue starts the
    /// sender session, which then drives its own `FILETRANSFER` fragments
    /// on subsequent poll cycles (§4.G).
    FileTx { file_id: i32, cancel: bool },
    KeepActive,
    Abort,
}

impl Command {
    fn command_id(&self) -> CommandId {
        match self {
            Command::Output(_) => CommandId::Out,
            Command::Led(_) => CommandId::Led,
            Command::Buzzer(_) => CommandId::Buz,
            Command::Text(_) => CommandId::Text,
            Command::Comset(_) => CommandId::Comset,
            Command::Keyset(_) => CommandId::Keyset,
            Command::Mfg(_) => CommandId::Mfg,
            Command::FileTx { .. } => CommandId::Filetransfer,
            Command::KeepActive => CommandId::Keepactive,
            Command::Abort => CommandId::Abort,
        }
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            Command::Output(c) => c.encode(buf).unwrap_or(0),
            Command::Led(c) => c.encode(buf).unwrap_or(0),
            Command::Buzzer(c) => c.encode(buf).unwrap_or(0),
            Command::Text(c) => c.encode(buf).unwrap_or(0),
            Command::Comset(c) => c.encode(buf).unwrap_or(0),
            Command::Keyset(c) => c.encode(buf).unwrap_or(0),
            Command::Mfg(c) => c.encode(buf).unwrap_or(0),
            Command::FileTx { .. } | Command::KeepActive | Command::Abort => 0,
        }
    }
}

/// Notification kinds delivered through [`Event::Notification`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Command,
    ScStatus,
    PdStatus,
    FileTx,
}

/// Events surfaced to the application through the CP event callback (§6).
#[derive(Copy, Clone, Debug)]
pub enum Event {
    Ack,
    Nak(NakReason),
    PdIdReceived(PdId),
    Notification(NotificationKind, i32, i32),
}

/// Secure-channel session material held per PD.
#[derive(Default)]
struct ScState {
    active: bool,
    scbk: [u8; SC_KEY_LEN],
    keys: SessionKeys,
    cp_random: [u8; 8],
    pd_random: [u8; 8],
    cp_cryptogram: [u8; 16],
    own_mac: [u8; 16],
    peer_mac: [u8; 16],
    last_failure_millis: i64,
}

/// One PD's complete CP-side link state. `P` is the packet-capture sink
/// (component K); it defaults to [`NullWriter`] so callers who never set
/// `CAPTURE_PACKETS` pay nothing for it.
pub struct PdLink<C: Channel, P: PcapWriter = NullWriter> {
    pub info: PdInfo,
    pub enabled: bool,
    channel: C,
    pcap: P,
    rx: RxRing<RX_RING_SIZE>,
    scratch: [u8; PACKET_BUF_SIZE],
    state: CpState,
    phy_state: PhySubState,
    seq: u8,
    retry_count: u8,
    last_send_millis: i64,
    last_poll_millis: i64,
    peer_rx_size: u16,
    identity: Option<PdId>,
    capabilities: [crate::codec::CapEntry; crate::codec::MAX_CAP_ENTRIES],
    n_capabilities: usize,
    sc_capable: bool,
    sc: ScState,
    cmds: Queue<Command, CP_CMD_POOL_SIZE>,
    in_flight: Option<Command>,
    file_tx: SenderSession,
    file_tx_sent_len: u32,
    pending_scbk: Option<[u8; SC_KEY_LEN]>,
}

impl<C: Channel> PdLink<C, NullWriter> {
    pub fn new(info: PdInfo, channel: C) -> Self {
        Self::with_pcap(info, channel, NullWriter)
    }
}

impl<C: Channel, P: PcapWriter> PdLink<C, P> {
    /// Builds a PD link that traces every sent/received frame to `pcap`
    /// whenever `CAPTURE_PACKETS` is set on `info.flags`.
    pub fn with_pcap(info: PdInfo, channel: C, pcap: P) -> Self {
        Self {
            enabled: true,
            channel,
            pcap,
            rx: RxRing::new(),
            scratch: [0; PACKET_BUF_SIZE],
            state: CpState::Init,
            phy_state: PhySubState::Idle,
            seq: 0,
            retry_count: 0,
            last_send_millis: 0,
            last_poll_millis: 0,
            peer_rx_size: PACKET_BUF_SIZE as u16,
            identity: None,
            capabilities: [crate::codec::CapEntry::default(); crate::codec::MAX_CAP_ENTRIES],
            n_capabilities: 0,
            sc_capable: false,
            sc: ScState::default(),
            cmds: Queue::new(),
            in_flight: None,
            file_tx: SenderSession::new(),
            file_tx_sent_len: 0,
            pending_scbk: None,
            info,
        }
    }

    /// Records `bytes` to the pcap sink, a no-op unless `CAPTURE_PACKETS`
    /// is set (§6 "Config options").
    fn capture(&mut self, direction: Direction, millis: i64, bytes: &[u8]) {
        if self.info.flags.contains(PdFlags::CAPTURE_PACKETS) {
            self.pcap.write(&Capture {
                pd_address: self.info.address,
                direction,
                millis,
                bytes,
            });
        }
    }

    pub fn submit_command(&mut self, cmd: Command) -> Result<(), OsdpError> {
        if !self.enabled {
            return Err(OsdpError::PdDisabled);
        }
        self.cmds.submit(cmd).map_err(OsdpError::from)
    }

    pub fn status_online(&self) -> bool {
        self.state == CpState::Online
    }

    pub fn sc_active(&self) -> bool {
        self.sc.active
    }

    /// Whether a file transfer is currently in progress on this PD.
    pub fn file_tx_active(&self) -> bool {
        self.file_tx.is_active()
    }

    /// The PD's identity, once learned from its `PDID` reply (`None` before
    /// the `ID` exchange completes).
    pub fn identity(&self) -> Option<PdId> {
        self.identity
    }

    /// The PD's advertised capabilities, once learned from its `PDCAP`
    /// reply (empty before the `CAP` exchange completes).
    pub fn capabilities(&self) -> &[crate::codec::CapEntry] {
        &self.capabilities[..self.n_capabilities]
    }

    /// Sets or clears a single behavior flag at runtime.
    pub fn modify_flag(&mut self, flag: PdFlags, set: bool) {
        self.info.flags.set(flag, set);
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.cmds.clear();
        self.rx.clear();
        self.state = CpState::Disabled;
        self.phy_state = PhySubState::Idle;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.state = CpState::Init;
        self.phy_state = PhySubState::Idle;
        self.retry_count = 0;
    }

    fn send(&mut self, id: u8, payload: &[u8], scb: Option<u8>, now: i64) {
        self.channel.flush();
        let sc_ctx = if self.sc.active {
            Some(CryptoScContext {
                s_enc: &self.sc.keys.s_enc,
                s_mac1: &self.sc.keys.s_mac1,
                s_mac2: &self.sc.keys.s_mac2,
                chain_mac: &self.sc.own_mac,
                allow_empty_encrypted_block: self
                    .info
                    .flags
                    .contains(PdFlags::ALLOW_EMPTY_ENCRYPTED_DATA_BLOCK),
            })
        } else {
            None
        };
        let opts = BuildOptions {
            role: Role::Cp,
            address: self.info.address,
            seq: self.seq,
            use_crc: self.info.flags.contains(PdFlags::USE_CRC),
            skip_mark_byte: self.info.flags.contains(PdFlags::SKIP_MARK_BYTE),
            scb: scb.map(|t| (t, sc_ctx)),
        };
        let mut out = [0u8; PACKET_BUF_SIZE];
        if let Ok((n, new_mac)) = phy::build_packet(&opts, id, payload, &mut out, self.peer_rx_size as usize) {
            self.channel.send(&out[..n]);
            self.capture(Direction::Tx, now, &out[..n]);
            if let Some(mac) = new_mac {
                self.sc.own_mac = mac;
            }
        }
        self.last_send_millis = now;
        self.phy_state = PhySubState::ReplyWait;
    }

    /// Picks the SCBK to use for this handshake (§4.D): the install-mode
    /// default if `INSTALL_MODE` is set, else a directly provisioned key if
    /// one is configured, else one derived from the master key and the PD's
    /// `PD_CLIENT_UID`, else the default as a last resort for PDs configured
    /// with neither (rejected earlier by `PdInfo::validate` unless
    /// `ENFORCE_SECURE` is unset).
    fn derive_scbk(&self, pd_client_uid: &[u8; 8]) -> [u8; SC_KEY_LEN] {
        if self.info.flags.contains(PdFlags::INSTALL_MODE) {
            return crypto::SCBK_DEFAULT;
        }
        if let Some(scbk) = self.info.scbk {
            return scbk;
        }
        if let Some(master_key) = self.info.master_key {
            return crypto::compute_scbk(&master_key, pd_client_uid);
        }
        crypto::SCBK_DEFAULT
    }

    fn sc_context(&self) -> Option<ScContext> {
        if !self.sc.active {
            return None;
        }
        Some(ScContext {
            s_enc: &self.sc.keys.s_enc,
            s_mac1: &self.sc.keys.s_mac1,
            s_mac2: &self.sc.keys.s_mac2,
            chain_mac: &self.sc.peer_mac,
            allow_empty_encrypted_block: self
                .info
                .flags
                .contains(PdFlags::ALLOW_EMPTY_ENCRYPTED_DATA_BLOCK),
        })
    }

    /// Advances this PD by one step. Returns an event if one should be
    /// delivered to the application. `file_ops` is consulted only while a
    /// file transfer is being started or driven (§4.G); pass `None` if this
    /// PD never transfers files.
    pub fn tick(&mut self, now: i64, file_ops: Option<&mut dyn FileOps>) -> (TickResult, Option<Event>) {
        if !self.enabled {
            return (TickResult::None, None);
        }

        if self.state == CpState::Offline && now - self.sc.last_failure_millis >= ERR_RETRY_SEC * 1000 {
            self.state = CpState::Init;
            self.retry_count = 0;
        }

        let mut buf = [0u8; 256];
        let n = self.channel.recv(&mut buf);
        if n > 0 {
            self.capture(Direction::Rx, now, &buf[..n]);
            self.rx.push_slice(&buf[..n]);
        }

        match self.phy_state {
            PhySubState::Idle => {
                self.begin_exchange(now, file_ops);
                (TickResult::CanYield, None)
            }
            PhySubState::SendCmd => {
                self.begin_exchange(now, file_ops);
                (TickResult::CanYield, None)
            }
            PhySubState::ReplyWait => self.poll_reply(now, file_ops),
            PhySubState::WaitBusy => {
                if now - self.last_send_millis >= CMD_RETRY_WAIT_MS {
                    self.phy_state = PhySubState::SendCmd;
                }
                (TickResult::InProgress, None)
            }
        }
    }

    fn begin_exchange(&mut self, now: i64, mut file_ops: Option<&mut dyn FileOps>) {
        match self.state {
            CpState::Init => {
                self.seq = 0;
                self.send(CommandId::Id as u8, &[0x00], None, now);
            }
            CpState::Capdet => {
                self.seq = self.seq.wrapping_add(1);
                if self.seq == 0 || self.seq > 3 {
                    self.seq = 1;
                }
                self.send(CommandId::Cap as u8, &[0x00], None, now);
            }
            CpState::AcuRxSize => {
                self.seq = next_seq(self.seq);
                let rx_size = AcuRxSize {
                    rx_size: PACKET_BUF_SIZE as u16,
                };
                let mut payload = [0u8; 2];
                let len = rx_size.encode(&mut payload).unwrap_or(0);
                self.send(CommandId::Acurxsize as u8, &payload[..len], None, now);
            }
            CpState::ScChlng => {
                self.seq = next_seq(self.seq);
                for (i, b) in self.sc.cp_random.iter_mut().enumerate() {
                    *b = (now as u8).wrapping_add(i as u8);
                }
                self.send(
                    CommandId::Chlng as u8,
                    &self.sc.cp_random,
                    Some(phy::scs::CHLNG),
                    now,
                );
            }
            CpState::ScScrypt => {
                self.seq = next_seq(self.seq);
                let cpc = self.sc.cp_cryptogram;
                self.send(CommandId::Scrypt as u8, &cpc, Some(phy::scs::SCRYPT), now);
            }
            CpState::SetScbk | CpState::Online => {
                self.seq = next_seq(self.seq);
                if self.file_tx.is_active() {
                    if let Some(ops) = file_ops.as_deref_mut() {
                        self.send_file_fragment(now, ops);
                        return;
                    }
                    self.file_tx.cancel();
                }
                if let Some(cmd) = self.cmds.pop() {
                    match cmd {
                        Command::FileTx { file_id, cancel } => {
                            if cancel {
                                self.file_tx.cancel();
                            } else if let Some(ops) = file_ops.as_deref_mut() {
                                let _ = self.file_tx.start(file_id, ops);
                            }
                            self.last_poll_millis = now;
                            self.send_with_sc(CommandId::Poll as u8, &[], now);
                        }
                        Command::Keyset(ks) => {
                            let mut key = [0u8; SC_KEY_LEN];
                            let n = (ks.length as usize).min(SC_KEY_LEN);
                            key[..n].copy_from_slice(&ks.data[..n]);
                            self.pending_scbk = Some(key);
                            let mut payload = [0u8; 64];
                            let len = cmd.encode(&mut payload);
                            let id = cmd.command_id() as u8;
                            self.in_flight = Some(cmd);
                            self.send_with_sc(id, &payload[..len], now);
                        }
                        _ => {
                            let mut payload = [0u8; 64];
                            let len = cmd.encode(&mut payload);
                            let id = cmd.command_id() as u8;
                            self.in_flight = Some(cmd);
                            self.send_with_sc(id, &payload[..len], now);
                        }
                    }
                } else {
                    self.last_poll_millis = now;
                    self.send_with_sc(CommandId::Poll as u8, &[], now);
                }
            }
            CpState::Offline | CpState::Disabled => {
                self.phy_state = PhySubState::Idle;
            }
        }
    }

    /// Reads the next chunk from the active sender session and sends it as
    /// a `FILETRANSFER` command, sized to fit within the peer's announced
    /// RX buffer (§4.G).
    fn send_file_fragment(&mut self, now: i64, ops: &mut dyn FileOps) {
        let max_chunk = (self.peer_rx_size as usize).saturating_sub(FRAGMENT_OVERHEAD_SLACK);
        let mut data = [0u8; PACKET_BUF_SIZE];
        match self.file_tx.next_fragment(ops, max_chunk.min(data.len()), &mut data) {
            Ok(Some((file_type, size, offset, chunk))) => {
                self.file_tx_sent_len = chunk.len() as u32;
                let frag = crate::codec::FileTransferFragment {
                    file_type,
                    size,
                    offset,
                    data: chunk,
                };
                let mut payload = [0u8; PACKET_BUF_SIZE];
                if let Ok(n) = frag.encode(&mut payload) {
                    self.send_with_sc(CommandId::Filetransfer as u8, &payload[..n], now);
                    return;
                }
            }
            _ => {}
        }
        self.last_poll_millis = now;
        self.send_with_sc(CommandId::Poll as u8, &[], now);
    }

    fn send_with_sc(&mut self, id: u8, payload: &[u8], now: i64) {
        let scb = if self.sc.active {
            Some(phy::scs::ENC_CP)
        } else {
            None
        };
        self.send(id, payload, scb, now);
    }

    fn poll_reply(&mut self, now: i64, file_ops: Option<&mut dyn FileOps>) -> (TickResult, Option<Event>) {
        let sc = self.sc_context();
        let skip_seq_check = self.info.flags.contains(PdFlags::SKIP_SEQ_CHECK);
        let result = phy::scan_packet(&mut self.rx, &mut self.scratch, Role::Cp, self.info.address, self.seq, skip_seq_check, sc.as_ref());
        match result {
            Ok(pkt) => {
                if let Some(mac) = pkt.new_mac {
                    self.sc.peer_mac = mac;
                }
                let reply_id = ReplyId::from_u8(pkt.id);
                if !self.reply_is_expected(reply_id) {
                    warn!("discarding unsolicited reply {:?} in state {:?}", reply_id, self.state);
                    if self.info.flags.contains(PdFlags::IGN_UNSOLICITED) {
                        // Discarded without touching retry state: it does not
                        // satisfy the outstanding command's timeout, so we
                        // stay in ReplyWait for the real reply.
                        return (TickResult::InProgress, None);
                    }
                    let event = self.on_exchange_failed(now);
                    return (TickResult::Err, event);
                }
                self.retry_count = 0;
                let payload = heapless_copy(pkt.payload);
                let event = self.handle_reply(reply_id, &payload.0[..payload.1], now, file_ops);
                self.phy_state = PhySubState::Idle;
                (TickResult::CanYield, event)
            }
            Err(crate::error::PhyError::Wait) => {
                if now - self.last_send_millis >= RESP_TIMEOUT_MS {
                    let event = self.on_exchange_failed(now);
                    (TickResult::Err, event)
                } else {
                    (TickResult::InProgress, None)
                }
            }
            Err(crate::error::PhyError::Busy) => {
                self.phy_state = PhySubState::WaitBusy;
                (TickResult::InProgress, None)
            }
            Err(_) => {
                let event = self.on_exchange_failed(now);
                (TickResult::Err, event)
            }
        }
    }

    /// Counts one failed exchange; once `MAX_RETRY` is reached the PD goes
    /// `OFFLINE` and the application is notified (§7 "Timeouts / repeated
    /// failures").
    fn on_exchange_failed(&mut self, now: i64) -> Option<Event> {
        self.retry_count += 1;
        self.phy_state = PhySubState::Idle;
        if self.retry_count >= MAX_RETRY && self.state != CpState::Offline {
            debug!("pd {} -> Offline after {} retries", self.info.address, self.retry_count);
            self.state = CpState::Offline;
            self.sc.last_failure_millis = now;
            return self.notify(NotificationKind::PdStatus, 0, 0);
        }
        None
    }

    /// Builds a `Notification` event, suppressed unless `ENABLE_NOTIFICATION`
    /// is set on this PD (§6 "Config options").
    fn notify(&self, kind: NotificationKind, a: i32, b: i32) -> Option<Event> {
        if self.info.flags.contains(PdFlags::ENABLE_NOTIFICATION) {
            Some(Event::Notification(kind, a, b))
        } else {
            None
        }
    }

    /// Whether `reply_id` is a solicited response to the exchange this PD
    /// currently has outstanding. Anything else is unsolicited (§7 "(b)
    /// Unsolicited reply while a command is in flight").
    fn reply_is_expected(&self, reply_id: Option<ReplyId>) -> bool {
        matches!(
            (self.state, reply_id),
            (CpState::Init, Some(ReplyId::Pdid))
                | (CpState::Capdet, Some(ReplyId::Pdcap))
                | (CpState::AcuRxSize, Some(ReplyId::Ack))
                | (CpState::ScChlng, Some(ReplyId::Ccrypt))
                | (CpState::ScScrypt, Some(ReplyId::RmacI))
                | (_, Some(ReplyId::Ftstat))
                | (_, Some(ReplyId::Ack))
                | (_, Some(ReplyId::Nak))
        )
    }

    fn handle_reply(
        &mut self,
        reply_id: Option<ReplyId>,
        payload: &[u8],
        now: i64,
        file_ops: Option<&mut dyn FileOps>,
    ) -> Option<Event> {
        match (self.state, reply_id) {
            (CpState::Init, Some(ReplyId::Pdid)) => {
                if let Ok(id) = PdId::decode(payload) {
                    self.identity = Some(id);
                    self.state = CpState::Capdet;
                    return Some(Event::PdIdReceived(id));
                }
                None
            }
            (CpState::Capdet, Some(ReplyId::Pdcap)) => {
                let mut entries = [crate::codec::CapEntry::default(); crate::codec::MAX_CAP_ENTRIES];
                let n = crate::codec::decode_pdcap(payload, &mut entries).unwrap_or(0);
                let mut sc_capable = false;
                for e in &entries[..n] {
                    if e.function_code == crate::codec::CAP_COMMUNICATION_SECURITY && e.compliance_level & 1 != 0 {
                        sc_capable = true;
                    }
                    if e.function_code == crate::codec::CAP_RECEIVE_BUFFERSIZE {
                        self.peer_rx_size = (e.num_items as u16).max(wire_min());
                    }
                }
                self.capabilities = entries;
                self.n_capabilities = n;
                self.sc_capable = sc_capable;
                self.state = CpState::AcuRxSize;
                debug!("pd {} -> {:?}", self.info.address, self.state);
                self.notify(NotificationKind::PdStatus, 1, 0)
            }
            (CpState::AcuRxSize, Some(ReplyId::Ack)) => {
                self.state = if self.sc_capable || self.info.flags.contains(PdFlags::ENFORCE_SECURE) {
                    CpState::ScChlng
                } else {
                    CpState::Online
                };
                debug!("pd {} -> {:?}", self.info.address, self.state);
                None
            }
            (CpState::ScChlng, Some(ReplyId::Ccrypt)) => {
                if payload.len() < 32 {
                    return None;
                }
                let mut pd_client_uid = [0u8; 8];
                pd_client_uid.copy_from_slice(&payload[0..8]);
                self.sc.pd_random.copy_from_slice(&payload[8..16]);
                let mut pd_cryptogram = [0u8; 16];
                pd_cryptogram.copy_from_slice(&payload[16..32]);

                let scbk = self.derive_scbk(&pd_client_uid);
                self.sc.scbk = scbk;
                self.sc.keys = SessionKeys::derive(&scbk, &self.sc.cp_random);
                let expected = crypto::pd_cryptogram(&self.sc.keys.s_enc, &self.sc.cp_random, &self.sc.pd_random);
                if expected != pd_cryptogram {
                    warn!("pd {} cryptogram mismatch, falling back to plaintext", self.info.address);
                    self.state = CpState::Online;
                    return self.notify(NotificationKind::ScStatus, 0, 0);
                }
                self.sc.cp_cryptogram = crypto::cp_cryptogram(&self.sc.keys.s_enc, &self.sc.pd_random, &self.sc.cp_random);
                self.state = CpState::ScScrypt;
                None
            }
            (CpState::ScScrypt, Some(ReplyId::RmacI)) => {
                if payload.len() < 16 {
                    return None;
                }
                self.sc.active = true;
                self.sc.own_mac = self.sc.cp_cryptogram;
                self.sc.peer_mac.copy_from_slice(&payload[0..16]);
                self.state = CpState::Online;
                debug!("pd {} secure channel established", self.info.address);
                self.notify(NotificationKind::ScStatus, 1, 0)
            }
            (_, Some(ReplyId::Ftstat)) => {
                let stat = FtStat::decode(payload).ok()?;
                let ops = file_ops?;
                match self.file_tx.on_ftstat(self.file_tx_sent_len, stat, ops) {
                    Ok(true) => self.notify(NotificationKind::FileTx, 1, 0),
                    Ok(false) => None,
                    Err(_) => self.notify(NotificationKind::FileTx, 0, stat.status.to_i16() as i32),
                }
            }
            (CpState::SetScbk, Some(ReplyId::Ack)) => {
                // One clean exchange under the dropped session completed;
                // restart the handshake with the new key (§4.H KEYSET).
                self.in_flight = None;
                self.state = CpState::ScChlng;
                Some(Event::Ack)
            }
            (_, Some(ReplyId::Ack)) => {
                let was_keyset = matches!(self.in_flight, Some(Command::Keyset(_)));
                self.in_flight = None;
                if was_keyset {
                    if let Some(new_key) = self.pending_scbk.take() {
                        // Installed as the static config key so the next
                        // handshake's CCRYPT step re-derives session keys
                        // from it (see the ScChlng/Ccrypt arm above).
                        self.info.scbk = Some(new_key);
                    }
                    self.sc.active = false;
                    self.state = CpState::SetScbk;
                    return self.notify(NotificationKind::ScStatus, 0, 1);
                }
                Some(Event::Ack)
            }
            (_, Some(ReplyId::Nak)) => {
                self.in_flight = None;
                let reason = payload.first().and_then(|b| NakReason::from_u8(*b)).unwrap_or(NakReason::None);
                Some(Event::Nak(reason))
            }
            _ => {
                let _ = now;
                None
            }
        }
    }
}

fn next_seq(seq: u8) -> u8 {
    if seq == 0 || seq >= 3 {
        1
    } else {
        seq + 1
    }
}

fn wire_min() -> u16 {
    crate::wire::PACKET_MIN_LEN as u16
}

/// A small fixed-size buffer + length, used to copy a scanned packet's
/// payload out before the borrow on `scratch` ends.
struct PayloadCopy([u8; 128], usize);

fn heapless_copy(payload: &[u8]) -> PayloadCopy {
    let mut buf = [0u8; 128];
    let n = payload.len().min(128);
    buf[..n].copy_from_slice(&payload[..n]);
    PayloadCopy(buf, n)
}

/// A multi-PD CP context. `N` bounds the number of PDs (1..=126).
pub struct ControlPanel<C: Channel, CK: Clock, const N: usize> {
    pub clock: CK,
    pub pds: heapless::Vec<PdLink<C>, N>,
}

impl<C: Channel, CK: Clock, const N: usize> ControlPanel<C, CK, N> {
    pub fn new(clock: CK) -> Self {
        Self {
            clock,
            pds: heapless::Vec::new(),
        }
    }

    pub fn add_pd(&mut self, info: PdInfo, channel: C) -> Result<usize, OsdpError> {
        info.validate()?;
        let idx = self.pds.len();
        self.pds
            .push(PdLink::new(info, channel))
            .map_err(|_| OsdpError::InvalidConfig)?;
        Ok(idx)
    }

    pub fn submit_command(&mut self, pd: usize, cmd: Command) -> Result<(), OsdpError> {
        self.pds.get_mut(pd).ok_or(OsdpError::InvalidPd)?.submit_command(cmd)
    }

    pub fn disable_pd(&mut self, pd: usize) -> Result<(), OsdpError> {
        self.pds.get_mut(pd).ok_or(OsdpError::InvalidPd)?.disable();
        Ok(())
    }

    pub fn enable_pd(&mut self, pd: usize) -> Result<(), OsdpError> {
        self.pds.get_mut(pd).ok_or(OsdpError::InvalidPd)?.enable();
        Ok(())
    }

    pub fn is_pd_enabled(&self, pd: usize) -> Result<bool, OsdpError> {
        Ok(self.pds.get(pd).ok_or(OsdpError::InvalidPd)?.enabled)
    }

    pub fn modify_flag(&mut self, pd: usize, flag: PdFlags, set: bool) -> Result<(), OsdpError> {
        self.pds.get_mut(pd).ok_or(OsdpError::InvalidPd)?.modify_flag(flag, set);
        Ok(())
    }

    pub fn get_pd_id(&self, pd: usize) -> Result<Option<PdId>, OsdpError> {
        Ok(self.pds.get(pd).ok_or(OsdpError::InvalidPd)?.identity())
    }

    pub fn get_capability(&self, pd: usize) -> Result<&[crate::codec::CapEntry], OsdpError> {
        Ok(self.pds.get(pd).ok_or(OsdpError::InvalidPd)?.capabilities())
    }

    /// Drives every PD by one cooperative step.
    pub fn refresh(&mut self) -> heapless::Vec<(usize, Event), N> {
        let now = self.clock.millis_now();
        let mut events = heapless::Vec::new();
        for (i, pd) in self.pds.iter_mut().enumerate() {
            let (_result, event) = pd.tick(now, None);
            if let Some(ev) = event {
                let _ = events.push((i, ev));
            }
        }
        events
    }

    pub fn status_mask(&self) -> u32 {
        let mut mask = 0u32;
        for (i, pd) in self.pds.iter().enumerate() {
            if pd.status_online() {
                mask |= 1 << i;
            }
        }
        mask
    }

    pub fn sc_status_mask(&self) -> u32 {
        let mut mask = 0u32;
        for (i, pd) in self.pds.iter().enumerate() {
            if pd.sc_active() {
                mask |= 1 << i;
            }
        }
        mask
    }
}
