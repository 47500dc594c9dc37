use flagset::FlagSet;
use log::{debug, warn};

use crate::bits::{extract_bit_stream, insert_bit_stream, u32_to_ebv};
use crate::crc::{crc16_bitwise, crc16_bytewise};
use crate::radio::{Clock, RESP_TX_IRQ, Radio, RadioError, cmd, reg};
use crate::timing;
use crate::types::{
    AdaptiveQ, Coding, DivideRatio, Gen2Config, Gen2Error, InventoryStatistics, LockPayload,
    MAX_EPC_LENGTH, MAX_PC_LENGTH, MAX_READ_DATA_LEN, MemoryBank, QFP_SCALE, RssiMeasurement,
    SelectParams, SelectTarget, SlotEvent, Tag, TagError, Tari, TruncateToken, XPC_W1_XEB, adj_opt,
    stored_pc,
};

/// Transmit scratch: command byte, word pointer, word count, handle and one
/// spill byte on top of the largest PC/XPC/EPC/CRC reply.
const BUF_LEN: usize = 8 + MAX_EPC_LENGTH + MAX_PC_LENGTH + 2;

/// Slot-opening command of the anti-collision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotCommand {
    Query,
    QueryRep,
    QueryAdjustUp,
    QueryAdjustNic,
    QueryAdjustDown,
}

impl SlotCommand {
    fn direct(self) -> u8 {
        match self {
            SlotCommand::Query => cmd::QUERY,
            SlotCommand::QueryRep => cmd::QUERY_REP,
            SlotCommand::QueryAdjustUp => cmd::QUERY_ADJUST_UP,
            SlotCommand::QueryAdjustNic => cmd::QUERY_ADJUST_NIC,
            SlotCommand::QueryAdjustDown => cmd::QUERY_ADJUST_DOWN,
        }
    }

    fn is_adjust(self) -> bool {
        matches!(
            self,
            SlotCommand::QueryAdjustUp | SlotCommand::QueryAdjustNic | SlotCommand::QueryAdjustDown
        )
    }
}

/// What one inventory slot produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    /// A tag was read.
    Tag,
    /// Nobody answered.
    Empty,
    /// Undecodable or inconsistent backscatter.
    Error,
}

/// Parameters for one inventory round.
pub struct SearchParams<'a> {
    /// Fetch a handle per tag (slower slots, but access commands can follow
    /// immediately). Forced on when the handler supplies a follow command.
    pub singulate: bool,
    /// Chain a QueryRep after each successful read so the tag flips its
    /// inventoried flag right away.
    pub toggle_session: bool,
    /// Truncated-reply proof from a preceding Select, if any. Consumed by
    /// the round.
    pub truncate: Option<TruncateToken>,
    pub statistics: &'a mut InventoryStatistics,
    pub adaptive_q: &'a mut AdaptiveQ,
}

/// Observer driving an inventory round.
///
/// All methods have defaults; implement the ones the application needs.
pub trait SearchHandler<R: Radio, C: Clock> {
    /// A tag was singulated. Return `false` to end the round.
    fn tag_found(&mut self, tag: &Tag) -> bool {
        let _ = tag;
        true
    }

    /// A slot completed at tick `slot_time` with the given events and Q.
    fn slot_finished(&mut self, slot_time: u32, events: FlagSet<SlotEvent>, q: u8) {
        let _ = (slot_time, events, q);
    }

    /// Polled once per slot; return `false` to cancel the round at the next
    /// slot boundary. Teardown still runs.
    fn continue_scanning(&mut self) -> bool {
        true
    }

    /// Whether [`follow_tag_command`](Self::follow_tag_command) should run
    /// for every singulated tag. When true the round singulates and the
    /// session flag is toggled by an explicit QueryRep instead of a chained
    /// one.
    fn uses_follow_command(&self) -> bool {
        false
    }

    /// Issue access commands against the freshly singulated tag, which still
    /// holds a valid handle. An error drops the tag from the round.
    fn follow_tag_command(
        &mut self,
        reader: &mut Gen2Reader<R, C>,
        tag: &Tag,
    ) -> Result<(), Gen2Error> {
        let _ = (reader, tag);
        Ok(())
    }
}

/// The no-op handler: inventory for the statistics alone.
impl<R: Radio, C: Clock> SearchHandler<R, C> for () {}

/// Handler that clones every tag into a vector, for hosts that just want the
/// round's contents.
#[derive(Debug, Default)]
pub struct TagCollector {
    pub tags: Vec<Tag>,
}

impl<R: Radio, C: Clock> SearchHandler<R, C> for TagCollector {
    fn tag_found(&mut self, tag: &Tag) -> bool {
        self.tags.push(tag.clone());
        true
    }
}

/// Reader-side Gen2 protocol engine on top of a [`Radio`] and a [`Clock`].
///
/// Owns the transmit scratch buffer, the active configuration and the last
/// link error; none of the operations are re-entrant.
pub struct Gen2Reader<R: Radio, C: Clock> {
    radio: R,
    clock: C,
    config: Gen2Config,
    dr: DivideRatio,
    no_resp_time: u8,
    /// The transceiver delivers the reply CRC into the FIFO, so reply
    /// parsing must verify and strip it. Cached from PROTOCOL_CTRL per round.
    rx_without_crc: bool,
    last_err: Option<RadioError>,
    rssi_log_sum: u32,
    buf: [u8; BUF_LEN],
}

impl<R: Radio, C: Clock> Gen2Reader<R, C> {
    // Gen2 command opcodes placed in the transmit buffer. Slot commands
    // (Query, QueryRep, QueryAdjust, ACK, NAK) go out as transceiver direct
    // commands instead; the chip prepends their opcodes itself.
    const EPC_SELECT: u8 = 0x0A;
    const EPC_REQRN: u8 = 0xC1;
    const EPC_READ: u8 = 0xC2;
    const EPC_WRITE: u8 = 0xC3;
    const EPC_KILL: u8 = 0xC4;
    const EPC_LOCK: u8 = 0xC5;
    const EPC_ACCESS: u8 = 0xC6;
    const EPC_BLOCKWRITE: u8 = 0xC7;

    const MAX_ACK_RETRY: u8 = 2;

    /// Create a reader with the default link configuration. Nothing is
    /// programmed until [`open`](Self::open).
    pub fn new(radio: R, clock: C) -> Self {
        let config = Gen2Config::default();
        let profile = timing::derive(&config);
        Self {
            radio,
            clock,
            dr: profile.dr,
            no_resp_time: profile.no_response_time(),
            config,
            rx_without_crc: false,
            last_err: None,
            rssi_log_sum: 0,
            buf: [0; BUF_LEN],
        }
    }

    /// Adopt a configuration without touching the radio.
    ///
    /// FM0 and Miller-2 require the pilot tone, so `trext` is forced on for
    /// them.
    pub fn configure(&mut self, mut config: Gen2Config) {
        if matches!(config.coding, Coding::Fm0 | Coding::Miller2) {
            config.trext = true;
        }
        self.config = config;
    }

    /// Adopt a configuration and program the transceiver's link registers,
    /// session bits and modulator accordingly. Idempotent.
    pub fn open(&mut self, config: Gen2Config) {
        self.configure(config);

        let profile = timing::derive(&self.config);
        self.dr = profile.dr;
        self.no_resp_time = profile.no_response_time();
        debug!("link profile {:02X?}", profile.regs);
        self.radio.register_write_many(reg::TX_OPTIONS, &profile.regs);

        // session bits live in the TX setting register
        let v = self.radio.register_read(reg::TX_SETTING);
        self.radio
            .register_write(reg::TX_SETTING, (v & 0xFC) | self.config.session as u8);

        // Gen2 mode, normal operation
        let v = self.radio.register_read(reg::PROTOCOL_CTRL) & 0xB8;
        self.radio.register_write(reg::PROTOCOL_CTRL, v);

        // modulation depth and shaping differ between PR-ASK and ASK
        let v = self.radio.register_read(reg::MODULATOR_CONTROL2);
        if v & 0x40 != 0 {
            let depth = if self.config.tari == Tari::Us25 {
                0xEF
            } else {
                0xE3
            };
            self.radio.register_write(reg::MODULATOR_CONTROL2, depth);
            self.radio.register_write(reg::MODULATOR_CONTROL4, 0x89);
        } else {
            self.radio.register_write(reg::MODULATOR_CONTROL2, 0x9D);
            self.radio.register_write(reg::MODULATOR_CONTROL4, 0x7E);
        }
    }

    /// Release the air interface. The transceiver keeps its programmed
    /// state; reopening is a plain [`open`](Self::open).
    pub fn close(&mut self) {}

    /// The active configuration.
    pub fn config(&self) -> &Gen2Config {
        &self.config
    }

    /// Receive status of the most recent transceive, if it failed.
    pub fn last_radio_error(&self) -> Option<RadioError> {
        self.last_err
    }

    /// Direct access to the transceiver, for board glue outside protocol
    /// operations.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Mutable access to the transceiver; see [`radio`](Self::radio).
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Send NAK, returning every tag in the field to arbitrate.
    pub fn nak(&mut self) {
        self.radio.direct_command(cmd::NAK);
    }

    // ========================================================================
    // Population selection
    // ========================================================================

    /// Transmit a Select, setting SL or inventoried flags across the
    /// population per `params`.
    ///
    /// Select draws no reply, so link errors are not reported here; the next
    /// round shows whether the population matched. Returns a
    /// [`TruncateToken`] when the Select armed truncated replies (truncation
    /// requested, target SL, EPC bank) — hand it to the next inventory round
    /// so the shortened replies are parsed correctly.
    pub fn select(&mut self, params: &SelectParams) -> Option<TruncateToken> {
        self.radio.clear_response();
        self.buf.fill(0);

        self.buf[0] = ((Self::EPC_SELECT << 4) & 0xF0)
            | (((params.target as u8) << 1) & 0x0E)
            | (((params.action as u8) >> 2) & 0x01);
        self.buf[1] =
            (((params.action as u8) << 6) & 0xC0) | (((params.mem_bank as u8) << 4) & 0x30);

        let ebv_len = insert_ebv(params.pointer, &mut self.buf[1..], 4);
        self.buf[1 + ebv_len] |= ((params.mask_bits >> 4) & 0x0F) as u8;
        self.buf[2 + ebv_len] = ((params.mask_bits << 4) & 0xF0) as u8;

        // the mask starts on a nibble boundary; shuffle it in byte by byte
        let mut i = 2 + ebv_len;
        let mut remaining = params.mask_bits;
        let mut mask_idx = 0usize;
        while remaining >= 8 {
            self.buf[i] |= (params.mask[mask_idx] >> 4) & 0x0F;
            i += 1;
            self.buf[i] = (params.mask[mask_idx] << 4) & 0xF0;
            remaining -= 8;
            mask_idx += 1;
        }

        let trunc = u8::from(params.truncate);
        if remaining == 0 {
            self.buf[i] |= (trunc << 3) & 0x08;
        } else {
            // partial final mask byte: merge its leading bits and the
            // truncate flag across the nibble boundary
            let left_bits = 0xFFu8 << (8 - remaining);
            let mask_byte = params.mask.get(mask_idx).copied().unwrap_or(0);
            self.buf[i] |= (left_bits >> 4) & (mask_byte >> 4);
            self.buf[i + 1] =
                ((u16::from(left_bits) << 4) as u8) & ((u16::from(mask_byte) << 4) as u8);
            let trunc_bit = (trunc & 0x01) << (7 - remaining);
            self.buf[i] |= trunc_bit >> 4;
            self.buf[i + 1] |= (u16::from(trunc_bit) << 4) as u8;
        }

        let tx_bits = params.mask_bits + 21 + (ebv_len as u16) * 8;

        let token = (params.truncate
            && params.target == SelectTarget::Sl
            && params.mem_bank == MemoryBank::Epc)
            .then_some(TruncateToken(()));

        // pseudo 1-bit receive with a tiny timeout so the transceiver state
        // machine finishes without a spurious no-response interrupt
        let mut resp = [0u8; 1];
        let mut rx_bits = 1u16;
        self.last_err = self
            .radio
            .tx_rx_gen2(
                cmd::TRANSM_CRC,
                &self.buf,
                tx_bits,
                &mut resp,
                &mut rx_bits,
                1,
                0,
                true,
            )
            .err();

        self.t4_wait();
        token
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Probe the field with a single Query and sample AGC and RSSI from
    /// whatever backscatter arrives.
    pub fn query_measure_rssi(&mut self, q: u8) -> Result<RssiMeasurement, Gen2Error> {
        self.radio.antenna_power(true);
        let mut irq = [0u8; 2];
        self.radio.register_read_many(reg::IRQ_STATUS1, &mut irq); // reset latched IRQ bits
        self.radio.clear_response();

        self.short_preamble_workaround(true);

        let query = self.query_image(q);
        let mut rn16 = [0u8; 2];
        let mut rx_bits = 16u16;
        let res = self.radio.tx_rx_gen2(
            cmd::QUERY,
            &query,
            16,
            &mut rn16,
            &mut rx_bits,
            self.no_resp_time,
            0,
            true,
        );
        self.last_err = res.err();

        let outcome = match res {
            Ok(()) => {
                let (rssi_lin_i, rssi_lin_q) = self.rssi_lin();
                let (agc, rssi_log_i, rssi_log_q) = self.agc_rssi_log();
                Ok(RssiMeasurement {
                    agc,
                    rssi_log_i,
                    rssi_log_q,
                    rssi_lin_i,
                    rssi_lin_q,
                })
            }
            Err(e) => Err(Gen2Error::Link(e)),
        };

        self.short_preamble_workaround(false);
        self.clock.delay_us(150);
        outcome
    }

    /// Run one inventory round of up to `2^Q` slots, reporting tags and slot
    /// telemetry to `handler`. Returns the number of tags read this round.
    ///
    /// With `manual_ack` the driver chains the ACK per slot; otherwise the
    /// transceiver's auto-ACK machinery runs the slot exchange on its own. Q adaptation, statistics and cancellation are controlled through
    /// `params` and the handler.
    pub fn search_for_tags<H>(
        &mut self,
        manual_ack: bool,
        params: SearchParams<'_>,
        handler: &mut H,
    ) -> u16
    where
        H: SearchHandler<R, C> + ?Sized,
    {
        let SearchParams {
            singulate,
            toggle_session,
            truncate,
            statistics: stats,
            adaptive_q,
        } = params;

        let mut num_of_tags: u16 = 0;
        let mut slot_cmd = SlotCommand::Query;
        let mut follow_cmd = 0u8;

        let options = adaptive_q.options;
        let reset_q_after_round = options & adj_opt::RESET_Q_AFTER_ROUND != 0;
        let use_ceil_floor = options & adj_opt::USE_CEIL_FLOOR != 0;
        let single_adjust = options & adj_opt::SINGLE_ADJUST != 0;
        let use_query_adjust_nic = options & adj_opt::USE_QUERY_ADJUST_NIC != 0;

        let max_q = u32::from(adaptive_q.max_q) * QFP_SCALE;
        let min_q = u32::from(adaptive_q.min_q) * QFP_SCALE;
        let mut adj_cnt: u32 = if single_adjust { 1 } else { u32::MAX };
        let mut qfp = adaptive_q.qfp;
        let mut c1 = [0u32; 16];
        let mut c2 = [0u32; 16];
        if adaptive_q.enabled {
            for i in 0..16 {
                c1[i] = u32::from(adaptive_q.c1[i]) * QFP_SCALE / 100;
                c2[i] = u32::from(adaptive_q.c2[i]) * QFP_SCALE / 100;
            }
        }

        let mut singulate = singulate;
        if toggle_session {
            follow_cmd = cmd::QUERY_REP;
        }
        if handler.uses_follow_command() {
            follow_cmd = 0;
            singulate = true; // follow commands need the handle
        }

        let initial_q = stats.q;
        let mut slot_count: u32 = 1 << stats.q;
        let mut tmp_q = u32::from(stats.q);

        self.radio.antenna_power(true);
        let mut irq = [0u8; 2];
        self.radio.register_read_many(reg::IRQ_STATUS1, &mut irq); // reset latched IRQ bits
        self.radio.clear_response();

        let prot_ctrl = self.radio.register_read(reg::PROTOCOL_CTRL);
        self.rx_without_crc = prot_ctrl & 0x80 != 0; // reply CRC lands in the FIFO

        if !manual_ack {
            // auto-ACK: 0x20 runs the slot through Req_RN (singulated),
            // 0x10 stops after the EPC (fast)
            let auto_ack = (prot_ctrl & !0x30) | if singulate { 0x20 } else { 0x10 };
            self.radio.register_write(reg::PROTOCOL_CTRL, auto_ack);
        }

        self.short_preamble_workaround(true);

        let truncating = truncate.is_some() && (self.config.sel as u8) & 0x02 != 0;
        drop(truncate); // consumed by this round

        let mut tag = Tag::default();
        let mut ready_for_more = true;
        let mut go_on;

        loop {
            slot_count -= 1;

            if slot_cmd.is_adjust() {
                // tags ignore anything inside T4 after a QueryAdjust
                self.t4_wait();
                self.radio.clear_response(); // clears the TX IRQ too
            }

            let mut events = FlagSet::<SlotEvent>::default();
            let slot_time = self.clock.ticks_ms();
            let outcome = self.slot(
                &mut tag,
                manual_ack,
                slot_cmd,
                stats.q,
                !singulate,
                follow_cmd,
                truncating,
                &mut events,
            );
            if slot_cmd == SlotCommand::QueryRep {
                events |= SlotEvent::QueryRep;
            }

            match outcome {
                SlotOutcome::Error => {
                    // only undecodable backscatter counts as a collision
                    if matches!(
                        self.last_err,
                        Some(RadioError::Preamble) | Some(RadioError::Collision)
                    ) {
                        stats.collision_cnt += 1;
                        events |= SlotEvent::Collision;
                        if adaptive_q.enabled {
                            qfp = (qfp + c2[usize::from(stats.q)]).min(max_q);
                            tmp_q = if use_ceil_floor {
                                qfp / QFP_SCALE
                            } else {
                                (qfp + QFP_SCALE / 2) / QFP_SCALE
                            };
                        }
                    }
                }
                SlotOutcome::Empty => {
                    stats.empty_slot_cnt += 1;
                    events |= SlotEvent::EmptySlot;
                    if adaptive_q.enabled {
                        qfp = qfp.saturating_sub(c1[usize::from(stats.q)]).max(min_q);
                        tmp_q = if use_ceil_floor {
                            (qfp + QFP_SCALE - 1) / QFP_SCALE
                        } else {
                            (qfp + QFP_SCALE / 2) / QFP_SCALE
                        };
                    }
                }
                SlotOutcome::Tag => 'tag: {
                    if handler.uses_follow_command()
                        && handler.follow_tag_command(self, &tag).is_err()
                    {
                        // leave the tag out of the round
                        stats.skip_cnt += 1;
                        events |= SlotEvent::SkipFollowCmd;
                        break 'tag;
                    }

                    if stats.tag_cnt == 0 {
                        self.rssi_log_sum = 0;
                    }
                    self.rssi_log_sum += u32::from(tag.rssi_log_i) + u32::from(tag.rssi_log_q);
                    // the +tag_cnt bias makes the integer division round to
                    // nearest instead of down
                    stats.rssi_log_mean =
                        ((self.rssi_log_sum + stats.tag_cnt) / ((stats.tag_cnt + 1) * 2)) as u8;

                    tag.time_stamp = slot_time;
                    stats.tag_cnt += 1;
                    num_of_tags += 1;
                    events |= SlotEvent::TagFound;

                    ready_for_more = handler.tag_found(&tag);
                }
            }

            match self.last_err {
                Some(RadioError::Preamble) => {
                    stats.preamble_err_cnt += 1;
                    events |= SlotEvent::PreambleErr;
                }
                Some(RadioError::Crc) => {
                    stats.crc_err_cnt += 1;
                    events |= SlotEvent::CrcErr;
                }
                Some(RadioError::Header) => {
                    stats.header_err_cnt += 1;
                    events |= SlotEvent::HeaderErr;
                }
                Some(RadioError::RxCount) => {
                    stats.rx_count_err_cnt += 1;
                    events |= SlotEvent::RxCountErr;
                }
                _ => {}
            }

            handler.slot_finished(slot_time, events, stats.q);

            if adaptive_q.enabled {
                if tmp_q == u32::from(stats.q) {
                    slot_cmd = match outcome {
                        SlotOutcome::Error | SlotOutcome::Empty if use_query_adjust_nic => {
                            SlotCommand::QueryAdjustNic
                        }
                        _ => SlotCommand::QueryRep,
                    };
                } else if adj_cnt > 0 {
                    if tmp_q > u32::from(stats.q) {
                        stats.q += 1;
                        slot_cmd = SlotCommand::QueryAdjustUp;
                    } else {
                        stats.q -= 1;
                        slot_cmd = SlotCommand::QueryAdjustDown;
                    }
                    adj_cnt -= 1;
                    slot_count = 1 << stats.q;
                    tmp_q = u32::from(stats.q);
                    qfp = u32::from(stats.q) * QFP_SCALE;
                } else {
                    slot_cmd = SlotCommand::QueryRep;
                }
            } else {
                slot_cmd = SlotCommand::QueryRep;
            }

            go_on = handler.continue_scanning();

            if slot_count == 0 || !go_on || !ready_for_more {
                break;
            }
        }

        if adaptive_q.enabled {
            if reset_q_after_round {
                stats.q = initial_q;
                adaptive_q.qfp = u32::from(initial_q) * QFP_SCALE;
            } else {
                adaptive_q.qfp = qfp;
            }
        }

        self.short_preamble_workaround(false);

        if !manual_ack {
            let auto_ack = self.radio.register_read(reg::PROTOCOL_CTRL) & !0x30;
            self.radio.register_write(reg::PROTOCOL_CTRL, auto_ack);
        }

        // A tag read in the last slot still needs its session flag inverted:
        // the chained QueryRep must make it onto the air before the field
        // drops, or S2/S3 tags reply again next round. With a follow command
        // in play no QueryRep was chained, so send one explicitly.
        if handler.uses_follow_command() {
            self.radio.direct_command(cmd::QUERY_REP);
            self.radio.wait_for_response(RESP_TX_IRQ);
            self.radio.clear_response();
        } else {
            self.clock.delay_us(150);
        }

        debug!("inventory round done: {} tags", num_of_tags);
        num_of_tags
    }

    /// Execute one slot end to end. `fast` skips the handle exchange.
    #[allow(clippy::too_many_arguments)]
    fn slot(
        &mut self,
        tag: &mut Tag,
        manual_ack: bool,
        slot_cmd: SlotCommand,
        q: u8,
        fast: bool,
        follow_cmd: u8,
        truncating: bool,
        events: &mut FlagSet<SlotEvent>,
    ) -> SlotOutcome {
        self.last_err = None;

        // 1. open the slot; on an RN16 the chip continues with ACK (manual)
        //    or its auto-ACK machinery runs the whole exchange
        let mut rx_bits = if manual_ack {
            16u16
        } else {
            (BUF_LEN * 8) as u16 // length auto-detected by the chip
        };
        let res = if manual_ack {
            match slot_cmd {
                SlotCommand::Query => {
                    let query = self.query_image(q);
                    self.radio.tx_rx_gen2(
                        cmd::QUERY,
                        &query,
                        16,
                        &mut tag.rn16,
                        &mut rx_bits,
                        self.no_resp_time,
                        cmd::ACK,
                        true,
                    )
                }
                other => self.radio.tx_rx_gen2(
                    other.direct(),
                    &[],
                    0,
                    &mut tag.rn16,
                    &mut rx_bits,
                    self.no_resp_time,
                    cmd::ACK,
                    true,
                ),
            }
        } else {
            let next = if fast { follow_cmd } else { 0 };
            match slot_cmd {
                SlotCommand::Query => {
                    let query = self.query_image(q);
                    self.radio.tx_rx_gen2(
                        cmd::QUERY,
                        &query,
                        16,
                        &mut self.buf,
                        &mut rx_bits,
                        self.no_resp_time,
                        next,
                        false,
                    )
                }
                other => self.radio.tx_rx_gen2(
                    other.direct(),
                    &[],
                    0,
                    &mut self.buf,
                    &mut rx_bits,
                    self.no_resp_time,
                    next,
                    false,
                ),
            }
        };
        self.last_err = res.err();
        match res {
            Err(RadioError::NoResponse) => return SlotOutcome::Empty,
            Err(_) => return SlotOutcome::Error,
            Ok(()) => {}
        }

        let (rssi_lin_i, rssi_lin_q) = self.rssi_lin();
        tag.rssi_lin_i = rssi_lin_i;
        tag.rssi_lin_q = rssi_lin_q;

        if manual_ack {
            // 2. collect PC, XPC and EPC behind the ACK; the handle request
            //    goes out as soon as the FIFO fills
            rx_bits = (BUF_LEN * 8) as u16;
            let mut retries = Self::MAX_ACK_RETRY;
            let res = self.radio.rx_gen2_epc(
                &mut self.buf,
                &mut rx_bits,
                self.no_resp_time,
                if fast { follow_cmd } else { cmd::REQ_RN },
                false,
                &mut retries,
            );
            self.last_err = res.err();
            if retries != Self::MAX_ACK_RETRY {
                *events |= SlotEvent::ResendAck;
            }
            match res {
                Err(RadioError::NoResponse) => {
                    // the RN16 was fine but no EPC followed; count it as a
                    // collision
                    self.last_err = Some(RadioError::Collision);
                    return SlotOutcome::Error;
                }
                Err(RadioError::Crc) => return SlotOutcome::Error,
                _ => {}
            }
        }

        if truncating {
            if self.last_err.is_some() || rx_bits < 5 {
                return SlotOutcome::Error; // not even a truncated PC
            }

            tag.pc[0] = self.buf[0] & 0xF8;
            tag.pc[1] = 0x00;
            tag.xpc_len = 0;
            tag.epc_len = 0;

            // a truncated reply substitutes 00000 for the PC field
            if tag.pc[0] & 0xF8 != 0x00 {
                warn!("truncated reply with non-zero PC bits");
                self.last_err = Some(RadioError::Collision);
                return SlotOutcome::Error;
            }

            let mut effective_bits = rx_bits;
            if self.rx_without_crc {
                let mut crc_ok = false;
                if effective_bits >= 16 {
                    effective_bits -= 16; // CRC off the tail
                    let crc = crc16_bitwise(&self.buf, effective_bits);
                    let mut recv = [0u8; 2];
                    extract_bit_stream(&mut recv, &self.buf, 16, effective_bits);
                    crc_ok = crc == u16::from_be_bytes(recv);
                }
                if crc_ok {
                    // a clean CRC over a truncated reply only shows up on
                    // colliding backscatter; reject the slot
                    self.last_err = Some(RadioError::Crc);
                    return SlotOutcome::Error;
                }
            }

            if effective_bits < 5 {
                return SlotOutcome::Error;
            }
            effective_bits -= 5; // truncated PC off the front
            if effective_bits > (MAX_EPC_LENGTH * 8) as u16 {
                effective_bits = (MAX_EPC_LENGTH * 8) as u16;
            }
            extract_bit_stream(&mut tag.epc, &self.buf, effective_bits, 5);
            tag.epc_len = ((effective_bits + 7) / 8) as u8;
        } else {
            if self.last_err.is_some() || rx_bits < 16 {
                return SlotOutcome::Error; // not even a PC
            }

            tag.pc[0] = self.buf[0];
            tag.pc[1] = self.buf[1];

            tag.xpc_len = 0;
            if tag.pc[0] & stored_pc::XI != 0 {
                // tag has at least XPC_W1 ...
                tag.xpc[0] = self.buf[2];
                tag.xpc[1] = self.buf[3];
                tag.xpc_len += 2;

                if tag.xpc[0] & XPC_W1_XEB != 0 {
                    // ... and XPC_W2 follows
                    tag.xpc[2] = self.buf[4];
                    tag.xpc[3] = self.buf[5];
                    tag.xpc_len += 2;
                }
            }

            let mut total_len = (rx_bits + 7) / 8;
            if self.rx_without_crc {
                total_len -= 2;
                let crc = crc16_bytewise(&self.buf[..usize::from(total_len)]);
                let received = (u16::from(self.buf[usize::from(total_len)]) << 8)
                    | u16::from(self.buf[usize::from(total_len) + 1]);
                if crc != received {
                    self.last_err = Some(RadioError::Crc);
                    return SlotOutcome::Error;
                }
            }

            if total_len < 2 + u16::from(tag.xpc_len) {
                return SlotOutcome::Error; // short reply
            }

            let mut epc_len = total_len - 2 - u16::from(tag.xpc_len);
            if epc_len > MAX_EPC_LENGTH as u16 {
                epc_len = MAX_EPC_LENGTH as u16;
            }
            tag.epc_len = epc_len as u8;
            let start = 2 + usize::from(tag.xpc_len);
            tag.epc[..usize::from(epc_len)]
                .copy_from_slice(&self.buf[start..start + usize::from(epc_len)]);
        }

        // 3. fetch the handle unless fast mode keeps the slot short
        if !fast {
            let mut bits = 32u16;
            let res = self.radio.tx_rx_gen2(
                0,
                &[],
                0,
                &mut tag.handle,
                &mut bits,
                self.no_resp_time,
                follow_cmd,
                false,
            );
            self.last_err = res.err();
        }

        let (agc, rssi_log_i, rssi_log_q) = self.agc_rssi_log();
        tag.agc = agc;
        tag.rssi_log_i = rssi_log_i;
        tag.rssi_log_q = rssi_log_q;

        if self.last_err.is_some() {
            return SlotOutcome::Error;
        }

        // A packet PC adjusts its L field to the data following the PC word;
        // a mismatch after a clean handle exchange means two tags talked
        // over each other.
        if !truncating
            && u16::from((tag.pc[0] & stored_pc::L) >> 2)
                != u16::from(tag.epc_len) + u16::from(tag.xpc_len)
        {
            warn!("PC length field disagrees with received EPC");
            self.last_err = Some(RadioError::Collision);
            return SlotOutcome::Error;
        }

        SlotOutcome::Tag
    }

    // ========================================================================
    // Tag access
    // ========================================================================

    /// Run the Access sequence with a 32-bit password against a singulated
    /// tag. Each 16-bit half goes out cover-coded with a fresh RN16 and must
    /// come back as an echoed handle. An all-zero password is a no-op.
    pub fn access_tag(&mut self, tag: &Tag, password: &[u8; 4]) -> Result<(), Gen2Error> {
        if password == &[0, 0, 0, 0] {
            // open tag, nothing to prove
            return Ok(());
        }

        let mut rn16 = [0u8; 2];
        for half in password.chunks_exact(2) {
            self.req_rn(&tag.handle, &mut rn16)?;

            self.buf[0] = Self::EPC_ACCESS;
            self.buf[1] = half[0] ^ rn16[0];
            self.buf[2] = half[1] ^ rn16[1];
            self.buf[3] = tag.handle[0];
            self.buf[4] = tag.handle[1];

            let mut response = [0u8; 5];
            let mut rx_bits = 32u16;
            let res = self.radio.tx_rx_gen2(
                cmd::TRANSM_CRC,
                &self.buf,
                40,
                &mut response,
                &mut rx_bits,
                self.no_resp_time,
                0,
                true,
            );
            self.last_err = res.err();
            if let Err(e) = res {
                return if e == RadioError::ChipHeader && rx_bits != 0 {
                    Err(Gen2Error::Tag(TagError::from_code(response[0])))
                } else {
                    Err(Gen2Error::Access)
                };
            }

            if response[..2] != tag.handle[..] {
                return Err(Gen2Error::Access);
            }
        }
        Ok(())
    }

    /// Read `word_count` 16-bit words from a bank. A `word_count` of zero
    /// requests the rest of the bank; the tag then answers with a length the
    /// chip cannot predict, so the reply is rescanned for the handle
    /// boundary and validated with a CRC over the header bit, data and
    /// handle. On return `word_count` holds the number of words placed in
    /// `dest`.
    ///
    /// `dest` receives whatever data arrived even when an error is returned.
    pub fn read_from_tag(
        &mut self,
        tag: &Tag,
        mem_bank: MemoryBank,
        word_ptr: u32,
        word_count: &mut u8,
        dest: &mut [u8],
    ) -> Result<(), Gen2Error> {
        if usize::from(*word_count) > MAX_READ_DATA_LEN / 2 {
            return Err(Gen2Error::Param);
        }

        let mut read_buf = [0u8; MAX_READ_DATA_LEN + 5]; // handle + CRC + header bit
        let mut bit_count: u16 = if *word_count != 0 {
            u16::from(*word_count) * 16
        } else {
            (MAX_READ_DATA_LEN * 8) as u16
        };
        bit_count += 2 * 16 + 1; // handle + CRC + header bit

        self.buf[0] = Self::EPC_READ;
        self.buf[1] = ((mem_bank as u8) << 6) & 0xC0;
        let ebv_len = insert_ebv(word_ptr, &mut self.buf[1..], 6);
        self.buf[1 + ebv_len] |= (*word_count >> 2) & 0x3F;
        self.buf[2 + ebv_len] = (*word_count << 6) & 0xC0;
        insert_bit_stream(&mut self.buf[2 + ebv_len..], &tag.handle, 6);

        let res = self.radio.tx_rx_gen2(
            cmd::TRANSM_CRC_EHEAD,
            &self.buf,
            34 + 8 * ebv_len as u16,
            &mut read_buf,
            &mut bit_count,
            self.no_resp_time,
            0,
            true,
        );
        self.last_err = res.err();

        let mut outcome = match res {
            Err(RadioError::ChipHeader) => Err(Gen2Error::Tag(TagError::from_code(read_buf[0]))),
            Err(e) => Err(Gen2Error::Link(e)),
            Ok(()) => Ok(()),
        };

        if *word_count == 0 && res == Err(RadioError::RxCount) {
            // whole-bank read: scan for the handle boundary
            let mut crc_buf = [0u8; MAX_READ_DATA_LEN + 5];
            while usize::from(*word_count) < MAX_READ_DATA_LEN / 2 {
                let at = usize::from(*word_count) * 2;
                if read_buf[at..at + 2] == tag.handle {
                    crc_buf[0] = 0x00;
                    insert_bit_stream(&mut crc_buf, &read_buf[..at + 2], 7);
                    let calculated = crc16_bitwise(&crc_buf, (at as u16) * 8 + 16 + 1);
                    let received = (u16::from(read_buf[at + 2]) << 8) | u16::from(read_buf[at + 3]);
                    if received == calculated {
                        outcome = Ok(());
                        break;
                    }
                }
                *word_count += 1;
            }
        }

        if *word_count != 0 {
            // hand back whatever came in, error or not
            let n = usize::from(*word_count) * 2;
            dest[..n].copy_from_slice(&read_buf[..n]);
        }
        outcome
    }

    /// Write one 16-bit word, cover-coded with a fresh RN16. The tag may
    /// answer up to 20 ms later; the reply window is stretched for the
    /// duration of the exchange.
    pub fn write_word_to_tag(
        &mut self,
        tag: &Tag,
        mem_bank: MemoryBank,
        word_ptr: u32,
        data: &[u8; 2],
    ) -> Result<(), Gen2Error> {
        let mut rn16 = [0u8; 2];
        self.req_rn(&tag.handle, &mut rn16)?;

        self.buf[0] = Self::EPC_WRITE;
        self.buf[1] = ((mem_bank as u8) << 6) & 0xC0;
        let ebv_len = insert_ebv(word_ptr, &mut self.buf[1..], 6);

        let covered = data[0] ^ rn16[0];
        self.buf[1 + ebv_len] |= (covered >> 2) & 0x3F;
        self.buf[2 + ebv_len] = (covered << 6) & 0xC0;
        let covered = data[1] ^ rn16[1];
        self.buf[2 + ebv_len] |= (covered >> 2) & 0x3F;
        self.buf[3 + ebv_len] = (covered << 6) & 0xC0;

        insert_bit_stream(&mut self.buf[3 + ebv_len..], &tag.handle, 6);

        let mut reply = [0u8; 5];
        let mut rx_bits = 32 + 1;
        let res = self.delayed_reply_transceive(
            cmd::TRANSM_CRC_EHEAD,
            42 + 8 * ebv_len as u16,
            &mut reply,
            &mut rx_bits,
            0xFF,
        );
        finish_delayed_reply(res, &reply, rx_bits)
    }

    /// Write `n_words` 16-bit words in one BlockWrite. The data goes out in
    /// clear; BlockWrite has no cover-coding round.
    pub fn write_block_to_tag(
        &mut self,
        tag: &Tag,
        mem_bank: MemoryBank,
        word_ptr: u32,
        data: &[u8],
        n_words: u8,
    ) -> Result<(), Gen2Error> {
        let byte_len = usize::from(n_words) * 2;
        if byte_len > MAX_READ_DATA_LEN || data.len() < byte_len {
            return Err(Gen2Error::Param);
        }

        self.buf[0] = Self::EPC_BLOCKWRITE;
        self.buf[1] = ((mem_bank as u8) << 6) & 0xC0;
        let ebv_len = insert_ebv(word_ptr, &mut self.buf[1..], 6);
        insert_bit_stream(&mut self.buf[1 + ebv_len..], &[n_words], 6);
        insert_bit_stream(&mut self.buf[2 + ebv_len..], &data[..byte_len], 6);
        insert_bit_stream(&mut self.buf[2 + ebv_len + byte_len..], &tag.handle, 6);

        let tx_bits = 2 + 8 * (4 + ebv_len as u16 + u16::from(n_words) * 2);
        let mut reply = [0u8; 5];
        let mut rx_bits = 32 + 1;
        let res = self.delayed_reply_transceive(
            cmd::TRANSM_CRC_EHEAD,
            tx_bits,
            &mut reply,
            &mut rx_bits,
            0xFF,
        );
        finish_delayed_reply(res, &reply, rx_bits)
    }

    /// Apply a lock payload to a singulated tag. Delayed reply as with
    /// [`write_word_to_tag`](Self::write_word_to_tag).
    pub fn lock_tag(&mut self, tag: &Tag, payload: &LockPayload) -> Result<(), Gen2Error> {
        let bits = payload.to_bits();
        self.lock_tag_raw(
            tag,
            &[
                (bits >> 12) as u8,
                (bits >> 4) as u8,
                ((bits << 4) & 0xF0) as u8,
            ],
        )
    }

    /// Apply a raw 20-bit mask/action payload, left-aligned in three bytes.
    pub fn lock_tag_raw(&mut self, tag: &Tag, mask_action: &[u8; 3]) -> Result<(), Gen2Error> {
        self.buf[0] = Self::EPC_LOCK;
        self.buf[1] = mask_action[0];
        self.buf[2] = mask_action[1];
        self.buf[3] = mask_action[2] & 0xF0;
        insert_bit_stream(&mut self.buf[3..], &tag.handle, 4);

        let mut reply = [0u8; 5];
        let mut rx_bits = 32 + 1;
        let res = self.delayed_reply_transceive(
            cmd::TRANSM_CRC_EHEAD,
            44,
            &mut reply,
            &mut rx_bits,
            0xFF,
        );
        finish_delayed_reply(res, &reply, rx_bits)
    }

    /// Kill a tag with its 32-bit kill password: two cover-coded passes, the
    /// first carrying `rfu`, the second the recommissioning bits and the
    /// error header expectation.
    pub fn kill_tag(
        &mut self,
        tag: &Tag,
        password: &[u8; 4],
        rfu: u8,
        recom: u8,
    ) -> Result<(), Gen2Error> {
        let mut rn16 = [0u8; 2];
        let mut reply = [0u8; 5];
        let mut res: Result<(), RadioError> = Ok(());
        let mut rx_bits = 32u16;

        for (pass, half) in password.chunks_exact(2).enumerate() {
            self.req_rn(&tag.handle, &mut rn16)?;

            let (cmd_byte, no_resp, field) = if pass == 1 {
                // second half: expect the header bit, wait up to the
                // maximum, carry the recommissioning bits
                rx_bits = 32 + 1;
                (cmd::TRANSM_CRC_EHEAD, 0xFF, recom)
            } else {
                rx_bits = 32;
                (cmd::TRANSM_CRC, self.no_resp_time, rfu)
            };

            self.buf[0] = Self::EPC_KILL;
            self.buf[1] = half[0] ^ rn16[0];
            self.buf[2] = half[1] ^ rn16[1];
            self.buf[3] = (field << 5) & 0xE0;
            insert_bit_stream(&mut self.buf[3..], &tag.handle, 5);

            res = self.delayed_reply_transceive(cmd_byte, 43, &mut reply, &mut rx_bits, no_resp);
            if res.is_err() {
                break;
            }
        }
        finish_delayed_reply(res, &reply, rx_bits)
    }

    /// Resume a pending delayed reply: re-enable the receiver and collect
    /// the header bit plus handle of a Write/BlockWrite/Lock/Kill still in
    /// flight.
    pub fn continue_command(&mut self) -> Result<(), Gen2Error> {
        let mut reply = [0u8; 5];
        let mut rx_bits = 32 + 1;
        let res = self.radio.tx_rx_gen2(
            cmd::ENABLE_RX,
            &[],
            0,
            &mut reply,
            &mut rx_bits,
            0xFF,
            0,
            false,
        );
        self.last_err = res.err();
        finish_delayed_reply(res, &reply, rx_bits)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Request a fresh RN16 (or handle) for `handle`.
    fn req_rn(&mut self, handle: &[u8; 2], dest: &mut [u8; 2]) -> Result<(), Gen2Error> {
        self.buf[0] = Self::EPC_REQRN;
        self.buf[1] = handle[0];
        self.buf[2] = handle[1];

        let mut rx_bits = 32u16;
        let res = self.radio.tx_rx_gen2(
            cmd::TRANSM_CRC,
            &self.buf,
            24,
            dest,
            &mut rx_bits,
            self.no_resp_time,
            0,
            true,
        );
        self.last_err = res.err();
        res.map_err(|_| Gen2Error::ReqRn)
    }

    /// The 16 Query payload bits (DR, M, TRext, Sel, Session, Target, Q);
    /// the chip adds the command prefix and CRC-5.
    fn query_image(&self, q: u8) -> [u8; 2] {
        [
            ((self.dr.bit() << 5) & 0x20)
                | (((self.config.coding as u8) << 3) & 0x18)
                | ((u8::from(self.config.trext) << 2) & 0x04)
                | (self.config.sel as u8 & 0x03),
            (((self.config.session as u8) << 6) & 0xC0)
                | (((self.config.target as u8) << 5) & 0x20)
                | ((q << 1) & 0x1E),
        ]
    }

    /// Transceive from the scratch buffer with the no-response wait
    /// stretched to the delayed-reply window; the previous wait is restored
    /// on every path.
    fn delayed_reply_transceive(
        &mut self,
        cmd_byte: u8,
        tx_bits: u16,
        reply: &mut [u8],
        rx_bits: &mut u16,
        no_resp_time: u8,
    ) -> Result<(), RadioError> {
        let saved = self.radio.register_read(reg::RX_NO_RESPONSE_WAIT);
        let res = self.radio.tx_rx_gen2(
            cmd_byte,
            &self.buf,
            tx_bits,
            reply,
            rx_bits,
            no_resp_time,
            0,
            true,
        );
        self.radio.register_write(reg::RX_NO_RESPONSE_WAIT, saved);
        self.last_err = res.err();
        res
    }

    fn agc_rssi_log(&mut self) -> (u8, u8, u8) {
        let mut buf = [0u8; 2];
        self.radio.register_read_many(reg::AGC_AND_STATUS, &mut buf);
        (buf[0], buf[1] & 0x0F, buf[1] >> 4)
    }

    fn rssi_lin(&mut self) -> (i8, i8) {
        let meas = self.radio.register_read(reg::MEASUREMENT_CONTROL);
        self.radio
            .register_write(reg::MEASUREMENT_CONTROL, (meas & 0xF0) | 0x0B); // msel: RSSI I level
        let i = self.radio.adc_read();
        self.radio
            .register_write(reg::MEASUREMENT_CONTROL, (meas & 0xF0) | 0x0C); // msel: RSSI Q level
        let q = self.radio.adc_read();
        self.radio.register_write(reg::MEASUREMENT_CONTROL, meas);
        (i, q)
    }

    /// Miller-4 with a short preamble needs the receiver coupling trimmed
    /// for the duration of an inventory (transceiver erratum).
    fn short_preamble_workaround(&mut self, apply: bool) {
        if self.config.coding == Coding::Miller4 && !self.config.trext {
            self.radio
                .register_write(reg::ICD, if apply { 0xF0 } else { 0x00 });
        }
    }

    /// Honor T4, the minimum spacing after Select and QueryAdjust.
    fn t4_wait(&mut self) {
        self.clock.delay_us(timing::t4_delay_us(&self.config));
    }
}

/// Insert `value` EBV-encoded at `bitpos` of `dest`; returns the EBV length
/// in bytes.
fn insert_ebv(value: u32, dest: &mut [u8], bitpos: u8) -> usize {
    let mut ebv = [0u8; 5];
    let len = u32_to_ebv(value, &mut ebv);
    insert_bit_stream(dest, &ebv[..len], bitpos);
    len
}

/// Map a delayed-reply result: a set error header carries the tag's Annex-I
/// code in the first reply byte.
fn finish_delayed_reply(
    res: Result<(), RadioError>,
    reply: &[u8],
    rx_bits: u16,
) -> Result<(), Gen2Error> {
    match res {
        Err(RadioError::ChipHeader) if rx_bits != 0 => {
            Err(Gen2Error::Tag(TagError::from_code(reply[0])))
        }
        Err(e) => Err(Gen2Error::Link(e)),
        Ok(()) => Ok(()),
    }
}
