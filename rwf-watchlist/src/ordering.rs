//! Порядок сообщений multicast-потока.
//!
//! Провайдер нумерует одним счётчиком и ответы по stream id потока (unicast),
//! и сообщения для всех подписчиков (broadcast, stream id 0), но приходят
//! они разными путями. Пока поток ждёт refresh, сообщения придерживаются в
//! очереди потока, чтобы приложение увидело их в порядке номеров.
//!
//! Broadcast status и refresh во время ожидания refresh служат точкой
//! синхронизации: unicast-сообщение старше неё закрывает поток.

use log::{debug, warn};
use rwf_core::seq::{next_seq_num, prev_seq_num, seq_compare};
use rwf_core::{DataState, Msg, SeqNum, StatusCode, StreamId, StreamState};

use crate::error::WatchlistError;
use crate::event::{InboundMsg, WatchlistEvent};
use crate::item::GapFlag;
use crate::reorder::BufferedMsg;
use crate::watchlist::{CloseAction, Watchlist, status_msg};

impl Watchlist {
    pub(crate) fn order_msg(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        seq_num: SeqNum,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        if inbound.msg.is_broadcast() {
            self.order_broadcast(stream_id, inbound, seq_num, now, out)
        } else {
            self.order_unicast(stream_id, inbound, seq_num, now, out)
        }
    }

    fn order_unicast(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        seq_num: SeqNum,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let gap_recovery = self.config.gap_recovery;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if !stream.refresh_state.is_pending() {
            return self.fanout(stream_id, inbound, now, out);
        }

        if let Some(synch) = stream.order.bc_synch_seq_num {
            if seq_compare(seq_num, synch) < 0 {
                warn!(
                    "unicast seq {seq_num} on stream {stream_id} is older than broadcast seq {synch}"
                );
                let status = status_msg(
                    stream_id,
                    stream.domain_type(),
                    StreamState::ClosedRecover,
                    DataState::Suspect,
                    StatusCode::None,
                    "Multicast message was forwarded out of order.",
                );
                self.close_and_recover(stream_id, status, CloseAction::OnDispatch, out);
                return Ok(());
            }
            stream.order.bc_synch_seq_num = None;
        }

        if !stream.order.has_uc_seq_num {
            // Первый unicast: broadcast до него уже не нужен
            stream.queue.discard_until(seq_num);
            stream.order.has_uc_seq_num = true;
            stream.order.seq_num = seq_num;

            let mut has_gap = false;
            if gap_recovery {
                let check = stream.queue.check_broadcast_sequence(seq_num);
                if check.retained > 0 {
                    stream.order.has_bc_seq_num = true;
                    stream.order.seq_num = check.seq_num;
                    has_gap = check.has_gap;
                }
            } else if let Some(last) = stream.queue.last_broadcast_seq_num() {
                stream.order.has_bc_seq_num = true;
                stream.order.seq_num = last;
            }

            if has_gap {
                self.set_gap_flag(stream_id, GapFlag::BcSeqGap, now);
            }
            self.fanout(stream_id, inbound, now, out)?;
        } else {
            // broadcast уже отстаёт: в очередь за остальными
            if stream.queue.has_unicast_msgs() {
                return stream
                    .queue
                    .push(&inbound.msg, seq_num, inbound.ft_group_id);
            }

            self.forward_until(stream_id, seq_num, now, out)?;

            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            if stream.queue.has_broadcast_msgs() {
                // В буфере остались broadcast новее этого сообщения: оно идёт
                // сразу, устаревшие broadcast за первым выбрасываются.
                stream.queue.discard_not_newer_than(seq_num);
                self.fanout(stream_id, inbound, now, out)?;
            } else if seq_compare(seq_num, stream.order.seq_num) > 0 {
                stream
                    .queue
                    .push(&inbound.msg, seq_num, inbound.ft_group_id)?;
                self.set_gap_flag(stream_id, GapFlag::BcBehindUc, now);
                return Ok(());
            } else {
                self.fanout(stream_id, inbound, now, out)?;
            }
        }

        if self
            .streams
            .get(&stream_id)
            .is_some_and(|s| !s.refresh_state.is_pending())
        {
            self.forward_all_queued(stream_id, now, out)?;
        }
        Ok(())
    }

    fn order_broadcast(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        seq_num: SeqNum,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let gap_recovery = self.config.gap_recovery;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let pending = stream.refresh_state.is_pending();

        // Провайдер сбросил нумерацию
        if seq_num == 0 {
            if pending {
                let status = status_msg(
                    stream_id,
                    stream.domain_type(),
                    StreamState::ClosedRecover,
                    DataState::Suspect,
                    StatusCode::None,
                    "Stream sequence was reset while waiting for refresh.",
                );
                self.close_and_recover(stream_id, status, CloseAction::OnDispatch, out);
                return Ok(());
            }
            stream.order.has_bc_seq_num = true;
            stream.order.seq_num = 0;
            return self.fanout(stream_id, inbound, now, out);
        }

        if pending && matches!(inbound.msg, Msg::Status(_) | Msg::Refresh(_)) {
            return self.order_broadcast_synch(stream_id, inbound, seq_num, now, out);
        }

        if !stream.order.has_uc_seq_num {
            // ещё неизвестно, с какого номера начинать
            return stream
                .queue
                .push(&inbound.msg, seq_num, inbound.ft_group_id);
        }

        if !self.cross_unicast_start(stream_id, seq_num, now) {
            return Ok(());
        }
        if !self.accept_broadcast_seq(stream_id, seq_num, gap_recovery, now) {
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.refresh_state.is_pending() {
            return self.fanout(stream_id, inbound, now, out);
        }

        if !stream.queue.has_unicast_msgs() {
            // порядок пока неизвестен
            return stream
                .queue
                .push(&inbound.msg, seq_num, inbound.ft_group_id);
        }

        self.forward_until(stream_id, prev_seq_num(seq_num), now, out)?;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if stream.queue.has_unicast_msgs() {
            self.fanout(stream_id, inbound, now, out)?;
            if !self.streams.contains_key(&stream_id) {
                return Ok(());
            }
            self.forward_until(stream_id, seq_num, now, out)?;
        } else {
            stream
                .queue
                .push(&inbound.msg, seq_num, inbound.ft_group_id)?;
        }

        self.check_caught_up(stream_id);
        Ok(())
    }

    fn order_broadcast_synch(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        seq_num: SeqNum,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let gap_recovery = self.config.gap_recovery;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        if !stream.order.has_uc_seq_num {
            // Unicast ещё не было: синхронизируемся по этому сообщению
            stream.queue.discard_all();
            stream.order.bc_synch_seq_num = Some(seq_num);
            return self.fanout(stream_id, inbound, now, out);
        }

        if !self.cross_unicast_start(stream_id, seq_num, now) {
            return Ok(());
        }
        if !self.accept_broadcast_seq(stream_id, seq_num, gap_recovery, now) {
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        stream.order.bc_synch_seq_num = Some(seq_num);

        if !stream.queue.has_unicast_msgs() {
            self.forward_until(stream_id, seq_num, now, out)?;
            if !self.streams.contains_key(&stream_id) {
                return Ok(());
            }
            return self.fanout(stream_id, inbound, now, out);
        }

        self.forward_until(stream_id, prev_seq_num(seq_num), now, out)?;
        if !self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        self.fanout(stream_id, inbound, now, out)?;
        if !self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        self.forward_until(stream_id, seq_num, now, out)?;
        self.check_caught_up(stream_id);
        Ok(())
    }

    /// Первый broadcast после старта по unicast. `false` — сообщение не новее
    /// unicast и выбрасывается.
    fn cross_unicast_start(&mut self, stream_id: StreamId, seq_num: SeqNum, now: u64) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if stream.order.has_bc_seq_num {
            return true;
        }

        let cmp = seq_compare(seq_num, stream.order.seq_num);
        if cmp <= 0 {
            // Отставание broadcast может означать смену сервера и
            // пропущенный сброс нумерации.
            if cmp < 0 {
                self.set_gap_flag(stream_id, GapFlag::BcBehindUc, now);
            } else {
                self.unset_gap_flag(stream_id, GapFlag::BcBehindUc);
            }
            return false;
        }

        let caught_up = !stream.queue.has_unicast_msgs();
        stream.order.has_bc_seq_num = true;
        if caught_up {
            self.unset_gap_flag(stream_id, GapFlag::BcBehindUc);
        }
        true
    }

    /// Проверка непрерывности broadcast. `false` — пропуск, сообщение
    /// выбрасывается до истечения gap-таймера.
    fn accept_broadcast_seq(
        &mut self,
        stream_id: StreamId,
        seq_num: SeqNum,
        gap_recovery: bool,
        now: u64,
    ) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };

        if gap_recovery && seq_num != next_seq_num(stream.order.seq_num) {
            debug!(
                "broadcast gap on stream {stream_id}: expected {}, got {seq_num}",
                next_seq_num(stream.order.seq_num)
            );
            self.set_gap_flag(stream_id, GapFlag::BcSeqGap, now);
            return false;
        }

        stream.order.seq_num = seq_num;
        self.unset_gap_flag(stream_id, GapFlag::BcSeqGap);
        true
    }

    fn check_caught_up(&mut self, stream_id: StreamId) {
        let caught_up = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| !s.queue.has_unicast_msgs());
        if caught_up {
            self.unset_gap_flag(stream_id, GapFlag::BcBehindUc);
        }
    }

    /// Выпускает буфер до `seq_num` включительно. Останавливается, если
    /// поток закрылся по ходу.
    fn forward_until(
        &mut self,
        stream_id: StreamId,
        seq_num: SeqNum,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            let Some(buffered) = stream.queue.pop_until(seq_num) else {
                return Ok(());
            };
            self.fanout(stream_id, replay(&buffered)?, now, out)?;
        }
    }

    fn forward_all_queued(
        &mut self,
        stream_id: StreamId,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };
            let Some(buffered) = stream.queue.pop() else {
                return Ok(());
            };
            self.fanout(stream_id, replay(&buffered)?, now, out)?;
        }
    }

    // --- gap-таймер ---

    pub(crate) fn set_gap_flag(&mut self, stream_id: StreamId, flag: GapFlag, now: u64) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if *stream.order.flag_mut(flag) {
            return;
        }

        let first = !stream.order.has_gap_flags();
        *stream.order.flag_mut(flag) = true;

        if first {
            debug!("stream {stream_id} waits for missing messages ({flag:?})");
            self.gap_expire_time = Some(now + self.config.gap_timeout_ms);
            self.gap_streams.push_back(stream_id);
            self.need_timer = true;
        }
    }

    pub(crate) fn unset_gap_flag(&mut self, stream_id: StreamId, flag: GapFlag) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !*stream.order.flag_mut(flag) {
            return;
        }

        *stream.order.flag_mut(flag) = false;
        if !stream.order.has_gap_flags() {
            self.remove_gap_stream(stream_id);
        }
    }

    pub(crate) fn remove_gap_stream(&mut self, stream_id: StreamId) {
        self.gap_streams.retain(|id| *id != stream_id);
        if self.gap_streams.is_empty() {
            self.gap_expire_time = None;
        }
    }

    /// Пропуски не заполнились. С gap recovery потоки переоткрываются,
    /// без него буфер выпускается как есть.
    pub(crate) fn gap_timer_expired(
        &mut self,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        self.gap_expire_time = None;
        let stream_ids: Vec<StreamId> = self.gap_streams.drain(..).collect();

        for stream_id in stream_ids {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            stream.order.clear_gap_flags();

            if self.config.gap_recovery {
                warn!("gap on stream {stream_id} was not filled, recovering");
                let status = status_msg(
                    stream_id,
                    stream.domain_type(),
                    StreamState::ClosedRecover,
                    DataState::Suspect,
                    StatusCode::GapDetected,
                    "Gap in sequence number.",
                );
                self.close_and_recover(stream_id, status, CloseAction::OnDispatch, out);
                continue;
            }

            warn!(
                "gap on stream {stream_id} was not filled, releasing {} buffered messages",
                stream.queue.len()
            );
            loop {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    break;
                };
                let Some(buffered) = stream.queue.pop() else {
                    break;
                };
                // Без broadcast-номера берём номер выпущенного сообщения,
                // чтобы следующие с тем же номером прошли.
                if !stream.order.has_bc_seq_num {
                    stream.order.has_uc_seq_num = true;
                    stream.order.seq_num = buffered.seq_num;
                }
                self.fanout(stream_id, replay(&buffered)?, now, out)?;
            }
        }
        Ok(())
    }
}

fn replay(buffered: &BufferedMsg) -> Result<InboundMsg, WatchlistError> {
    Ok(InboundMsg {
        msg: buffered.msg()?,
        seq_num: Some(buffered.seq_num),
        ft_group_id: buffered.ft_group_id,
    })
}
