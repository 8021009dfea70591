//! Раздача сообщений item-потока запросам приложения.

use log::{debug, info};
use rwf_core::seq::next_seq_num;
use rwf_core::{DataState, Msg, RefreshMsg, SeqNum, StreamId, StreamState};

use crate::error::WatchlistError;
use crate::event::{InboundMsg, WatchlistEvent};
use crate::item::{GapFlag, RefreshState, RequestPhase};
use crate::pool::Handle;
use crate::watchlist::{CloseAction, Watchlist, override_state};

impl Watchlist {
    /// Сообщение, адресованное item-потоку (по stream id или по атрибутам).
    pub(crate) fn process_item_msg(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let Some(seq_num) = inbound.seq_num else {
            return self.fanout(stream_id, inbound, now, out);
        };
        if !stream.private {
            return self.order_msg(stream_id, inbound, seq_num, now, out);
        }

        // Приватный поток: только непрерывность номеров
        if self.config.gap_recovery
            && seq_num != 0
            && stream.order.has_bc_seq_num
            && seq_num != next_seq_num(stream.order.seq_num)
        {
            self.set_gap_flag(stream_id, GapFlag::BcSeqGap, now);
            return Ok(());
        }
        stream.order.has_bc_seq_num = true;
        stream.order.seq_num = seq_num;
        self.unset_gap_flag(stream_id, GapFlag::BcSeqGap);
        self.fanout(stream_id, inbound, now, out)
    }

    pub(crate) fn fanout(
        &mut self,
        stream_id: StreamId,
        inbound: InboundMsg,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let InboundMsg {
            msg,
            seq_num,
            ft_group_id,
        } = inbound;

        if let Some(group_id) = ft_group_id {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                if stream.ft_group.is_none() {
                    stream.ft_group = Some(group_id);
                    self.ft_groups.add_stream(group_id, stream_id, now);
                    self.need_timer = true;
                }
            }
        }

        let msg = match msg {
            Msg::Refresh(refresh) => {
                self.fanout_refresh(stream_id, refresh, seq_num, ft_group_id, now, out);
                return Ok(());
            }
            other => other,
        };

        let Some(stream) = self.streams.get(&stream_id) else {
            return Ok(());
        };

        let targets: Vec<Handle> = match &msg {
            Msg::Update(_) => {
                let mut targets = stream.open.clone();
                if stream.refresh_state == RefreshState::PendingRefreshComplete {
                    targets.extend(stream.pending_refresh.iter().copied());
                }
                targets
            }
            Msg::Status(_) | Msg::Generic(_) => stream.requests().collect(),
            _ => {
                debug!("{msg} is not expected on item stream {stream_id}");
                return Ok(());
            }
        };

        if let Some(state) = msg.state() {
            if !state.is_open() {
                self.close_and_recover(stream_id, msg, CloseAction::Release, out);
                return Ok(());
            }
            if !self.config.allow_suspect_data && state.data_state == DataState::Suspect {
                let mut msg = msg;
                override_state(&mut msg, StreamState::ClosedRecover, DataState::Suspect);
                self.close_and_recover(stream_id, msg, CloseAction::OnDispatch, out);
                return Ok(());
            }
        }

        for handle in targets {
            self.deliver_to_request(handle, &msg, seq_num, ft_group_id, out);
        }
        Ok(())
    }

    fn fanout_refresh(
        &mut self,
        stream_id: StreamId,
        mut refresh: RefreshMsg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let gap_recovery = self.config.gap_recovery;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        // Some(true) — пропущена часть, Some(false) — части идут по порядку
        let mut part_gap = None;
        let mut response = None;

        if refresh.solicited && stream.refresh_state.is_pending() {
            if let (Some(part_num), true) = (refresh.part_num, gap_recovery) {
                if part_num == 0 {
                    stream.order.next_part_num = 1;
                    part_gap = Some(false);
                } else if part_num != stream.order.next_part_num {
                    part_gap = Some(true);
                } else {
                    stream.order.next_part_num = stream.order.next_part_num.wrapping_add(1);
                    part_gap = Some(false);
                }
            }

            if part_gap != Some(true) {
                if refresh.complete {
                    stream.refresh_state = RefreshState::None;
                    response = Some(true);
                } else {
                    stream.refresh_state = RefreshState::PendingRefreshComplete;
                    response = Some(false);
                }
            }
        }

        match part_gap {
            Some(true) => {
                debug!(
                    "refresh part {:?} on stream {stream_id} is out of order, dropped",
                    refresh.part_num
                );
                self.set_gap_flag(stream_id, GapFlag::PartGap, now);
                return;
            }
            Some(false) => self.unset_gap_flag(stream_id, GapFlag::PartGap),
            None => {}
        }

        match response {
            Some(true) => {
                self.registry.unset_pending_response(stream_id);
            }
            Some(false) => {
                self.registry.reset_pending_response(stream_id, now);
                self.need_timer = true;
            }
            None => {}
        }

        if !self.config.allow_suspect_data
            && refresh.state.is_open()
            && refresh.state.data_state == DataState::Suspect
        {
            refresh.state.stream_state = StreamState::ClosedRecover;
            self.close_and_recover(stream_id, refresh.into(), CloseAction::OnDispatch, out);
            return;
        }

        match refresh.state.stream_state {
            StreamState::Open => {
                self.fanout_open_refresh(stream_id, refresh, seq_num, ft_group_id, out)
            }
            StreamState::NonStreaming => {
                self.fanout_non_streaming_refresh(stream_id, refresh, seq_num, ft_group_id, out)
            }
            _ => self.close_and_recover(stream_id, refresh.into(), CloseAction::Release, out),
        }
    }

    fn fanout_open_refresh(
        &mut self,
        stream_id: StreamId,
        refresh: RefreshMsg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };

        let solicited = refresh.solicited;
        let complete = refresh.complete;
        let to_pending =
            solicited || stream.refresh_state == RefreshState::PendingRefreshComplete;
        let open = if solicited {
            Vec::new()
        } else {
            stream.open.clone()
        };
        let pending = if to_pending {
            stream.pending_refresh.clone()
        } else {
            Vec::new()
        };

        let mut snapshot = refresh.clone();
        snapshot.state.stream_state = StreamState::NonStreaming;
        let snapshot: Msg = snapshot.into();
        let msg: Msg = refresh.into();

        for handle in open {
            self.deliver_to_request(handle, &msg, seq_num, ft_group_id, out);
        }

        if !to_pending {
            return;
        }

        for handle in pending {
            let streaming = self.requests.get(handle).is_some_and(|r| r.streaming);

            if streaming {
                if complete {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.pending_refresh.retain(|h| *h != handle);
                        stream.open.push(handle);
                    }
                    if let Some(item) = self.requests.get_mut(handle) {
                        item.phase = RequestPhase::Open;
                    }
                }
                self.deliver_to_request(handle, &msg, seq_num, ft_group_id, out);
            } else {
                self.deliver_to_request(handle, &snapshot, seq_num, ft_group_id, out);
                if complete {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.remove_request(handle);
                    }
                    self.destroy_request(handle);
                }
            }
        }

        if complete {
            self.refresh_completed(stream_id, out);
        }
    }

    /// Refresh закончен: ждавшие запросы запрашиваются заново, поток без
    /// streaming-запросов закрывается.
    fn refresh_completed(&mut self, stream_id: StreamId, out: &mut Vec<WatchlistEvent>) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        if !stream.waiting.is_empty() {
            let waiting = std::mem::take(&mut stream.waiting);
            stream.pending_refresh.extend(waiting.iter().copied());
            stream.refresh_state = RefreshState::PendingRefresh;
            self.registry.set_pending_request(stream_id);

            for handle in waiting {
                if let Some(item) = self.requests.get_mut(handle) {
                    item.phase = RequestPhase::PendingRefresh;
                }
            }
            return;
        }

        let has_streaming = stream
            .requests()
            .any(|h| self.requests.get(h).is_some_and(|r| r.streaming));
        if !has_streaming {
            debug!("stream {stream_id} has no streaming requests left, closing");
            if let Some(mut stream) = self.teardown_stream(stream_id, CloseAction::OnDispatch, out)
            {
                for handle in stream.take_requests() {
                    self.destroy_request(handle);
                }
            }
        }
    }

    /// Провайдер ответил snapshot'ом: запросы получают refresh и закрываются.
    fn fanout_non_streaming_refresh(
        &mut self,
        stream_id: StreamId,
        refresh: RefreshMsg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };

        let complete = refresh.complete;
        let targets: Vec<Handle> = stream
            .pending_refresh
            .iter()
            .chain(stream.open.iter())
            .copied()
            .collect();
        let msg: Msg = refresh.into();

        for handle in targets {
            self.deliver_to_request(handle, &msg, seq_num, ft_group_id, out);
            if complete {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.remove_request(handle);
                }
                self.destroy_request(handle);
            }
        }

        if !complete {
            return;
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.waiting.is_empty() {
            // провайдер поток уже закрыл
            self.teardown_stream(stream_id, CloseAction::Release, out);
            return;
        }

        // Поток открывается заново для тех, кто ждал
        stream.reset_order();
        stream.requested = false;
        let waiting = std::mem::take(&mut stream.waiting);
        stream.pending_refresh.extend(waiting.iter().copied());
        stream.refresh_state = RefreshState::PendingRefresh;
        self.registry.set_pending_request(stream_id);
        self.remove_gap_stream(stream_id);

        for handle in waiting {
            if let Some(item) = self.requests.get_mut(handle) {
                item.phase = RequestPhase::PendingRefresh;
            }
        }
    }

    /// Поток закрыт (провайдером или нами). Запросы с ClosedRecover
    /// переоткрываются, если это разрешено, остальные получают сообщение
    /// и удаляются.
    pub(crate) fn close_and_recover(
        &mut self,
        stream_id: StreamId,
        msg: Msg,
        action: CloseAction,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let Some(mut stream) = self.teardown_stream(stream_id, action, out) else {
            return;
        };

        let recoverable = !stream.private
            && self.config.single_open
            && msg
                .state()
                .is_some_and(|s| s.stream_state == StreamState::ClosedRecover);

        if let Some(state) = msg.state() {
            info!(
                "stream {stream_id} ({}) closed: {state}{}",
                stream.attributes.msg_key,
                if recoverable { ", recovering" } else { "" }
            );
        }

        let mut recover_msg = msg.clone();
        if recoverable {
            override_state(&mut recover_msg, StreamState::Open, DataState::Suspect);
        }

        for handle in stream.take_requests() {
            if let Some(item) = self.requests.get(handle) {
                self.posts.remove_for_owner(item.app_stream_id);
            }

            if recoverable {
                self.deliver_to_request(handle, &recover_msg, None, None, out);
                self.requeue_request(handle);
            } else {
                self.deliver_to_request(handle, &msg, None, None, out);
                self.destroy_request(handle);
            }
        }
    }
}
