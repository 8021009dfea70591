//! Item-потоки и запросы приложения, которые на них сидят.

use rwf_core::{DomainType, MsgKey, Qos, SeqNum, StreamId};

use crate::attributes::StreamAttributes;
use crate::event::StreamInfo;
use crate::pool::Handle;
use crate::reorder::MsgReorderQueue;

/// Как запрос называет сервис.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ServiceRef {
    Id(u16),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestPhase {
    /// В очереди новых запросов, ещё не привязан к потоку
    New,
    /// Сервиса нет или он не принимает запросы
    WaitingForService,
    PendingRefresh,
    Open,
    /// Поток посреди многочастного refresh; запрос переотправится после него
    Waiting,
}

#[derive(Debug, Clone)]
pub(crate) struct ItemRequest {
    pub app_stream_id: StreamId,
    pub user_spec: Option<u64>,
    pub domain_type: DomainType,
    /// Ключ в том виде, в каком его прислало приложение
    pub key: MsgKey,
    pub qos: Option<Qos>,
    pub streaming: bool,
    pub private: bool,
    pub service: ServiceRef,
    pub stream: Option<StreamId>,
    pub phase: RequestPhase,
    /// Приложение уже знает, что данные SUSPECT; повторный статус не нужен
    pub suspect_notified: bool,
}

impl ItemRequest {
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.app_stream_id,
            user_spec: self.user_spec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshState {
    None,
    /// Запрос отправлен или ждёт отправки
    PendingRefresh,
    /// Пришла часть многочастного refresh
    PendingRefreshComplete,
}

impl RefreshState {
    pub fn is_pending(self) -> bool {
        self != RefreshState::None
    }
}

/// Состояние восстановления порядка multicast-сообщений потока.
#[derive(Debug, Clone, Default)]
pub(crate) struct OrderState {
    pub has_uc_seq_num: bool,
    pub has_bc_seq_num: bool,
    pub seq_num: SeqNum,
    /// Broadcast status/refresh, по которому синхронизировались до unicast
    pub bc_synch_seq_num: Option<SeqNum>,
    pub next_part_num: u16,
    pub has_bc_seq_gap: bool,
    pub has_part_gap: bool,
    pub bc_behind_uc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GapFlag {
    BcSeqGap,
    PartGap,
    BcBehindUc,
}

impl OrderState {
    pub fn has_gap_flags(&self) -> bool {
        self.has_bc_seq_gap || self.has_part_gap || self.bc_behind_uc
    }

    pub fn flag_mut(&mut self, flag: GapFlag) -> &mut bool {
        match flag {
            GapFlag::BcSeqGap => &mut self.has_bc_seq_gap,
            GapFlag::PartGap => &mut self.has_part_gap,
            GapFlag::BcBehindUc => &mut self.bc_behind_uc,
        }
    }

    pub fn clear_gap_flags(&mut self) {
        self.has_bc_seq_gap = false;
        self.has_part_gap = false;
        self.bc_behind_uc = false;
    }
}

#[derive(Debug)]
pub(crate) struct ItemStream {
    pub stream_id: StreamId,
    pub attributes: StreamAttributes,
    pub service_id: u16,
    pub private: bool,
    pub refresh_state: RefreshState,
    /// Провайдер уже получал запрос по этому потоку
    pub requested: bool,
    pub pending_refresh: Vec<Handle>,
    pub open: Vec<Handle>,
    pub waiting: Vec<Handle>,
    pub order: OrderState,
    pub queue: MsgReorderQueue,
    /// FT-группа, от которой поток получает broadcast
    pub ft_group: Option<u8>,
}

impl ItemStream {
    pub fn new(
        stream_id: StreamId,
        attributes: StreamAttributes,
        service_id: u16,
        private: bool,
        max_buffered: usize,
    ) -> Self {
        Self {
            stream_id,
            attributes,
            service_id,
            private,
            refresh_state: RefreshState::PendingRefresh,
            requested: false,
            pending_refresh: Vec::new(),
            open: Vec::new(),
            waiting: Vec::new(),
            order: OrderState::default(),
            queue: MsgReorderQueue::new(max_buffered),
            ft_group: None,
        }
    }

    pub fn domain_type(&self) -> DomainType {
        self.attributes.domain_type
    }

    pub fn request_count(&self) -> usize {
        self.pending_refresh.len() + self.open.len() + self.waiting.len()
    }

    pub fn requests(&self) -> impl Iterator<Item = Handle> + '_ {
        self.pending_refresh
            .iter()
            .chain(self.open.iter())
            .chain(self.waiting.iter())
            .copied()
    }

    /// Забирает все запросы потока: сначала ждущие refresh, потом открытые.
    pub fn take_requests(&mut self) -> Vec<Handle> {
        let mut all = std::mem::take(&mut self.pending_refresh);
        all.append(&mut self.open);
        all.append(&mut self.waiting);
        all
    }

    pub fn remove_request(&mut self, handle: Handle) -> bool {
        for list in [&mut self.pending_refresh, &mut self.open, &mut self.waiting] {
            if let Some(pos) = list.iter().position(|h| *h == handle) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Сброс порядка перед новым открытием потока.
    pub fn reset_order(&mut self) {
        self.order = OrderState::default();
        self.queue.discard_all();
    }
}
