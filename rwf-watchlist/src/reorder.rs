//! Буфер multicast-сообщений одного потока на время восстановления порядка.

use std::collections::VecDeque;

use log::debug;
use rwf_core::seq::{next_seq_num, seq_compare};
use rwf_core::wire::{decode_msg, encode_msg};
use rwf_core::{Msg, SeqNum, WireError};

use crate::error::WatchlistError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOrigin {
    /// Ответ по stream id потока
    Unicast,
    /// Сообщение со stream id 0, найденное по атрибутам
    Broadcast,
}

/// Сохранённая копия сообщения. Входной буфер живёт только до конца вызова,
/// поэтому сообщение хранится закодированным.
#[derive(Debug, Clone)]
pub struct BufferedMsg {
    bytes: Vec<u8>,
    pub seq_num: SeqNum,
    pub ft_group_id: Option<u8>,
    pub origin: MsgOrigin,
}

impl BufferedMsg {
    pub fn msg(&self) -> Result<Msg, WireError> {
        decode_msg(&self.bytes)
    }
}

/// Итог одного прохода [`MsgReorderQueue::check_broadcast_sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCheck {
    /// Последний номер непрерывной цепочки
    pub seq_num: SeqNum,
    pub has_gap: bool,
    /// Сколько сообщений осталось в очереди
    pub retained: usize,
}

/// FIFO-очередь буферизованных сообщений. Unicast и broadcast в одной очереди
/// одновременно не лежат.
#[derive(Debug)]
pub struct MsgReorderQueue {
    msgs: VecDeque<BufferedMsg>,
    max_buffered: usize,
}

impl MsgReorderQueue {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            msgs: VecDeque::new(),
            max_buffered,
        }
    }

    /// Копирует сообщение в конец очереди; при переполнении выбрасывает самое старое.
    ///
    /// Unicast кладётся только в пустую или unicast-очередь, broadcast только
    /// в пустую или broadcast-очередь: порядок в потоке это гарантирует.
    pub fn push(
        &mut self,
        msg: &Msg,
        seq_num: SeqNum,
        ft_group_id: Option<u8>,
    ) -> Result<(), WatchlistError> {
        let origin = if msg.is_broadcast() {
            MsgOrigin::Broadcast
        } else {
            MsgOrigin::Unicast
        };

        if let Some(front) = self.msgs.front() {
            if front.origin != origin {
                debug_assert!(false, "mixed unicast and broadcast in one reorder queue");
                return Err(WatchlistError::Invariant(format!(
                    "{origin:?} message pushed onto a {:?} reorder queue",
                    front.origin
                )));
            }
        }

        let bytes = encode_msg(msg)?;

        if self.msgs.len() >= self.max_buffered {
            if let Some(evicted) = self.msgs.pop_front() {
                debug!(
                    "reorder queue full ({}), dropping seq {}",
                    self.max_buffered, evicted.seq_num
                );
            }
        }

        self.msgs.push_back(BufferedMsg {
            bytes,
            seq_num,
            ft_group_id,
            origin,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<BufferedMsg> {
        self.msgs.pop_front()
    }

    /// Первое сообщение, если оно не позже `seq_num`.
    pub fn pop_until(&mut self, seq_num: SeqNum) -> Option<BufferedMsg> {
        let front = self.msgs.front()?;
        if seq_compare(front.seq_num, seq_num) <= 0 {
            self.msgs.pop_front()
        } else {
            None
        }
    }

    /// Один проход по broadcast-сообщениям: всё, что не продолжает цепочку от
    /// `expected`, выбрасывается. Повторный вызов может выбросить больше.
    pub fn check_broadcast_sequence(&mut self, expected: SeqNum) -> SequenceCheck {
        let mut seq_num = expected;
        let mut has_gap = false;

        self.msgs.retain(|m| {
            if m.origin != MsgOrigin::Broadcast {
                return true;
            }
            if m.seq_num == next_seq_num(seq_num) {
                seq_num = m.seq_num;
                true
            } else {
                has_gap = true;
                false
            }
        });

        SequenceCheck {
            seq_num,
            has_gap,
            retained: self.msgs.len(),
        }
    }

    /// Выбрасывает всё с начала очереди до `seq_num` включительно.
    pub fn discard_until(&mut self, seq_num: SeqNum) {
        while self.pop_until(seq_num).is_some() {}
    }

    pub fn discard_all(&mut self) {
        self.msgs.clear();
    }

    pub fn has_unicast_msgs(&self) -> bool {
        self.msgs
            .front()
            .is_some_and(|m| m.origin == MsgOrigin::Unicast)
    }

    pub fn has_broadcast_msgs(&self) -> bool {
        self.msgs
            .front()
            .is_some_and(|m| m.origin == MsgOrigin::Broadcast)
    }

    /// Выбрасывает сообщения не новее `seq_num`, где бы они ни стояли.
    /// Без gap recovery broadcast лежат в порядке прихода, а не номеров.
    pub fn discard_not_newer_than(&mut self, seq_num: SeqNum) {
        self.msgs.retain(|m| seq_compare(m.seq_num, seq_num) > 0);
    }

    pub fn last_broadcast_seq_num(&self) -> Option<SeqNum> {
        self.msgs
            .back()
            .filter(|m| m.origin == MsgOrigin::Broadcast)
            .map(|m| m.seq_num)
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn seq_nums(&self) -> Vec<SeqNum> {
        self.msgs.iter().map(|m| m.seq_num).collect()
    }
}
