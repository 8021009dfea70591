//! Арифметика номеров последовательности с переполнением через 2^32.

use crate::types::SeqNum;

/// Сравнение в стиле TCP: `< 0` — `a` раньше `b`, `0` — равны, `> 0` — позже.
pub fn seq_compare(a: SeqNum, b: SeqNum) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Следующий номер. Ноль после первого сообщения не используется,
/// поэтому после 0 и после `u32::MAX` идёт 1.
pub fn next_seq_num(seq: SeqNum) -> SeqNum {
    if seq == u32::MAX { 1 } else { seq + 1 }
}

/// Предыдущий номер (обратная к [`next_seq_num`] операция).
pub fn prev_seq_num(seq: SeqNum) -> SeqNum {
    if seq <= 1 { u32::MAX } else { seq - 1 }
}
