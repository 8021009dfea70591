//! Транспорт канала.
//!
//! Реактор пишет в канал через [`Transport`], а входящие байты забирает из
//! crossbeam-`Receiver<Vec<u8>>`: так один `Select` ждёт сразу все каналы.

use crossbeam_channel::{Receiver, Sender};

/// Исходящая сторона канала. Один вызов `write` = один кадр.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Транспорт поверх crossbeam-канала: для тестов и loopback.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
}

impl Transport for MemoryTransport {
    fn write(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| anyhow::anyhow!("peer is disconnected"))
    }
}

/// Один конец memory-канала: куда писать и откуда читать.
#[derive(Debug)]
pub struct MemoryEnd {
    pub transport: MemoryTransport,
    pub inbound: Receiver<Vec<u8>>,
}

/// Два связанных конца: то, что пишет один, читает другой.
pub fn memory_pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = crossbeam_channel::unbounded();
    let (b_tx, a_rx) = crossbeam_channel::unbounded();
    (
        MemoryEnd {
            transport: MemoryTransport { tx: a_tx },
            inbound: a_rx,
        },
        MemoryEnd {
            transport: MemoryTransport { tx: b_tx },
            inbound: b_rx,
        },
    )
}
