use serde::{Deserialize, Serialize};

use crate::types::Qos;

/// Действие над записью карты сервисов в directory-сообщении.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapAction {
    Add,
    Update,
    Delete,
}

/// Одна запись о сервисе из уже декодированного Source Directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub action: MapAction,
    pub service_id: u16,
    /// Имя есть в Add-записях и может отсутствовать в Update
    pub name: Option<String>,
    /// `Some(true)` = ServiceState Up
    pub up: Option<bool>,
    pub accepting_requests: Option<bool>,
    /// Пустой список в Update означает "без изменений"
    pub qos: Vec<Qos>,
    pub open_window: Option<u32>,
}

impl ServiceEntry {
    /// Новый работающий сервис с QoS realtime.
    pub fn up(service_id: u16, name: impl Into<String>) -> Self {
        Self {
            action: MapAction::Add,
            service_id,
            name: Some(name.into()),
            up: Some(true),
            accepting_requests: Some(true),
            qos: vec![Qos::REALTIME],
            open_window: None,
        }
    }
}
