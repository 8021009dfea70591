//! Кэш сервисов, собранный из Source Directory.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use rwf_core::{MapAction, Qos, ServiceEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: u16,
    pub name: String,
    pub up: bool,
    pub accepting_requests: bool,
    pub qos: Vec<Qos>,
    pub open_window: Option<u32>,
}

impl Service {
    /// Сервис поднят и принимает запросы.
    pub fn is_available(&self) -> bool {
        self.up && self.accepting_requests
    }

    fn to_entry(&self) -> ServiceEntry {
        ServiceEntry {
            action: MapAction::Add,
            service_id: self.id,
            name: Some(self.name.clone()),
            up: Some(self.up),
            accepting_requests: Some(self.accepting_requests),
            qos: self.qos.clone(),
            open_window: self.open_window,
        }
    }
}

/// Изменение доступности сервиса после очередного directory-сообщения.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub service_id: u16,
    pub name: Option<String>,
    pub available: bool,
    pub removed: bool,
}

#[derive(Debug, Default)]
pub struct ServiceCache {
    services: BTreeMap<u16, Service>,
    by_name: HashMap<String, u16>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Применяет записи directory-сообщения. `clear_cache` сначала забывает
    /// все сервисы (полный refresh). Возвращает только реальные изменения
    /// доступности, упорядоченные по service id.
    pub fn apply(&mut self, entries: &[ServiceEntry], clear_cache: bool) -> Vec<ServiceUpdate> {
        let before = self.availability();

        if clear_cache {
            self.services.clear();
            self.by_name.clear();
        }

        for entry in entries {
            self.apply_entry(entry);
        }

        self.diff(before)
    }

    /// Забывает все сервисы (directory закрыт или канал потерян).
    pub fn clear(&mut self) -> Vec<ServiceUpdate> {
        self.apply(&[], true)
    }

    pub fn by_id(&self, service_id: u16) -> Option<&Service> {
        self.services.get(&service_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Service> {
        self.by_name.get(name).and_then(|id| self.services.get(id))
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Содержимое кэша в виде записей Add (для directory-запросов приложения).
    pub fn to_entries(&self) -> Vec<ServiceEntry> {
        self.services.values().map(Service::to_entry).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn apply_entry(&mut self, entry: &ServiceEntry) {
        let known = self.services.contains_key(&entry.service_id);

        match entry.action {
            MapAction::Delete => {
                if let Some(service) = self.services.remove(&entry.service_id) {
                    self.by_name.remove(&service.name);
                    info!("service {} ({}) deleted", service.name, service.id);
                }
            }
            // Add по известному id означает Update
            MapAction::Add | MapAction::Update if known => self.update_service(entry),
            MapAction::Add => {
                let service = Service {
                    id: entry.service_id,
                    name: entry.name.clone().unwrap_or_default(),
                    up: entry.up.unwrap_or(true),
                    accepting_requests: entry.accepting_requests.unwrap_or(true),
                    qos: entry.qos.clone(),
                    open_window: entry.open_window,
                };
                info!(
                    "service {} ({}) added, up={}",
                    service.name, service.id, service.up
                );
                if !service.name.is_empty() {
                    self.by_name.insert(service.name.clone(), service.id);
                }
                self.services.insert(service.id, service);
            }
            MapAction::Update => {
                debug!("update for unknown service {} ignored", entry.service_id);
            }
        }
    }

    fn update_service(&mut self, entry: &ServiceEntry) {
        let Some(service) = self.services.get_mut(&entry.service_id) else {
            return;
        };

        if let Some(name) = &entry.name {
            if *name != service.name {
                self.by_name.remove(&service.name);
                self.by_name.insert(name.clone(), service.id);
                service.name = name.clone();
            }
        }
        if let Some(up) = entry.up {
            service.up = up;
        }
        if let Some(accepting) = entry.accepting_requests {
            service.accepting_requests = accepting;
        }
        if !entry.qos.is_empty() {
            service.qos = entry.qos.clone();
        }
        if entry.open_window.is_some() {
            service.open_window = entry.open_window;
        }
    }

    fn availability(&self) -> BTreeMap<u16, (String, bool)> {
        self.services
            .values()
            .map(|s| (s.id, (s.name.clone(), s.is_available())))
            .collect()
    }

    fn diff(&self, before: BTreeMap<u16, (String, bool)>) -> Vec<ServiceUpdate> {
        let mut updates = Vec::new();

        for service in self.services.values() {
            let was_available = before.get(&service.id).is_some_and(|(_, a)| *a);
            if service.is_available() != was_available {
                updates.push(ServiceUpdate {
                    service_id: service.id,
                    name: Some(service.name.clone()),
                    available: service.is_available(),
                    removed: false,
                });
            }
        }

        for (id, (name, _)) in before {
            if !self.services.contains_key(&id) {
                updates.push(ServiceUpdate {
                    service_id: id,
                    name: Some(name),
                    available: false,
                    removed: true,
                });
            }
        }

        updates.sort_by_key(|u| u.service_id);
        updates
    }
}
