//! Ownership of the single active [`CoffeeMachine`].
//!
//! Only one driver may hold the serial line at a time. The manager hands out
//! the current instance and replaces it when the port changes or a fresh one
//! is requested, retiring the old instance before the new one is created.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::{
    cache::StatusCache,
    config::SerialSettings,
    driver::{clock::Clock, CoffeeMachine},
    transport::TransportFactory,
};

pub struct MachineManager {
    defaults: SerialSettings,
    factory: Arc<dyn TransportFactory>,
    cache: Arc<StatusCache>,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<Arc<CoffeeMachine>>>,
}

impl MachineManager {
    pub fn new(
        defaults: SerialSettings,
        factory: Arc<dyn TransportFactory>,
        cache: Arc<StatusCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            defaults,
            factory,
            cache,
            clock,
            current: Mutex::new(None),
        }
    }

    /// Current instance, created on first use with the configured settings.
    pub fn get(&self) -> Arc<CoffeeMachine> {
        self.get_with(None, None, false)
    }

    /// Current instance, replaced when `force_new` is set or `port` differs
    /// from the active one.
    pub fn get_with(
        &self,
        port: Option<&str>,
        baud_rate: Option<u32>,
        force_new: bool,
    ) -> Arc<CoffeeMachine> {
        let mut current = self.current.lock();

        if let Some(machine) = current.as_ref() {
            let port_changed = port.is_some_and(|p| p != machine.port());
            if !force_new && !port_changed {
                return machine.clone();
            }
        }

        let base = current
            .as_ref()
            .map(|m| m.settings().clone())
            .unwrap_or_else(|| self.defaults.clone());
        if let Some(old) = current.take() {
            log::info!(
                "Replacing coffee machine instance on {} (force_new={force_new})",
                old.port()
            );
            old.retire();
            self.cache.clear();
        }

        let settings = base.with_overrides(port, baud_rate);
        let transport = self.factory.create(&settings);
        let machine = Arc::new(CoffeeMachine::new(
            settings,
            transport,
            self.cache.clone(),
            self.clock.clone(),
        ));
        *current = Some(machine.clone());
        machine
    }

    /// Active instance without creating one.
    pub fn current(&self) -> Option<Arc<CoffeeMachine>> {
        self.current.lock().clone()
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Retire the active instance, if any.
    pub fn shutdown(&self) {
        if let Some(machine) = self.current.lock().take() {
            machine.retire();
        }
    }
}
