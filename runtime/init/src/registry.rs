//! Service Registry
//!
//! Maps well-known service ids to whoever provides them. Init provides the
//! RAM, serial, LED, init and domain-manager services itself; every other
//! service is provided by a domain reached over a provider channel.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use tern_ipc::{ChannelId, ServiceId};

use crate::{InitError, Result};

/// Who answers lookups for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Served by init on a channel accepted per lookup
    Local,
    /// Served by a domain; init routes endpoint requests down this channel
    Channel(ChannelId),
}

/// Service Registry
///
/// At most one provider per service id.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceId, Provider>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with init's own services filled in
    pub fn with_local_services() -> Self {
        let mut registry = Self::new();
        for sid in [
            ServiceId::RAM,
            ServiceId::SERIAL,
            ServiceId::LED,
            ServiceId::INIT,
            ServiceId::DOMAIN_MANAGER,
        ] {
            registry.services.insert(sid, Provider::Local);
        }
        registry
    }

    /// Register a service
    ///
    /// # Errors
    /// `InvalidArgument` for an id outside the well-known range,
    /// `AlreadyRegistered` if the id has a provider.
    pub fn register(&mut self, sid: ServiceId, provider: Provider) -> Result<()> {
        if !sid.is_valid() {
            return Err(InitError::InvalidArgument("service id out of range"));
        }
        if self.services.contains_key(&sid) {
            return Err(InitError::AlreadyRegistered(sid));
        }
        self.services.insert(sid, provider);
        Ok(())
    }

    pub fn lookup(&self, sid: ServiceId) -> Option<Provider> {
        self.services.get(&sid).copied()
    }

    pub fn unregister(&mut self, sid: ServiceId) -> Option<Provider> {
        self.services.remove(&sid)
    }

    /// Drop every service provided over `chan`, returning their ids
    pub fn remove_channel(&mut self, chan: ChannelId) -> Vec<ServiceId> {
        let gone: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|(_, p)| **p == Provider::Channel(chan))
            .map(|(sid, _)| *sid)
            .collect();
        for sid in &gone {
            self.services.remove(sid);
        }
        gone
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceId, Provider)> + '_ {
        self.services.iter().map(|(sid, p)| (*sid, *p))
    }
}
