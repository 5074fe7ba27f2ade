//! Plugin device: channels from vats to host-provided modules.
//!
//! The channel table (index, module reference, owning vat) is kernel state
//! and survives restarts. Live connections do not: after a restart every
//! channel is `Unbound` and is reconnected lazily by the next send. A
//! broken channel also stays broken until the next send.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slots::VatId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("unknown plugin channel {0}")]
    UnknownChannel(u32),
    #[error("plugin channel {index} belongs to {owner}")]
    NotOwner { index: u32, owner: VatId },
    #[error("no plugin host installed")]
    NoHost,
    #[error("cannot load plugin module {module}: {detail}")]
    Load { module: String, detail: String },
    #[error("plugin channel {index} broken: {detail}")]
    Broken { index: u32, detail: String },
}

/// A live connection to a loaded plugin module.
pub trait PluginConnection: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), String>;
}

/// Loads plugin modules on behalf of the kernel. Responses flow back
/// through `Kernel::deliver_plugin_response`.
pub trait PluginHost: Send {
    fn connect(&mut self, module_ref: &str, index: u32) -> Result<Box<dyn PluginConnection>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginChannelRecord {
    pub module_ref: String,
    pub owner: VatId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Unbound,
    Bound,
    Broken,
}

enum ChannelState {
    Unbound,
    Bound(Box<dyn PluginConnection>),
    Broken(String),
}

/// Resolves the channel index a `connect` call refers to, checking
/// ownership of an existing channel or allocating the next index.
pub fn resolve_connect(
    channels: &BTreeMap<u32, PluginChannelRecord>,
    next_index: u32,
    owner: VatId,
    requested: Option<u32>,
) -> Result<u32, PluginError> {
    match requested {
        None => Ok(next_index),
        Some(index) => match channels.get(&index) {
            Some(rec) if rec.owner == owner => Ok(index),
            Some(rec) => Err(PluginError::NotOwner { index, owner: rec.owner }),
            None => Err(PluginError::UnknownChannel(index)),
        },
    }
}

#[derive(Default)]
pub struct PluginDevice {
    host: Option<Box<dyn PluginHost>>,
    channels: BTreeMap<u32, ChannelState>,
}

impl fmt::Debug for PluginDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDevice")
            .field("host", &self.host.is_some())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_host(&mut self, host: Box<dyn PluginHost>) {
        self.host = Some(host);
    }

    pub fn status(&self, index: u32) -> ChannelStatus {
        match self.channels.get(&index) {
            None | Some(ChannelState::Unbound) => ChannelStatus::Unbound,
            Some(ChannelState::Bound(_)) => ChannelStatus::Bound,
            Some(ChannelState::Broken(_)) => ChannelStatus::Broken,
        }
    }

    /// Why the channel broke, while it stays broken.
    pub fn broken_reason(&self, index: u32) -> Option<&str> {
        match self.channels.get(&index) {
            Some(ChannelState::Broken(reason)) => Some(reason),
            _ => None,
        }
    }

    /// The host reported the connection gone. Nothing reconnects until the
    /// next send.
    pub fn mark_broken(&mut self, index: u32, reason: &str) {
        warn!("plugin channel {} torn down: {}", index, reason);
        self.channels.insert(index, ChannelState::Broken(reason.to_string()));
    }

    pub fn send(&mut self, index: u32, record: &PluginChannelRecord, payload: &[u8]) -> Result<(), PluginError> {
        let state = self.channels.remove(&index).unwrap_or(ChannelState::Unbound);
        let mut conn = match state {
            ChannelState::Bound(conn) => conn,
            ChannelState::Unbound | ChannelState::Broken(_) => {
                let Some(host) = self.host.as_mut() else {
                    self.channels.insert(index, ChannelState::Broken("no plugin host".to_string()));
                    return Err(PluginError::NoHost);
                };
                match host.connect(&record.module_ref, index) {
                    Ok(conn) => {
                        debug!("plugin channel {} bound to {}", index, record.module_ref);
                        conn
                    }
                    Err(detail) => {
                        self.channels.insert(index, ChannelState::Broken(detail.clone()));
                        return Err(PluginError::Load { module: record.module_ref.clone(), detail });
                    }
                }
            }
        };
        match conn.send(payload) {
            Ok(()) => {
                self.channels.insert(index, ChannelState::Bound(conn));
                Ok(())
            }
            Err(detail) => {
                warn!("plugin channel {} broken: {}", index, detail);
                self.channels.insert(index, ChannelState::Broken(detail.clone()));
                Err(PluginError::Broken { index, detail })
            }
        }
    }
}
