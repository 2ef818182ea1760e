//! Channel factories, keyed by channel type.
//!
//! The registry is built once by the application and handed to the
//! session; CHANNELS_LIST entries are turned into channels through it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::channel::{Channel, ChannelEnv};
use crate::dispatch::ChannelHandler;
use crate::message::{ChannelIdentity, ChannelType};

/// Builds channels of one type.
pub trait ChannelFactory: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Construct a passive channel with the given id.
    fn create(&self, id: u8, env: Arc<ChannelEnv>) -> Channel;
}

struct FnFactory<F> {
    channel_type: ChannelType,
    make: F,
}

impl<H, F> ChannelFactory for FnFactory<F>
where
    H: ChannelHandler,
    F: Fn(u8) -> H + Send + Sync,
{
    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn create(&self, id: u8, env: Arc<ChannelEnv>) -> Channel {
        let identity = ChannelIdentity::new(self.channel_type, id);
        Channel::new(identity, (self.make)(id), env)
    }
}

/// Channel type → factory.
#[derive(Default)]
pub struct ChannelRegistry {
    factories: HashMap<ChannelType, Box<dyn ChannelFactory>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `factory`, replacing any earlier one for the same type.
    pub fn register(&mut self, factory: impl ChannelFactory + 'static) -> &mut Self {
        self.factories
            .insert(factory.channel_type(), Box::new(factory));
        self
    }

    /// Register a factory that builds a fresh handler per channel id.
    pub fn register_fn<H, F>(&mut self, channel_type: ChannelType, make: F) -> &mut Self
    where
        H: ChannelHandler,
        F: Fn(u8) -> H + Send + Sync + 'static,
    {
        self.register(FnFactory { channel_type, make })
    }

    pub fn contains(&self, channel_type: ChannelType) -> bool {
        self.factories.contains_key(&channel_type)
    }

    /// Registered types in wire order.
    pub fn types(&self) -> Vec<ChannelType> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_by_key(|t| *t as u8);
        types
    }

    /// Build the channel for `identity`, if its type has a factory.
    pub fn create(&self, identity: ChannelIdentity, env: Arc<ChannelEnv>) -> Option<Channel> {
        self.factories
            .get(&identity.channel_type)
            .map(|f| f.create(identity.id, env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerTable;

    struct Null;

    impl ChannelHandler for Null {
        fn handler_table() -> HandlerTable<Self> {
            HandlerTable::new()
        }
    }

    #[test]
    fn types_are_sorted_and_replaced() {
        let mut r = ChannelRegistry::new();
        r.register_fn(ChannelType::Cursor, |_| Null)
            .register_fn(ChannelType::Inputs, |_| Null)
            .register_fn(ChannelType::Cursor, |_| Null);
        assert_eq!(r.types(), vec![ChannelType::Inputs, ChannelType::Cursor]);
        assert!(r.contains(ChannelType::Inputs));
        assert!(!r.contains(ChannelType::Display));
    }
}
