//! Channel adapters for courier
//!
//! Each adapter acts as one identity on the messaging network. The bus
//! merges their events and exposes them to the engine as a messaging client.

pub mod bus;
pub mod telegram;

pub use bus::{BusSender, ChannelBus, IdentityChannel};
pub use telegram::TelegramChannel;
