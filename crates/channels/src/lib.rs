pub mod manager;
pub mod rate_limit;
pub mod telegram;

pub use manager::ChannelManager;
pub use telegram::{TelegramChannel, TelegramSender};
