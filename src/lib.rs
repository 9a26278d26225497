//! Sub-bot linking for a Telegram-fronted bot.

pub mod commands;
pub mod config;
pub mod linking;
pub mod telegram;
pub mod telegram_log;
