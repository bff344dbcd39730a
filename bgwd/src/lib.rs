//! Daemon front end for the BLE wearable gateway: loads configuration,
//! sets up logging and runs the [`bgw_broker`] gateway until interrupted.

pub mod config;

use bgw_broker::BrokerError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayDaemonError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Broker Error")]
    BrokerError(#[from] BrokerError),
    #[error("Config Error")]
    Config(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    InvalidConfig(String),
    #[error("Logging setup failed: {0}")]
    Logging(String),
    #[error("Gateway actor unreachable")]
    Mailbox(#[from] actix::MailboxError),
}

pub type GatewayDaemonResult<T> = std::result::Result<T, GatewayDaemonError>;
