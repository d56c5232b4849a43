use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port enumeration task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Arduino not connected")]
    DeviceNotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;
