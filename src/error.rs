use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("track already exists: {0}")]
    TrackExists(String),

    #[error("track is not exists: {0}")]
    TrackIsNotExists(String),

    #[error("local track setup failed: {0}")]
    LocalTrackSetup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
