use crate::slots::SlotError;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("out of device memory while allocating {what}")]
    OutOfMemory { what: &'static str },
    #[error("stale {kind} handle")]
    StaleHandle {
        kind: &'static str,
        #[source]
        source: SlotError,
    },
    #[error("buffer is not mapped")]
    NotMapped,
    #[error("buffer is already mapped")]
    AlreadyMapped,
    #[error("{what} is out of bounds")]
    OutOfBounds { what: &'static str },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("buffer readback failed: {0}")]
    Readback(String),
    #[error("no suitable adapter: {0}")]
    NoAdapter(String),
    #[error("device request failed: {0}")]
    RequestDevice(String),
}

impl GpuError {
    pub(crate) fn stale_image(source: SlotError) -> Self {
        match source {
            SlotError::OutOfSlots => GpuError::OutOfMemory { what: "image" },
            source => GpuError::StaleHandle {
                kind: "image",
                source,
            },
        }
    }

    pub(crate) fn stale_buffer(source: SlotError) -> Self {
        match source {
            SlotError::OutOfSlots => GpuError::OutOfMemory { what: "buffer" },
            source => GpuError::StaleHandle {
                kind: "buffer",
                source,
            },
        }
    }
}
