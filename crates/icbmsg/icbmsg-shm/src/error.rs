use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("access of {len} bytes at offset {offset} exceeds region of {region} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region: usize,
    },

    #[error("offset {offset} is not {align}-byte aligned")]
    Misaligned { offset: usize, align: usize },

    #[error("failed to map '{path}'")]
    Map {
        path: String,
        #[source]
        source: io::Error,
    },
}
