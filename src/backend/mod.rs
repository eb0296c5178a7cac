pub mod api;
pub mod stream;

pub use api::{
    BackendClient, BackendError, ChatEntry, FilePayload, QueryRequest, TranscriptionError,
    UploadResponse,
};
pub use stream::{apply_update, start_streaming, StreamingSession, StreamingUpdate};
