use thiserror::Error;

/// Ошибки кодирования кадров и буферизованных сообщений
#[derive(Debug, Error)]
pub enum WireError {
    /// В кадре нет даже байта версии
    #[error("empty frame")]
    EmptyFrame,

    #[error("unsupported frame version: {0}")]
    UnsupportedWireVersion(u8),

    /// Сообщение не кодируется или кадр повреждён
    #[error("message codec error: {0}")]
    Codec(#[from] postcard::Error),
}
