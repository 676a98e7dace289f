use std::fmt;

use crate::compression::CompressionError;
use crate::header::HeaderError;
use crate::multipart::MultipartError;
use crate::sink::SinkError;

/// プロトコル処理エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// ヘッダーブロックのパースエラー
    Header(HeaderError),
    /// multipart ボディのパースエラー
    Multipart(MultipartError),
    /// 出力エラー
    Sink(SinkError),
    /// 圧縮エラー
    Compression(CompressionError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Header(e) => write!(f, "header error: {}", e),
            Error::Multipart(e) => write!(f, "multipart error: {}", e),
            Error::Sink(e) => write!(f, "output error: {}", e),
            Error::Compression(e) => write!(f, "compression error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Header(e) => Some(e),
            Error::Multipart(e) => Some(e),
            Error::Sink(e) => Some(e),
            Error::Compression(e) => Some(e),
        }
    }
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Error::Header(e)
    }
}

impl From<MultipartError> for Error {
    fn from(e: MultipartError) -> Self {
        Error::Multipart(e)
    }
}

impl From<SinkError> for Error {
    fn from(e: SinkError) -> Self {
        Error::Sink(e)
    }
}

impl From<CompressionError> for Error {
    fn from(e: CompressionError) -> Self {
        Error::Compression(e)
    }
}
