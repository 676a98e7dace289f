//! tokio_http_proto エラー型

use std::fmt;

/// tokio_http_proto エラー
#[derive(Debug)]
pub enum Error {
    /// I/O エラー
    Io(std::io::Error),
    /// プロトコル処理エラー
    Proto(shiguredo_http_proto::Error),
    /// 不正なリクエスト行
    InvalidRequestLine,
    /// 不正な Content-Length
    InvalidContentLength,
    /// リクエストヘッダーが大きすぎる
    RequestTooLarge(usize),
    /// 接続タイムアウト
    Timeout,
    /// 接続が閉じられた
    ConnectionClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Proto(e) => write!(f, "protocol error: {}", e),
            Error::InvalidRequestLine => write!(f, "invalid request line"),
            Error::InvalidContentLength => write!(f, "invalid content-length"),
            Error::RequestTooLarge(size) => write!(f, "request head too large: {} bytes", size),
            Error::Timeout => write!(f, "connection timeout"),
            Error::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Proto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<shiguredo_http_proto::Error> for Error {
    fn from(e: shiguredo_http_proto::Error) -> Self {
        Error::Proto(e)
    }
}

impl From<shiguredo_http_proto::HeaderError> for Error {
    fn from(e: shiguredo_http_proto::HeaderError) -> Self {
        Error::Proto(e.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result 型エイリアス
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_error_converts_to_proto() {
        let e: Error = shiguredo_http_proto::HeaderError::MissingColon.into();
        assert!(matches!(e, Error::Proto(_)));
        assert!(e.to_string().starts_with("protocol error: header error: "));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn display() {
        assert_eq!(Error::Timeout.to_string(), "connection timeout");
        assert_eq!(
            Error::RequestTooLarge(9000).to_string(),
            "request head too large: 9000 bytes"
        );
    }
}
