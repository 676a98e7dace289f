//! # shiguredo_http_proto
//!
//! 組み込み HTTP/WebSocket サーバー向けのプロトコルコア (Sans I/O)
//!
//! ## 特徴
//!
//! - **Sans I/O**: I/O を完全に分離した設計。トランスポートは [`Transport`] トレイトで差し込む
//! - **ゼロコピー**: ヘッダーと multipart パートは入力バッファを借用する
//! - **ノンブロッキング**: 書き込めなかった分は送信待ちに積み、書き込み可能通知で再開する
//!
//! ## 構成
//!
//! - [`header`]: ヘッダーブロックのパース
//! - [`extensions`]: `Sec-WebSocket-Extensions` の圧縮ネゴシエーション
//! - [`multipart`]: multipart ボディの分割
//! - [`sink`]: バックプレッシャー付きの出力状態機械
//! - [`response`] / [`websocket`] / [`h3`]: 出力状態機械を使うレスポンス
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::{HeaderBlockParser, HttpResponse, MemoryTransport};
//!
//! // リクエストヘッダーをパース
//! let (headers, consumed) = HeaderBlockParser::new()
//!     .parse(b"Host: example.com\r\nAccept: */*\r\n\r\n")
//!     .unwrap();
//! assert_eq!(headers.get_str("host"), Some("example.com"));
//! assert_eq!(consumed, 34);
//!
//! // レスポンスを書き込む
//! let mut res = HttpResponse::new(MemoryTransport::new());
//! res.write_header("Content-Type", "text/plain");
//! res.end(b"Hello, World!");
//! assert!(res.has_responded());
//! ```

pub mod compression;
mod error;
pub mod extensions;
pub mod h3;
pub mod header;
pub mod limits;
pub mod multipart;
pub mod response;
pub mod sink;
pub mod websocket;

pub use error::Error;
pub use extensions::{
    CompressOptions, NegotiatedParams, NegotiationPolicy, WindowBits, WindowMode, negotiate,
    negotiate_compression,
};
pub use h3::Http3Stream;
pub use header::{HeaderBlockParser, HeaderError, HeaderSet, HeaderView, parse_header_block};
pub use limits::{ParserLimits, WebSocketLimits};
pub use multipart::{MultipartError, MultipartParser, Part};
pub use response::HttpResponse;
pub use sink::{MemoryTransport, OutputSink, SinkError, SinkState, Transport};
pub use websocket::{OpCode, SendStatus, WebSocketStream};
