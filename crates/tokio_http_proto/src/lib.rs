//! tokio_http_proto - Tokio integration for shiguredo_http_proto
//!
//! tokio を使用した非同期 HTTP/1.1 サーバーライブラリ。
//!
//! ## 特徴
//!
//! - **shiguredo_http_proto ベース**: Sans I/O のプロトコルコアをベースにした設計
//! - **ノンブロッキング書き込み**: 書き込めなかった分はレスポンスに積み、書き込み可能通知で流す
//! - **Keep-Alive**: HTTP/1.1 Keep-Alive 接続のサポート
//!
//! ## サーバー
//!
//! ```ignore
//! use tokio_http_proto::{Request, Server, TcpTransport};
//! use shiguredo_http_proto::HttpResponse;
//!
//! let server = Server::bind("0.0.0.0:8080").await?;
//! server
//!     .serve(|req: &Request<'_>, res: &mut HttpResponse<TcpTransport>| {
//!         res.write_header("Content-Type", "text/plain");
//!         res.end(b"Hello, World!");
//!     })
//!     .await?;
//! ```

mod error;
mod server;
mod transport;

pub use error::{Error, Result};
pub use server::{Handler, MAX_REQUEST_LINE, Request, Server};
pub use transport::TcpTransport;
