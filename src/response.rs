//! HTTP/1.1 ストリーミングレスポンス
//!
//! ## 概要
//!
//! [`OutputSink`] の上で HTTP/1.1 のレスポンスを組み立てます。
//!
//! - ステータス行は最初の 1 回だけ有効 (未指定なら `200 OK`)
//! - `write` は chunked で送信し、`end` だけで終えた場合は Content-Length を付ける
//! - `try_end` は全体サイズを Content-Length として先に送り、最後の書き込みで終える
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::response::HttpResponse;
//! use shiguredo_http_proto::sink::MemoryTransport;
//!
//! let mut res = HttpResponse::new(MemoryTransport::new());
//! res.write_status("404 Not Found")
//!     .write_header("Content-Type", "text/plain");
//! res.end(b"missing");
//!
//! assert_eq!(
//!     res.transport().written(),
//!     b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\nmissing"
//! );
//! ```

use core::fmt;

use tracing::debug;

use crate::extensions::NegotiatedParams;
use crate::limits::WebSocketLimits;
use crate::sink::{OutputSink, SinkError, SinkState, Transport};
use crate::websocket::WebSocketStream;

/// デフォルトのステータス
pub const DEFAULT_STATUS: &str = "200 OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    /// ヘッダー書き込み中
    Headers,
    /// Transfer-Encoding: chunked
    Chunked,
    /// Content-Length 指定済み
    Fixed,
}

type WritableHandler<T> = Box<dyn FnMut(&mut HttpResponse<T>, u64) -> bool>;

/// HTTP/1.1 レスポンス
pub struct HttpResponse<T> {
    sink: OutputSink<T>,
    status_written: bool,
    body: BodyMode,
    close_connection: bool,
    write_offset: u64,
    on_writable: Option<WritableHandler<T>>,
}

impl<T: fmt::Debug> fmt::Debug for HttpResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("sink", &self.sink)
            .field("status_written", &self.status_written)
            .field("body", &self.body)
            .field("close_connection", &self.close_connection)
            .field("write_offset", &self.write_offset)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> HttpResponse<T> {
    /// レスポンスを作成
    pub fn new(transport: T) -> Self {
        Self {
            sink: OutputSink::new(transport),
            status_written: false,
            body: BodyMode::Headers,
            close_connection: false,
            write_offset: 0,
            on_writable: None,
        }
    }

    /// ステータス行を書き込む (例: `"404 Not Found"`)
    ///
    /// 2 回目以降の呼び出しは無視される。
    pub fn write_status(&mut self, status: &str) -> &mut Self {
        if self.status_written || self.body != BodyMode::Headers {
            return self;
        }
        let line = format!("HTTP/1.1 {}\r\n", status);
        if self.push_header_bytes(line.as_bytes()) {
            self.status_written = true;
        }
        self
    }

    /// ヘッダーを書き込む
    ///
    /// ステータス行が未送信なら `200 OK` を先に書き込む。
    /// ボディの送信開始後は無視される。
    pub fn write_header(&mut self, name: &str, value: &str) -> &mut Self {
        if self.body != BodyMode::Headers {
            debug!(name, "header written after body started");
            return self;
        }
        self.write_status(DEFAULT_STATUS);
        let line = format!("{}: {}\r\n", name, value);
        self.push_header_bytes(line.as_bytes());
        self
    }

    /// 数値のヘッダーを書き込む
    pub fn write_header_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.write_header(name, &value.to_string())
    }

    /// `100 Continue` を送信
    pub fn write_continue(&mut self) -> &mut Self {
        if !self.status_written && self.body == BodyMode::Headers {
            self.push_header_bytes(b"HTTP/1.1 100 Continue\r\n\r\n");
        }
        self
    }

    /// レスポンス後に接続を閉じる (`Connection: close`)
    pub fn close_connection(&mut self) -> &mut Self {
        self.close_connection = true;
        self
    }

    /// 接続を閉じる指定があるかどうか
    pub fn is_close_connection(&self) -> bool {
        self.close_connection
    }

    /// ボディを chunked で書き込む
    ///
    /// 空のデータはチャンクを送らない (終端チャンクと区別するため)。
    /// すべて送信できた場合に true を返す。
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.is_writable() {
            return false;
        }
        if self.body == BodyMode::Headers {
            self.finish_headers(BodyMode::Chunked, None);
        }
        self.write_body(data, false)
    }

    /// 最後のボディを書き込んでレスポンスを終える
    ///
    /// ボディを送信していなければ Content-Length を付ける。
    pub fn end(&mut self, data: &[u8]) -> bool {
        if !self.is_writable() {
            return false;
        }
        if self.body == BodyMode::Headers {
            self.finish_headers(BodyMode::Fixed, Some(data.len() as u64));
        }
        self.write_body(data, true)
    }

    /// ボディなしでレスポンスを終える
    ///
    /// HEAD レスポンス用に Content-Length の値だけを指定できる。
    pub fn end_without_body(&mut self, reported_content_length: Option<u64>) -> bool {
        if !self.is_writable() {
            return false;
        }
        if self.body == BodyMode::Headers {
            self.finish_headers(
                BodyMode::Fixed,
                Some(reported_content_length.unwrap_or(0)),
            );
        }
        self.write_body(&[], true)
    }

    /// 全体サイズが分かっているボディを、送信待ちを作らずに書き込む
    ///
    /// 最初の呼び出しで `total_size` を Content-Length として送信する。
    /// トランスポートが受け付けなかった残りは積まないため、呼び出し側は
    /// [`write_offset`](Self::write_offset) から続きを書き込み直す。
    /// 書き込み済みのバイト数が `total_size` に達したらレスポンスを終える。
    /// `(すべて書き込めたか, レスポンスを終えたか)` を返す。
    pub fn try_end(&mut self, data: &[u8], total_size: u64) -> (bool, bool) {
        if !self.is_writable() {
            return (false, self.has_responded());
        }
        match self.body {
            BodyMode::Headers => self.finish_headers(BodyMode::Fixed, Some(total_size)),
            BodyMode::Chunked => {
                // chunked では全体サイズを使わずにそのまま終える
                self.write_body(data, true);
                return (true, self.has_responded());
            }
            BodyMode::Fixed => {}
        }

        let written = self.sink.try_write(data);
        self.write_offset += written as u64;
        let ok = written == data.len() && self.sink.buffered_amount() == 0;
        if self.write_offset >= total_size {
            self.sink.end(&[]);
        }
        (ok, self.has_responded())
    }

    /// WebSocket にアップグレードする
    ///
    /// `accept` は `Sec-WebSocket-Key` から計算した `Sec-WebSocket-Accept` の値。
    /// 圧縮がネゴシエーションされていれば `Sec-WebSocket-Extensions` を付ける。
    pub fn upgrade(
        mut self,
        accept: &str,
        protocol: Option<&str>,
        negotiated: NegotiatedParams,
        limits: WebSocketLimits,
    ) -> Result<WebSocketStream<T>, SinkError> {
        if self.sink.state().is_terminal() {
            return Err(SinkError::Closed(self.sink.state()));
        }
        if self.body != BodyMode::Headers {
            return Err(SinkError::BodyStarted);
        }
        if self.status_written {
            return Err(SinkError::StatusWritten);
        }

        let mut head = String::from(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n",
        );
        head.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
        if let Some(protocol) = protocol {
            head.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
        }
        if negotiated.enabled {
            head.push_str(&format!(
                "Sec-WebSocket-Extensions: {}\r\n",
                negotiated.response
            ));
        }
        head.push_str("\r\n");
        self.sink.write_header(head.as_bytes())?;

        Ok(WebSocketStream::with_negotiated(self.sink, limits, negotiated))
    }

    /// 送信したボディのバイト数
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// レスポンスを終えたかどうか
    pub fn has_responded(&self) -> bool {
        self.sink.has_responded()
    }

    /// 切断されたかどうか
    pub fn is_aborted(&self) -> bool {
        self.sink.is_aborted()
    }

    /// 出力の状態
    pub fn state(&self) -> SinkState {
        self.sink.state()
    }

    /// 送信待ちのバイト数
    pub fn buffered_amount(&self) -> usize {
        self.sink.buffered_amount()
    }

    /// トランスポートを取得
    pub fn transport(&self) -> &T {
        self.sink.transport()
    }

    /// トランスポートを可変で取得
    pub fn transport_mut(&mut self) -> &mut T {
        self.sink.transport_mut()
    }

    /// 切断時のハンドラーを登録
    pub fn on_aborted<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce() + 'static,
    {
        self.sink.on_aborted(handler);
        self
    }

    /// 受信ボディのハンドラーを登録
    pub fn on_data<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&[u8], bool) + 'static,
    {
        self.sink.on_data(handler);
        self
    }

    /// 書き込み可能時のハンドラーを登録
    ///
    /// ハンドラーは送信済みのボディのバイト数を受け取り、書き込みに成功したかを返す。
    pub fn on_writable<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&mut HttpResponse<T>, u64) -> bool + 'static,
    {
        self.on_writable = Some(Box::new(handler));
        self
    }

    /// 受信ボディのハンドラーが登録されているかどうか
    pub fn has_data_handler(&self) -> bool {
        self.sink.has_data_handler()
    }

    /// 書き込み可能時のハンドラーが登録されているかどうか
    pub fn has_writable_handler(&self) -> bool {
        self.on_writable.is_some()
    }

    /// トランスポートが書き込み可能になった
    pub fn handle_writable(&mut self) -> bool {
        if !self.sink.flush() {
            return false;
        }
        if self.sink.state().is_terminal() {
            self.on_writable = None;
            return true;
        }
        let Some(mut handler) = self.on_writable.take() else {
            return true;
        };
        let offset = self.write_offset;
        let ok = handler(self, offset);
        if self.on_writable.is_none() && !self.sink.state().is_terminal() {
            self.on_writable = Some(handler);
        }
        ok && self.sink.buffered_amount() == 0
    }

    /// 切断された
    pub fn handle_aborted(&mut self) {
        self.on_writable = None;
        self.sink.handle_aborted();
    }

    /// 受信したボディを届ける
    pub fn handle_data(&mut self, chunk: &[u8], is_last: bool) {
        self.sink.handle_data(chunk, is_last);
    }

    fn is_writable(&self) -> bool {
        !self.sink.state().is_terminal() && !self.sink.has_responded()
    }

    fn push_header_bytes(&mut self, bytes: &[u8]) -> bool {
        match self.sink.write_header(bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "response header dropped");
                false
            }
        }
    }

    fn finish_headers(&mut self, mode: BodyMode, content_length: Option<u64>) {
        self.write_status(DEFAULT_STATUS);

        let mut head = String::new();
        if self.close_connection {
            head.push_str("Connection: close\r\n");
        }
        match (mode, content_length) {
            (BodyMode::Chunked, _) => head.push_str("Transfer-Encoding: chunked\r\n"),
            (_, Some(len)) => head.push_str(&format!("Content-Length: {}\r\n", len)),
            (_, None) => {}
        }
        head.push_str("\r\n");
        self.push_header_bytes(head.as_bytes());
        self.body = mode;
    }

    fn write_body(&mut self, data: &[u8], last: bool) -> bool {
        self.write_offset += data.len() as u64;
        match (self.body, last) {
            (BodyMode::Chunked, false) => {
                if data.is_empty() {
                    return self.sink.buffered_amount() == 0;
                }
                self.sink.write(&encode_chunk(data))
            }
            (BodyMode::Chunked, true) => {
                let mut buf = if data.is_empty() {
                    Vec::new()
                } else {
                    encode_chunk(data)
                };
                buf.extend_from_slice(b"0\r\n\r\n");
                self.sink.end(&buf)
            }
            (_, false) => self.sink.write(data),
            (_, true) => self.sink.end(data),
        }
    }
}

/// Chunked Transfer Encoding 用のチャンクをエンコード
///
/// 空のデータを渡すと終端チャンク (0\r\n\r\n) を生成します。
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 12);

    if data.is_empty() {
        // 終端チャンク
        buf.extend_from_slice(b"0\r\n\r\n");
    } else {
        // チャンクサイズ (16進数)
        buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\r\n");
    }

    buf
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::extensions::negotiate_compression;
    use crate::sink::MemoryTransport;
    use crate::websocket::{OpCode, SendStatus};

    fn written(res: &HttpResponse<MemoryTransport>) -> String {
        String::from_utf8_lossy(res.transport().written()).into_owned()
    }

    #[test]
    fn end_with_content_length() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        assert!(res.end(b"hello"));
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert!(res.has_responded());
        assert_eq!(res.write_offset(), 5);
        assert!(res.transport().is_shutdown());
    }

    #[test]
    fn status_first_call_wins() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write_status("201 Created").write_status("500 Internal Server Error");
        res.end(b"");
        assert_eq!(
            written(&res),
            "HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn header_implies_default_status() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write_header("X-A", "1");
        res.write_status("404 Not Found");
        res.end(b"");
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nX-A: 1\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn chunked_write() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write_header_u64("X-Count", 2);
        assert!(res.write(b"hello"));
        assert!(res.write(b""));
        assert!(res.write(b" world!!!!!!"));
        res.write_header("X-Late", "ignored");
        assert!(res.end(b""));
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nX-Count: 2\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\nc\r\n world!!!!!!\r\n0\r\n\r\n"
        );
        assert_eq!(res.write_offset(), 17);
    }

    #[test]
    fn chunked_end_with_data() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write(b"a");
        res.end(b"b");
        assert!(written(&res).ends_with("1\r\na\r\n1\r\nb\r\n0\r\n\r\n"));
    }

    #[test]
    fn close_connection_header() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.close_connection();
        res.end(b"x");
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 1\r\n\r\nx"
        );
        assert!(res.is_close_connection());
    }

    #[test]
    fn write_continue_before_status() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write_continue();
        res.end(b"");
        assert_eq!(
            written(&res),
            "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn end_without_body_reports_length() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        assert!(res.end_without_body(Some(1234)));
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n"
        );
        assert_eq!(res.state(), SinkState::Ended);
    }

    #[test]
    fn try_end_streams_fixed_length() {
        // ステータス行 17 バイト + "Content-Length: 20" 22 バイト + ボディ 10 バイト
        let mut res = HttpResponse::new(MemoryTransport::with_budget(49));
        let (ok, done) = res.try_end(b"0123456789", 20);
        assert!(ok);
        assert!(!done);
        assert_eq!(res.write_offset(), 10);

        let (ok, done) = res.try_end(b"abcdefghij", 20);
        assert!(!ok);
        assert!(!done);
        assert_eq!(res.write_offset(), 10);
        assert_eq!(res.buffered_amount(), 0);

        res.transport_mut().set_budget(None);
        assert!(res.handle_writable());
        let (ok, done) = res.try_end(b"abcdefghij", 20);
        assert!(ok);
        assert!(done);
        assert_eq!(res.state(), SinkState::Ended);
        assert_eq!(
            written(&res),
            "HTTP/1.1 200 OK\r\nContent-Length: 20\r\n\r\n0123456789abcdefghij"
        );

        assert_eq!(res.try_end(b"x", 20), (false, true));
    }

    #[test]
    fn writable_handler_resumes_body() {
        let body: Vec<u8> = (0..100u8).collect();
        // ヘッダー 40 バイト + ボディ 10 バイト
        let mut res = HttpResponse::new(MemoryTransport::with_budget(50));
        let total = body.len() as u64;
        let source = body.clone();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        res.on_writable(move |res, offset| {
            c.set(c.get() + 1);
            let (ok, _) = res.try_end(&source[offset as usize..], total);
            ok
        });

        let (ok, done) = res.try_end(&body, total);
        assert!(!ok);
        assert!(!done);
        assert_eq!(res.write_offset(), 10);

        res.transport_mut().add_budget(1000);
        assert!(res.handle_writable());
        assert_eq!(calls.get(), 1);
        assert_eq!(res.state(), SinkState::Ended);
        assert!(res.transport().written().ends_with(&body));

        assert!(res.handle_writable());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn try_end_after_chunked_write_ends_chunked() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write(b"a");
        assert_eq!(res.try_end(b"b", 100), (true, true));
        assert!(written(&res).ends_with("1\r\nb\r\n0\r\n\r\n"));
    }

    #[test]
    fn abort_makes_response_inert() {
        let aborted = Rc::new(Cell::new(0));
        let mut res = HttpResponse::new(MemoryTransport::new());
        let a = aborted.clone();
        res.on_aborted(move || a.set(a.get() + 1));
        res.write(b"x");
        res.handle_aborted();
        res.handle_aborted();
        assert_eq!(aborted.get(), 1);

        let before = res.transport().written().to_vec();
        assert!(!res.write(b"y"));
        assert!(!res.end(b"z"));
        assert_eq!(res.try_end(b"z", 1), (false, false));
        assert_eq!(res.transport().written(), before.as_slice());
        assert!(res.is_aborted());
    }

    #[test]
    fn upgrade_writes_handshake() {
        let negotiated = negotiate_compression(true, 15, 15, "permessage-deflate");
        let res = HttpResponse::new(MemoryTransport::new());
        let mut ws = res
            .upgrade(
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
                Some("chat"),
                negotiated,
                WebSocketLimits::default(),
            )
            .unwrap();
        assert_eq!(ws.send(b"hi", OpCode::Text, false), SendStatus::Success);

        let mut expected = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
            Sec-WebSocket-Protocol: chat\r\n\
            Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n"
            .to_vec();
        expected.extend_from_slice(b"\x81\x02hi");
        assert_eq!(ws.transport().written(), expected.as_slice());
    }

    #[test]
    fn upgrade_after_status_fails() {
        let mut res = HttpResponse::new(MemoryTransport::new());
        res.write_status("200 OK");
        let err = res
            .upgrade("x", None, NegotiatedParams::disabled(), WebSocketLimits::default())
            .unwrap_err();
        assert_eq!(err, SinkError::StatusWritten);
    }

    #[test]
    fn chunk_encoding() {
        assert_eq!(encode_chunk(b""), b"0\r\n\r\n");
        assert_eq!(encode_chunk(&[0u8; 255])[..4], *b"ff\r\n");
    }
}
