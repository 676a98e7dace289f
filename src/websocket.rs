//! WebSocket 送信ストリーム (RFC 6455)
//!
//! ## 概要
//!
//! アップグレード後の接続にサーバーフレームを書き込みます。
//!
//! - サーバーフレームはマスクしない
//! - ネゴシエーション済みの場合はメッセージを圧縮し RSV1 を立てる (RFC 7692)
//! - 送信待ちが上限を超えている間の送信は破棄する
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::limits::WebSocketLimits;
//! use shiguredo_http_proto::sink::{MemoryTransport, OutputSink};
//! use shiguredo_http_proto::websocket::{OpCode, SendStatus, WebSocketStream};
//!
//! let mut ws = WebSocketStream::new(
//!     OutputSink::new(MemoryTransport::new()),
//!     WebSocketLimits::default(),
//! );
//! assert_eq!(ws.send(b"hi", OpCode::Text, false), SendStatus::Success);
//! assert_eq!(ws.transport().written(), b"\x81\x02hi");
//! ```

use core::fmt;

use tracing::{debug, trace};

use crate::compression::{Compressor, compress_message};
use crate::extensions::NegotiatedParams;
use crate::limits::WebSocketLimits;
use crate::sink::{OutputSink, SinkState, Transport};

/// 制御フレームのペイロード上限
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// ステータスコードなしのクローズ (フレームには載せない)
pub const CLOSE_NO_STATUS: u16 = 1005;

/// オペコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// フレームヘッダーの値
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    /// 制御フレームかどうか
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// 送信結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// 送信待ちに積まれた
    Backpressure,
    /// すべてトランスポートに渡した
    Success,
    /// 破棄した
    Dropped,
}

/// フレームヘッダーをエンコード
pub fn encode_frame_header(
    buf: &mut Vec<u8>,
    opcode: OpCode,
    fin: bool,
    rsv1: bool,
    payload_len: usize,
) {
    let mut first = opcode.as_u8();
    if fin {
        first |= 0x80;
    }
    if rsv1 {
        first |= 0x40;
    }
    buf.push(first);

    if payload_len < 126 {
        buf.push(payload_len as u8);
    } else if let Ok(len) = u16::try_from(payload_len) {
        buf.push(126);
        buf.extend_from_slice(&len.to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }
}

/// フレームをエンコード
pub fn encode_frame(opcode: OpCode, fin: bool, rsv1: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 10);
    encode_frame_header(&mut buf, opcode, fin, rsv1, payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// WebSocket 送信ストリーム
pub struct WebSocketStream<T> {
    sink: OutputSink<T>,
    limits: WebSocketLimits,
    negotiated: NegotiatedParams,
    compressor: Option<Box<dyn Compressor>>,
    closed: bool,
}

impl<T: fmt::Debug> fmt::Debug for WebSocketStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketStream")
            .field("sink", &self.sink)
            .field("limits", &self.limits)
            .field("negotiated", &self.negotiated)
            .field("compressor", &self.compressor.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T: Transport> WebSocketStream<T> {
    /// 圧縮なしのストリームを作成
    pub fn new(sink: OutputSink<T>, limits: WebSocketLimits) -> Self {
        Self::with_negotiated(sink, limits, NegotiatedParams::disabled())
    }

    /// ネゴシエーション結果を指定して作成
    pub fn with_negotiated(
        sink: OutputSink<T>,
        limits: WebSocketLimits,
        negotiated: NegotiatedParams,
    ) -> Self {
        Self {
            sink,
            limits,
            negotiated,
            compressor: None,
            closed: false,
        }
    }

    /// 圧縮器を設定
    ///
    /// ネゴシエーションで圧縮が有効になった場合のみ使われる。
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// ネゴシエーション結果を取得
    pub fn negotiated(&self) -> &NegotiatedParams {
        &self.negotiated
    }

    /// 出力を取得
    pub fn sink(&self) -> &OutputSink<T> {
        &self.sink
    }

    /// 出力を可変で取得
    pub fn sink_mut(&mut self) -> &mut OutputSink<T> {
        &mut self.sink
    }

    /// トランスポートを取得
    pub fn transport(&self) -> &T {
        self.sink.transport()
    }

    /// トランスポートを可変で取得
    pub fn transport_mut(&mut self) -> &mut T {
        self.sink.transport_mut()
    }

    /// 送信待ちのバイト数
    pub fn buffered_amount(&self) -> usize {
        self.sink.buffered_amount()
    }

    /// クローズ済みかどうか
    pub fn is_closed(&self) -> bool {
        self.closed || self.sink.state().is_terminal()
    }

    /// メッセージを送信
    ///
    /// `compress` が true でも、圧縮がネゴシエーションされていない場合や
    /// 制御フレームは圧縮しない。
    pub fn send(&mut self, message: &[u8], opcode: OpCode, compress: bool) -> SendStatus {
        if self.is_closed() {
            return SendStatus::Dropped;
        }
        if opcode.is_control() && message.len() > MAX_CONTROL_PAYLOAD {
            debug!(len = message.len(), "control frame payload too large");
            return SendStatus::Dropped;
        }
        if self.sink.buffered_amount() > self.limits.max_backpressure {
            debug!(
                buffered = self.sink.buffered_amount(),
                limit = self.limits.max_backpressure,
                "backpressure limit exceeded, message dropped"
            );
            if self.limits.close_on_backpressure_limit {
                self.closed = true;
                self.sink.end(&[]);
            }
            return SendStatus::Dropped;
        }

        let frame = match self.compressed_payload(message, opcode, compress) {
            Some(payload) => encode_frame(opcode, true, true, &payload),
            None => encode_frame(opcode, true, false, message),
        };

        if self.sink.write(&frame) {
            SendStatus::Success
        } else {
            trace!(buffered = self.sink.buffered_amount(), "websocket backpressure");
            SendStatus::Backpressure
        }
    }

    /// ping を送信
    pub fn ping(&mut self, payload: &[u8]) -> SendStatus {
        self.send(payload, OpCode::Ping, false)
    }

    /// pong を送信
    pub fn pong(&mut self, payload: &[u8]) -> SendStatus {
        self.send(payload, OpCode::Pong, false)
    }

    /// クローズフレームを送信して出力を終える
    ///
    /// `code` が [`CLOSE_NO_STATUS`] の場合はペイロードなしで送信する。
    /// 理由は制御フレームに収まるよう切り詰める。
    pub fn close(&mut self, code: u16, reason: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.closed = true;

        let mut payload = Vec::new();
        if code != CLOSE_NO_STATUS {
            payload.extend_from_slice(&code.to_be_bytes());
            let n = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
            payload.extend_from_slice(&reason[..n]);
        }
        self.sink.end(&encode_frame(OpCode::Close, true, false, &payload))
    }

    /// トランスポートが書き込み可能になった
    pub fn handle_writable(&mut self) -> bool {
        self.sink.handle_writable()
    }

    /// 切断された
    pub fn handle_aborted(&mut self) {
        self.sink.handle_aborted();
    }

    /// 出力の状態
    pub fn state(&self) -> SinkState {
        self.sink.state()
    }

    fn compressed_payload(
        &mut self,
        message: &[u8],
        opcode: OpCode,
        compress: bool,
    ) -> Option<Vec<u8>> {
        if !compress || opcode.is_control() || !self.negotiated.enabled {
            return None;
        }
        let compressor = self.compressor.as_mut()?;

        // 共有圧縮器はメッセージ間で文脈を持ち越さない
        if self.negotiated.compression_window_bits == 0 {
            compressor.reset();
        }

        let mut payload = Vec::with_capacity(message.len());
        match compress_message(compressor.as_mut(), message, &mut payload) {
            Ok(()) => Some(payload),
            Err(e) => {
                debug!(error = %e, "compression failed, sending uncompressed");
                compressor.reset();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionError, Progress};
    use crate::extensions::negotiate_compression;
    use crate::sink::MemoryTransport;

    fn stream(budget: Option<usize>, limits: WebSocketLimits) -> WebSocketStream<MemoryTransport> {
        let transport = match budget {
            Some(n) => MemoryTransport::with_budget(n),
            None => MemoryTransport::new(),
        };
        WebSocketStream::new(OutputSink::new(transport), limits)
    }

    /// 入力を反転して同期フラッシュの末尾を付ける圧縮器
    struct ReverseCompressor;

    impl Compressor for ReverseCompressor {
        fn compress(
            &mut self,
            input: &[u8],
            output: &mut [u8],
        ) -> Result<Progress, CompressionError> {
            let n = input.len().min(output.len());
            for (o, i) in output.iter_mut().zip(input[..n].iter().rev()) {
                *o = *i;
            }
            Ok(Progress::done(n, n))
        }

        fn sync_flush(&mut self, output: &mut [u8]) -> Result<Progress, CompressionError> {
            output[..4].copy_from_slice(&[0x00, 0x00, 0xff, 0xff]);
            Ok(Progress::done(0, 4))
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn frame_header_lengths() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, OpCode::Binary, true, false, 125);
        assert_eq!(buf, [0x82, 125]);

        let mut buf = Vec::new();
        encode_frame_header(&mut buf, OpCode::Binary, true, false, 126);
        assert_eq!(buf, [0x82, 126, 0x00, 126]);

        let mut buf = Vec::new();
        encode_frame_header(&mut buf, OpCode::Text, false, true, 65536);
        assert_eq!(buf, [0x41, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn send_text() {
        let mut ws = stream(None, WebSocketLimits::default());
        assert_eq!(ws.send(b"hello", OpCode::Text, true), SendStatus::Success);
        assert_eq!(ws.transport().written(), b"\x81\x05hello");
    }

    #[test]
    fn send_backpressure_then_dropped() {
        let limits = WebSocketLimits {
            max_backpressure: 4,
            close_on_backpressure_limit: false,
        };
        let mut ws = stream(Some(2), limits);
        assert_eq!(ws.send(b"abcdef", OpCode::Binary, false), SendStatus::Backpressure);
        assert_eq!(ws.buffered_amount(), 6);
        assert_eq!(ws.send(b"x", OpCode::Binary, false), SendStatus::Dropped);
        assert!(!ws.is_closed());

        ws.transport_mut().set_budget(None);
        assert!(ws.handle_writable());
        assert_eq!(ws.send(b"x", OpCode::Binary, false), SendStatus::Success);
    }

    #[test]
    fn close_on_backpressure_limit() {
        let limits = WebSocketLimits {
            max_backpressure: 0,
            close_on_backpressure_limit: true,
        };
        let mut ws = stream(Some(0), limits);
        assert_eq!(ws.send(b"a", OpCode::Binary, false), SendStatus::Backpressure);
        assert_eq!(ws.send(b"b", OpCode::Binary, false), SendStatus::Dropped);
        assert!(ws.is_closed());
        assert_eq!(ws.send(b"c", OpCode::Binary, false), SendStatus::Dropped);
    }

    #[test]
    fn control_frame_limit() {
        let mut ws = stream(None, WebSocketLimits::default());
        assert_eq!(ws.ping(&[0u8; 126]), SendStatus::Dropped);
        assert_eq!(ws.pong(b"p"), SendStatus::Success);
        assert_eq!(ws.transport().written(), b"\x8a\x01p");
    }

    #[test]
    fn close_frame() {
        let mut ws = stream(None, WebSocketLimits::default());
        assert!(ws.close(1000, b"bye"));
        assert_eq!(ws.transport().written(), b"\x88\x05\x03\xe8bye");
        assert!(ws.transport().is_shutdown());
        assert_eq!(ws.state(), SinkState::Ended);
        assert_eq!(ws.send(b"x", OpCode::Text, false), SendStatus::Dropped);
        assert!(!ws.close(1000, b""));
    }

    #[test]
    fn close_without_status() {
        let mut ws = stream(None, WebSocketLimits::default());
        ws.close(CLOSE_NO_STATUS, b"ignored");
        assert_eq!(ws.transport().written(), b"\x88\x00");
    }

    #[test]
    fn close_reason_truncated() {
        let mut ws = stream(None, WebSocketLimits::default());
        ws.close(1001, &[b'r'; 200]);
        let written = ws.transport().written();
        assert_eq!(written[1] as usize, MAX_CONTROL_PAYLOAD);
        assert_eq!(written.len(), 2 + MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn compressed_message_sets_rsv1() {
        let negotiated = negotiate_compression(true, 0, 0, "permessage-deflate");
        assert!(negotiated.enabled);
        let mut ws = WebSocketStream::with_negotiated(
            OutputSink::new(MemoryTransport::new()),
            WebSocketLimits::default(),
            negotiated,
        )
        .with_compressor(Box::new(ReverseCompressor));

        assert_eq!(ws.send(b"abc", OpCode::Text, true), SendStatus::Success);
        assert_eq!(ws.send(b"abc", OpCode::Text, false), SendStatus::Success);
        assert_eq!(ws.ping(b"p"), SendStatus::Success);
        assert_eq!(
            ws.transport().written(),
            b"\xc1\x03cba\x81\x03abc\x89\x01p"
        );
    }

    #[test]
    fn compression_not_negotiated() {
        let mut ws = stream(None, WebSocketLimits::default())
            .with_compressor(Box::new(ReverseCompressor));
        ws.send(b"abc", OpCode::Binary, true);
        assert_eq!(ws.transport().written(), b"\x82\x03abc");
    }

    #[test]
    fn abort_drops_sends() {
        let mut ws = stream(None, WebSocketLimits::default());
        ws.handle_aborted();
        assert_eq!(ws.send(b"x", OpCode::Text, false), SendStatus::Dropped);
        assert!(!ws.close(1000, b""));
        assert!(ws.transport().written().is_empty());
    }
}
