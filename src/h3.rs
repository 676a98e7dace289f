//! HTTP/3 レスポンスストリーム (RFC 9114)
//!
//! QUIC ストリーム上に HEADERS / DATA フレームを書き込みます。
//! ヘッダーブロックの QPACK エンコードは呼び出し側の責任で、エンコード済みのバイト列を受け取ります。
//! `end` でストリームを FIN で閉じます (トランスポートのシャットダウン)。

use tracing::debug;

use crate::sink::{OutputSink, SinkError, SinkState, Transport};

/// DATA フレーム
pub const FRAME_DATA: u64 = 0x00;
/// HEADERS フレーム
pub const FRAME_HEADERS: u64 = 0x01;

/// 可変長整数の最大値 (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// QUIC 可変長整数をエンコード (RFC 9000 Section 16)
///
/// 値が [`MAX_VARINT`] を超える場合は何も書き込まず false を返す。
pub fn encode_varint(buf: &mut Vec<u8>, value: u64) -> bool {
    if value > MAX_VARINT {
        return false;
    }
    if value < (1 << 6) {
        buf.push(value as u8);
    } else if value < (1 << 14) {
        buf.extend_from_slice(&(value as u16 | 0x4000).to_be_bytes());
    } else if value < (1 << 30) {
        buf.extend_from_slice(&(value as u32 | 0x8000_0000).to_be_bytes());
    } else {
        buf.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes());
    }
    true
}

/// QUIC 可変長整数をデコード
///
/// `(値, 消費バイト数)` を返す。入力が足りない場合は `None`。
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    let bytes = buf.get(..len)?;
    let value = bytes[1..]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, b| (acc << 8) | u64::from(*b));
    Some((value, len))
}

/// フレームヘッダー (種別 + 長さ) をエンコード
///
/// 種別は定数、長さはメモリ上のバッファ長なので、どちらも [`MAX_VARINT`] 以下になる。
pub fn encode_frame_header(buf: &mut Vec<u8>, frame_type: u64, payload_len: usize) {
    let encoded = encode_varint(buf, frame_type) && encode_varint(buf, payload_len as u64);
    debug_assert!(encoded, "frame header exceeds varint range");
}

/// HTTP/3 レスポンスストリーム
#[derive(Debug)]
pub struct Http3Stream<T> {
    sink: OutputSink<T>,
    headers_sent: bool,
    write_offset: u64,
}

impl<T: Transport> Http3Stream<T> {
    /// ストリームを作成
    pub fn new(transport: T) -> Self {
        Self {
            sink: OutputSink::new(transport),
            headers_sent: false,
            write_offset: 0,
        }
    }

    /// QPACK エンコード済みのヘッダーブロックを HEADERS フレームで送信
    ///
    /// DATA フレームの後に送るヘッダーはトレーラーとして扱われる。
    pub fn write_headers(&mut self, encoded: &[u8]) -> Result<bool, SinkError> {
        let mut frame = Vec::with_capacity(encoded.len() + 9);
        encode_frame_header(&mut frame, FRAME_HEADERS, encoded.len());
        frame.extend_from_slice(encoded);

        if self.headers_sent {
            // トレーラー
            if self.sink.state().is_terminal() || self.sink.has_responded() {
                return Err(SinkError::Closed(self.sink.state()));
            }
            return Ok(self.sink.write(&frame));
        }
        self.sink.write_header(&frame)?;
        self.headers_sent = true;
        Ok(self.sink.buffered_amount() == 0)
    }

    /// ボディを DATA フレームで送信
    ///
    /// 空のデータはフレームを送らない。
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.check_headers() {
            return false;
        }
        if data.is_empty() {
            return self.sink.buffered_amount() == 0;
        }
        self.write_offset += data.len() as u64;
        self.sink.write(&data_frame(data))
    }

    /// 最後のボディを送信してストリームを閉じる
    pub fn end(&mut self, data: &[u8]) -> bool {
        if !self.check_headers() {
            return false;
        }
        self.write_offset += data.len() as u64;
        if data.is_empty() {
            self.sink.end(&[])
        } else {
            self.sink.end(&data_frame(data))
        }
    }

    /// 送信したボディのバイト数
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// `end` が呼ばれたかどうか
    pub fn has_responded(&self) -> bool {
        self.sink.has_responded()
    }

    /// 出力の状態
    pub fn state(&self) -> SinkState {
        self.sink.state()
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

    /// トランスポートが書き込み可能になった
    pub fn handle_writable(&mut self) -> bool {
        self.sink.handle_writable()
    }

    /// ストリームがリセットされた
    pub fn handle_aborted(&mut self) {
        self.sink.handle_aborted();
    }

    /// 受信したボディを届ける
    pub fn handle_data(&mut self, chunk: &[u8], is_last: bool) {
        self.sink.handle_data(chunk, is_last);
    }

    fn check_headers(&self) -> bool {
        if !self.headers_sent && !self.sink.state().is_terminal() {
            debug!("http/3 body written before headers");
            return false;
        }
        true
    }
}

fn data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 9);
    encode_frame_header(&mut frame, FRAME_DATA, data.len());
    frame.extend_from_slice(data);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryTransport;

    #[test]
    fn varint_encoding() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (37, &[0x25]),
            (15293, &[0x7b, 0xbd]),
            (494878333, &[0x9d, 0x7f, 0x3e, 0x7d]),
            (
                151288809941952652,
                &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
            ),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            assert!(encode_varint(&mut buf, value));
            assert_eq!(buf, expected, "value {}", value);
            assert_eq!(decode_varint(&buf), Some((value, expected.len())));
        }
    }

    #[test]
    fn varint_too_large() {
        let mut buf = Vec::new();
        assert!(!encode_varint(&mut buf, MAX_VARINT + 1));
        assert!(buf.is_empty());
        assert_eq!(decode_varint(&[]), None);
        assert_eq!(decode_varint(&[0x40]), None);
    }

    #[test]
    fn frame_header_lengths() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, FRAME_DATA, 16384);
        assert_eq!(buf, [0x00, 0x80, 0x00, 0x40, 0x00]);

        buf.clear();
        encode_frame_header(&mut buf, FRAME_HEADERS, 63);
        assert_eq!(buf, [0x01, 0x3f]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "frame header exceeds varint range")]
    fn frame_type_out_of_range() {
        encode_frame_header(&mut Vec::new(), MAX_VARINT + 1, 0);
    }

    #[test]
    fn headers_then_data() {
        let mut stream = Http3Stream::new(MemoryTransport::new());
        assert_eq!(stream.write_headers(b"\x00\x00\xd9"), Ok(true));
        assert!(stream.write(b"hello"));
        assert!(stream.write(b""));
        assert!(stream.end(b"!"));
        assert_eq!(
            stream.transport().written(),
            b"\x01\x03\x00\x00\xd9\x00\x05hello\x00\x01!"
        );
        assert!(stream.transport().is_shutdown());
        assert_eq!(stream.write_offset(), 6);
        assert_eq!(stream.state(), SinkState::Ended);
    }

    #[test]
    fn body_before_headers_is_rejected() {
        let mut stream = Http3Stream::new(MemoryTransport::new());
        assert!(!stream.write(b"x"));
        assert!(!stream.end(b"x"));
        assert!(stream.transport().written().is_empty());
        assert_eq!(stream.state(), SinkState::Idle);
    }

    #[test]
    fn trailers() {
        let mut stream = Http3Stream::new(MemoryTransport::new());
        stream.write_headers(b"h").unwrap();
        stream.write(b"d");
        assert_eq!(stream.write_headers(b"t"), Ok(true));
        stream.end(b"");
        assert_eq!(stream.transport().written(), b"\x01\x01h\x00\x01d\x01\x01t");
        assert_eq!(
            stream.write_headers(b"t"),
            Err(SinkError::Closed(SinkState::Ended))
        );
    }

    #[test]
    fn large_data_frame_length() {
        let mut stream = Http3Stream::new(MemoryTransport::new());
        stream.write_headers(b"").unwrap();
        let data = vec![1u8; 100];
        stream.end(&data);
        let written = stream.transport().written();
        // HEADERS (2 バイト) の後に DATA: 種別 0x00、長さ 100 は 2 バイト
        assert_eq!(&written[2..5], &[0x00, 0x40, 0x64]);
        assert_eq!(written.len(), 5 + 100);
    }

    #[test]
    fn abort_stops_stream() {
        let mut stream = Http3Stream::new(MemoryTransport::with_budget(0));
        stream.write_headers(b"h").unwrap();
        stream.handle_aborted();
        assert!(!stream.write(b"x"));
        assert!(!stream.end(b""));
        assert!(!stream.transport().is_shutdown());
    }
}
