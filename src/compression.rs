//! メッセージ圧縮器のインターフェース (Sans I/O)
//!
//! permessage-deflate (RFC 7692) で送信メッセージを圧縮するための外部圧縮器の契約です。
//! deflate アルゴリズム自体は実装せず、呼び出し側が [`Compressor`] の実装を差し込みます。
//!
//! 1 メッセージは [`compress_message`] で「入力をすべて渡す → 同期フラッシュ → 末尾
//! `00 00 ff ff` を取り除く」の順に処理されます。

use core::fmt;

/// 圧縮エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// 圧縮器が入力を受け付けなかった
    InvalidData(String),
    /// 圧縮器内部のエラー
    Internal(String),
    /// 入力も出力も進まない
    Stalled,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::InvalidData(msg) => write!(f, "compressor rejected input: {}", msg),
            CompressionError::Internal(msg) => write!(f, "compressor failure: {}", msg),
            CompressionError::Stalled => write!(f, "compressor made no progress"),
        }
    }
}

impl std::error::Error for CompressionError {}

/// 1 回の呼び出しで進んだ量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// 読み込んだ入力のバイト数
    pub consumed: usize,
    /// 出力に書き込んだバイト数
    pub produced: usize,
    /// 出力が足りずに止まった
    pub output_full: bool,
}

impl Progress {
    /// 出力に余裕を残して止まった
    pub fn done(consumed: usize, produced: usize) -> Self {
        Self {
            consumed,
            produced,
            output_full: false,
        }
    }

    /// 出力を使い切って止まった
    pub fn full(consumed: usize, produced: usize) -> Self {
        Self {
            consumed,
            produced,
            output_full: true,
        }
    }

    fn is_stuck(&self) -> bool {
        self.consumed == 0 && self.produced == 0
    }
}

/// 送信メッセージの圧縮器
///
/// 共有圧縮器 (ウィンドウ 0) の場合、呼び出し側はメッセージごとに `reset` する。
pub trait Compressor {
    /// `input` の先頭から圧縮して `output` に書き込む
    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<Progress, CompressionError>;

    /// メッセージ境界で同期フラッシュする
    ///
    /// `output_full` が false を返すまで繰り返し呼ばれる。
    fn sync_flush(&mut self, output: &mut [u8]) -> Result<Progress, CompressionError>;

    /// 文脈を破棄する
    fn reset(&mut self);
}

/// 作業バッファのサイズ
const CHUNK: usize = 4096;

/// 同期フラッシュの末尾 (RFC 7692 Section 7.2.1)
const SYNC_FLUSH_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// 1 メッセージ分を圧縮して `output` に追記する
pub fn compress_message<C: Compressor + ?Sized>(
    compressor: &mut C,
    input: &[u8],
    output: &mut Vec<u8>,
) -> Result<(), CompressionError> {
    let start = output.len();
    let mut chunk = [0u8; CHUNK];

    let mut offset = 0;
    while offset < input.len() {
        let progress = compressor.compress(&input[offset..], &mut chunk)?;
        if progress.is_stuck() {
            return Err(CompressionError::Stalled);
        }
        output.extend_from_slice(&chunk[..progress.produced]);
        offset += progress.consumed;
    }

    loop {
        let progress = compressor.sync_flush(&mut chunk)?;
        output.extend_from_slice(&chunk[..progress.produced]);
        if !progress.output_full {
            break;
        }
        if progress.produced == 0 {
            return Err(CompressionError::Stalled);
        }
    }

    if output[start..].ends_with(&SYNC_FLUSH_TAIL) {
        output.truncate(output.len() - SYNC_FLUSH_TAIL.len());
    }
    Ok(())
}

/// 入力をそのまま出力する圧縮器
///
/// 圧縮ライブラリを持たない構成やテストで使う。
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<Progress, CompressionError> {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        if n < input.len() {
            Ok(Progress::full(n, n))
        } else {
            Ok(Progress::done(n, n))
        }
    }

    fn sync_flush(&mut self, _output: &mut [u8]) -> Result<Progress, CompressionError> {
        Ok(Progress::default())
    }

    fn reset(&mut self) {}
}
