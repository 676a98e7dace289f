//! 送信バッファとバックプレッシャー管理 (Sans I/O)
//!
//! ## 概要
//!
//! HTTP レスポンス、WebSocket、HTTP/3 ストリームが共有する出力側の状態機械です。
//!
//! - 書き込みはブロックせず、トランスポートが受け付けなかった分を送信待ちバッファに積む
//! - トランスポートが書き込み可能になったら [`OutputSink::handle_writable`] で送信待ちを流す
//! - 切断は [`OutputSink::handle_aborted`] で 1 回だけ通知される
//!
//! 常に `total_flushed + buffered_amount == total_enqueued` が成り立つ。
//!
//! ## 状態遷移
//!
//! ```text
//! Idle → HeaderWritten → Streaming ⇄ Draining → Ended
//!          (すべての非終端状態から) → Aborted
//! ```
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::sink::{MemoryTransport, OutputSink, SinkState};
//!
//! let mut sink = OutputSink::new(MemoryTransport::with_budget(4));
//! assert!(!sink.write(b"hello"));
//! assert_eq!(sink.buffered_amount(), 1);
//!
//! sink.transport_mut().add_budget(16);
//! assert!(sink.handle_writable());
//! sink.end(b"");
//! assert_eq!(sink.state(), SinkState::Ended);
//! assert_eq!(sink.transport().written(), b"hello");
//! ```

use core::fmt;

use tracing::{debug, trace};

/// 出力先のトランスポート
///
/// 実装はノンブロッキングで、受け付けたバイト数を返す。
pub trait Transport {
    /// `data` の先頭から書き込めるだけ書き込み、書き込んだバイト数を返す
    fn write(&mut self, data: &[u8]) -> usize;

    /// この出力の送信終了を通知する
    fn shutdown(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> usize {
        (**self).write(data)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// メモリ上のトランスポート
///
/// 書き込み可能なバイト数 (予算) を指定でき、バックプレッシャーを再現できる。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTransport {
    written: Vec<u8>,
    budget: Option<usize>,
    shutdown: bool,
}

impl MemoryTransport {
    /// 無制限に書き込めるトランスポートを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 書き込み可能なバイト数を指定して作成
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    /// 書き込み可能なバイト数を増やす
    pub fn add_budget(&mut self, n: usize) {
        if let Some(budget) = &mut self.budget {
            *budget = budget.saturating_add(n);
        }
    }

    /// 書き込み可能なバイト数を設定 (`None` は無制限)
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// 書き込まれたバイト列を取得
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// 書き込まれたバイト列を取り出す
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    /// シャットダウンされたかどうか
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: &[u8]) -> usize {
        if self.shutdown {
            return 0;
        }
        let n = match &mut self.budget {
            Some(budget) => {
                let n = data.len().min(*budget);
                *budget -= n;
                n
            }
            None => data.len(),
        };
        self.written.extend_from_slice(&data[..n]);
        n
    }

    fn shutdown(&mut self) {
        self.shutdown = true;
    }
}

/// 出力の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// 何も書き込んでいない
    Idle,
    /// ヘッダーを書き込んだ
    HeaderWritten,
    /// ボディを送信中で送信待ちなし
    Streaming,
    /// 送信待ちあり
    Draining,
    /// 送信完了 (終端)
    Ended,
    /// 切断された (終端)
    Aborted,
}

impl SinkState {
    /// 終端状態かどうか
    pub fn is_terminal(self) -> bool {
        matches!(self, SinkState::Ended | SinkState::Aborted)
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SinkState::Idle => "idle",
            SinkState::HeaderWritten => "header-written",
            SinkState::Streaming => "streaming",
            SinkState::Draining => "draining",
            SinkState::Ended => "ended",
            SinkState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// 出力エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// ボディの送信を開始した後にヘッダーを書き込もうとした
    BodyStarted,
    /// ステータス行を既に書き込んだ
    StatusWritten,
    /// 終端状態で書き込もうとした
    Closed(SinkState),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::BodyStarted => write!(f, "header written after body started"),
            SinkError::StatusWritten => write!(f, "status line already written"),
            SinkError::Closed(state) => write!(f, "output already {}", state),
        }
    }
}

impl std::error::Error for SinkError {}

type AbortedHandler = Box<dyn FnOnce()>;
type DataHandler = Box<dyn FnMut(&[u8], bool)>;
type WritableHandler<T> = Box<dyn FnMut(&mut OutputSink<T>, u64) -> bool>;

/// 送信バッファ付きの出力
pub struct OutputSink<T> {
    transport: T,
    state: SinkState,
    pending: Vec<u8>,
    total_enqueued: u64,
    total_flushed: u64,
    end_requested: bool,
    data_finished: bool,
    on_aborted: Option<AbortedHandler>,
    on_data: Option<DataHandler>,
    on_writable: Option<WritableHandler<T>>,
}

impl<T: fmt::Debug> fmt::Debug for OutputSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("buffered_amount", &self.pending.len())
            .field("total_enqueued", &self.total_enqueued)
            .field("total_flushed", &self.total_flushed)
            .field("end_requested", &self.end_requested)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> OutputSink<T> {
    /// 出力を作成
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: SinkState::Idle,
            pending: Vec::new(),
            total_enqueued: 0,
            total_flushed: 0,
            end_requested: false,
            data_finished: false,
            on_aborted: None,
            on_data: None,
            on_writable: None,
        }
    }

    /// 現在の状態を取得
    pub fn state(&self) -> SinkState {
        self.state
    }

    /// トランスポートを取得
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// トランスポートを可変で取得
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// トランスポートを取り出す
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// 送信待ちのバイト数
    pub fn buffered_amount(&self) -> usize {
        self.pending.len()
    }

    /// これまでに積まれたバイト数
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    /// これまでにトランスポートが受け付けたバイト数
    pub fn total_flushed(&self) -> u64 {
        self.total_flushed
    }

    /// `end` が呼ばれたかどうか
    pub fn has_responded(&self) -> bool {
        self.end_requested || self.state == SinkState::Ended
    }

    /// 切断されたかどうか
    pub fn is_aborted(&self) -> bool {
        self.state == SinkState::Aborted
    }

    /// 送信が完了したかどうか
    pub fn is_ended(&self) -> bool {
        self.state == SinkState::Ended
    }

    /// ヘッダーのバイト列を書き込む
    ///
    /// ボディの送信を開始する前に限り書き込める。
    pub fn write_header(&mut self, data: &[u8]) -> Result<(), SinkError> {
        match self.state {
            SinkState::Idle | SinkState::HeaderWritten => {}
            SinkState::Ended | SinkState::Aborted => return Err(SinkError::Closed(self.state)),
            SinkState::Streaming | SinkState::Draining => return Err(SinkError::BodyStarted),
        }
        self.enqueue(data);
        // ヘッダーが送信待ちになってもボディ開始前はヘッダー書き込み中として扱う
        self.state = SinkState::HeaderWritten;
        Ok(())
    }

    /// ボディを書き込む
    ///
    /// 今回のデータをすべてトランスポートに渡せた場合に true を返す。
    /// 終端状態または `end` の後は何もせず false を返す。
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.state.is_terminal() || self.end_requested {
            trace!(state = %self.state, "write ignored");
            return false;
        }
        let drained = self.enqueue(data);
        self.update_body_state();
        drained
    }

    /// 送信待ちを作らずに、トランスポートが今受け付ける分だけ書き込む
    ///
    /// 書き込んだバイト数を返す。受け付けられなかった残りは積まない。
    pub fn try_write(&mut self, data: &[u8]) -> usize {
        if self.state.is_terminal() || self.end_requested {
            return 0;
        }
        let n = if self.pending.is_empty() {
            accepted(&mut self.transport, data)
        } else {
            0
        };
        self.total_enqueued += n as u64;
        self.total_flushed += n as u64;
        self.update_body_state();
        n
    }

    /// 最後のボディを書き込んで送信を終える
    ///
    /// 送信待ちがなくなった時点でトランスポートをシャットダウンする。
    /// すべて送信できた場合に true を返す。
    pub fn end(&mut self, data: &[u8]) -> bool {
        if self.state.is_terminal() || self.end_requested {
            trace!(state = %self.state, "end ignored");
            return false;
        }
        self.enqueue(data);
        self.end_requested = true;
        if self.pending.is_empty() {
            self.finish();
            true
        } else {
            self.state = SinkState::Draining;
            false
        }
    }

    /// 送信待ちをトランスポートに流す
    ///
    /// 送信待ちがなくなった場合に true を返す。`end` 済みであればシャットダウンする。
    pub fn flush(&mut self) -> bool {
        if self.state.is_terminal() {
            return self.state == SinkState::Ended;
        }
        if !self.pending.is_empty() {
            let n = accepted(&mut self.transport, &self.pending);
            self.pending.drain(..n);
            self.total_flushed += n as u64;
            trace!(
                flushed = n,
                buffered = self.pending.len(),
                "flushed pending bytes"
            );
        }
        if !self.pending.is_empty() {
            return false;
        }
        if self.end_requested {
            self.finish();
        } else if self.state == SinkState::Draining {
            self.state = SinkState::Streaming;
        }
        true
    }

    /// トランスポートが書き込み可能になった
    ///
    /// 送信待ちを流し、なくなったら登録されたハンドラーを呼び出す。
    /// 送信待ちがなく、ハンドラーが成功を返した場合に true を返す。
    pub fn handle_writable(&mut self) -> bool {
        if !self.flush() {
            return false;
        }
        if self.state.is_terminal() {
            return true;
        }
        let Some(mut handler) = self.on_writable.take() else {
            return true;
        };
        let offset = self.total_enqueued;
        let ok = handler(self, offset);
        // ハンドラー内で差し替えられていなければ戻す
        if self.on_writable.is_none() && !self.state.is_terminal() {
            self.on_writable = Some(handler);
        }
        ok && self.pending.is_empty()
    }

    /// 切断された
    ///
    /// 非終端状態から 1 回だけ `Aborted` に遷移し、登録されたハンドラーを呼び出す。
    pub fn handle_aborted(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            state = %self.state,
            buffered = self.pending.len(),
            "output aborted"
        );
        self.state = SinkState::Aborted;
        self.on_writable = None;
        self.on_data = None;
        if let Some(handler) = self.on_aborted.take() {
            handler();
        }
    }

    /// 受信したボディを届ける
    ///
    /// `is_last` が true の呼び出しの後と切断後は何もしない。
    pub fn handle_data(&mut self, chunk: &[u8], is_last: bool) {
        if self.data_finished || self.state == SinkState::Aborted {
            return;
        }
        if let Some(handler) = &mut self.on_data {
            handler(chunk, is_last);
        }
        if is_last {
            self.data_finished = true;
            self.on_data = None;
        }
    }

    /// 切断時のハンドラーを登録
    pub fn on_aborted<F>(&mut self, handler: F)
    where
        F: FnOnce() + 'static,
    {
        self.on_aborted = Some(Box::new(handler));
    }

    /// 受信ボディのハンドラーを登録
    pub fn on_data<F>(&mut self, handler: F)
    where
        F: FnMut(&[u8], bool) + 'static,
    {
        self.on_data = Some(Box::new(handler));
    }

    /// 書き込み可能時のハンドラーを登録
    ///
    /// ハンドラーはそれまでに積まれたバイト数を受け取り、書き込みに成功したかを返す。
    pub fn on_writable<F>(&mut self, handler: F)
    where
        F: FnMut(&mut OutputSink<T>, u64) -> bool + 'static,
    {
        self.on_writable = Some(Box::new(handler));
    }

    /// 受信ボディのハンドラーが登録されているかどうか
    pub fn has_data_handler(&self) -> bool {
        self.on_data.is_some()
    }

    /// データを積み、送信待ちがなければ直接トランスポートに渡す
    ///
    /// 今回のデータをすべて渡せた場合に true を返す。
    fn enqueue(&mut self, data: &[u8]) -> bool {
        self.total_enqueued += data.len() as u64;
        if !self.pending.is_empty() {
            // 順序を保つため送信待ちの後ろに積む
            self.pending.extend_from_slice(data);
            return false;
        }

        let n = accepted(&mut self.transport, data);
        self.total_flushed += n as u64;
        if n < data.len() {
            self.pending.extend_from_slice(&data[n..]);
            trace!(
                accepted = n,
                buffered = self.pending.len(),
                "transport backpressure"
            );
            return false;
        }
        true
    }

    fn update_body_state(&mut self) {
        self.state = if self.pending.is_empty() {
            SinkState::Streaming
        } else {
            SinkState::Draining
        };
    }

    fn finish(&mut self) {
        self.transport.shutdown();
        self.state = SinkState::Ended;
        self.on_writable = None;
    }
}

/// トランスポートに書き込み、受け付けたバイト数を返す
///
/// 渡した長さを超える報告は渡した長さに切り詰める。
fn accepted<T: Transport>(transport: &mut T, data: &[u8]) -> usize {
    transport.write(data).min(data.len())
}
