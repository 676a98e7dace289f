//! TCP トランスポート
//!
//! [`Transport`] を tokio の [`TcpStream`] に接続します。
//! 書き込みは `try_write` によるノンブロッキングで、受け付けられなかった分は
//! 呼び出し側の [`OutputSink`](shiguredo_http_proto::OutputSink) が積んでおきます。

use std::io;
use std::net::Shutdown;
use std::rc::Rc;

use shiguredo_http_proto::Transport;
use tokio::net::TcpStream;
use tracing::debug;

/// TCP ストリーム上のトランスポート
///
/// 読み込み側と同じ [`TcpStream`] を共有する。
#[derive(Debug, Clone)]
pub struct TcpTransport {
    stream: Rc<TcpStream>,
    error: Option<io::ErrorKind>,
    finished: bool,
}

impl TcpTransport {
    /// トランスポートを作成
    pub fn new(stream: Rc<TcpStream>) -> Self {
        Self {
            stream,
            error: None,
            finished: false,
        }
    }

    /// 書き込みで発生したエラーを取得
    pub fn error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    /// レスポンスの送信が完了したかどうか
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// ソケットの書き込み側を閉じる
    pub fn close_write(&self) -> io::Result<()> {
        socket2::SockRef::from(self.stream.as_ref()).shutdown(Shutdown::Write)
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8]) -> usize {
        if self.error.is_some() || data.is_empty() {
            return 0;
        }
        match self.stream.try_write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                debug!(error = %e, "tcp write failed");
                self.error = Some(e.kind());
                0
            }
        }
    }

    // 接続は keep-alive で再利用するため、ここではソケットを閉じない
    fn shutdown(&mut self) {
        self.finished = true;
    }
}
