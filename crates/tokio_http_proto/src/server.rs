//! HTTP サーバー
//!
//! tokio を使用した非同期 HTTP/1.1 サーバー。
//!
//! 接続ごとのタスクは [`LocalSet`] 上で動き、ハンドラーは
//! [`HttpResponse`] に直接書き込みます。書き込めなかった分はレスポンス側に積まれ、
//! ソケットが書き込み可能になるたびに流されます。
//!
//! ## 使い方
//!
//! ```ignore
//! use tokio_http_proto::{Request, Server};
//! use shiguredo_http_proto::HttpResponse;
//!
//! let server = Server::bind("0.0.0.0:8080").await?;
//! server
//!     .serve(|req: &Request<'_>, res: &mut HttpResponse<_>| {
//!         res.write_header("Content-Type", "text/plain");
//!         res.end(req.path().as_bytes());
//!     })
//!     .await?;
//! ```

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use memchr::memmem;
use shiguredo_http_proto::{
    HeaderBlockParser, HeaderError, HeaderSet, HttpResponse, ParserLimits, SinkState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::TcpTransport;

/// リクエスト行の最大長
pub const MAX_REQUEST_LINE: usize = 8192;

/// HTTP リクエストハンドラー
pub trait Handler: 'static {
    /// リクエストを処理してレスポンスを書き込む
    ///
    /// レスポンスを終えずに返す場合は `on_data` か `on_writable` で続きを書き込む。
    fn handle(&self, request: &Request<'_>, response: &mut HttpResponse<TcpTransport>);
}

impl<F> Handler for F
where
    F: Fn(&Request<'_>, &mut HttpResponse<TcpTransport>) + 'static,
{
    fn handle(&self, request: &Request<'_>, response: &mut HttpResponse<TcpTransport>) {
        (self)(request, response)
    }
}

/// 受信したリクエストヘッダー
///
/// 読み込みバッファを借用する。
#[derive(Debug)]
pub struct Request<'a> {
    method: &'a str,
    target: &'a str,
    minor_version: u8,
    headers: HeaderSet<'a>,
}

impl<'a> Request<'a> {
    /// メソッド
    pub fn method(&self) -> &'a str {
        self.method
    }

    /// リクエストターゲット
    pub fn target(&self) -> &'a str {
        self.target
    }

    /// クエリを除いたパス
    pub fn path(&self) -> &'a str {
        self.target
            .split_once('?')
            .map_or(self.target, |(path, _)| path)
    }

    /// クエリ文字列
    pub fn query(&self) -> Option<&'a str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// HTTP/1.x のマイナーバージョン
    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    /// ヘッダー
    pub fn headers(&self) -> &HeaderSet<'a> {
        &self.headers
    }

    /// ヘッダー値を取得 (大文字小文字を区別しない)
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get_str(name)
    }

    /// Content-Length
    ///
    /// 値が数値でない場合は [`Error::InvalidContentLength`] を返す。
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.headers.get_str("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidContentLength),
            None => Ok(None),
        }
    }

    /// 接続を維持するかどうか
    pub fn is_keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers
                .get_all("connection")
                .iter()
                .filter_map(|v| std::str::from_utf8(v).ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        if has_token("close") {
            return false;
        }
        self.minor_version >= 1 || has_token("keep-alive")
    }
}

/// HTTP サーバー
pub struct Server {
    listener: TcpListener,
    keep_alive_timeout: Duration,
    max_requests_per_connection: u32,
    read_buffer_size: usize,
    parser_limits: ParserLimits,
}

impl Server {
    /// 指定アドレスにバインド
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            keep_alive_timeout: Duration::from_secs(60),
            max_requests_per_connection: 1000,
            read_buffer_size: 8192,
            parser_limits: ParserLimits::default(),
        })
    }

    /// Keep-Alive タイムアウトを設定
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// 1 接続あたりの最大リクエスト数を設定
    pub fn max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    /// 読み取りバッファサイズを設定
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// リクエストヘッダーの制限を設定
    pub fn parser_limits(mut self, limits: ParserLimits) -> Self {
        self.parser_limits = limits;
        self
    }

    /// ローカルアドレスを取得
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// サーバーを起動
    pub async fn serve<H: Handler>(self, handler: H) -> Result<()> {
        let config = Rc::new(self.connection_config());
        let handler = Rc::new(handler);
        LocalSet::new()
            .run_until(accept_loop(self.listener, config, handler))
            .await
    }

    /// 単一の接続を処理 (テスト用)
    pub async fn handle_one<H: Handler>(self, handler: H) -> Result<()> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let config = self.connection_config();
        handle_connection(stream, peer_addr, &config, &handler).await
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_timeout: self.keep_alive_timeout,
            max_requests_per_connection: self.max_requests_per_connection,
            read_buffer_size: self.read_buffer_size,
            parser: HeaderBlockParser::new()
                .with_limits(self.parser_limits.clone())
                .require_header(false),
        }
    }
}

struct ConnectionConfig {
    keep_alive_timeout: Duration,
    max_requests_per_connection: u32,
    read_buffer_size: usize,
    parser: HeaderBlockParser,
}

impl ConnectionConfig {
    fn max_head_size(&self) -> usize {
        self.parser
            .limits()
            .max_header_block_size
            .saturating_add(MAX_REQUEST_LINE)
    }
}

async fn accept_loop<H: Handler>(
    listener: TcpListener,
    config: Rc<ConnectionConfig>,
    handler: Rc<H>,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        trace!(%peer_addr, "accepted");
        let config = config.clone();
        let handler = handler.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = handle_connection(stream, peer_addr, &config, handler.as_ref()).await
            {
                warn!(%peer_addr, error = %e, "connection error");
            }
        });
    }
}

/// HTTP 接続を処理
async fn handle_connection<H: Handler>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ConnectionConfig,
    handler: &H,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let stream = Rc::new(stream);
    let mut buf = Vec::with_capacity(config.read_buffer_size);
    let mut request_count = 0u32;

    loop {
        let Some(head_len) = read_head(&stream, &mut buf, config).await? else {
            return Ok(()); // 接続が閉じられた
        };
        request_count += 1;

        let mut response = HttpResponse::new(TcpTransport::new(stream.clone()));
        let Some((request, _)) = parse_request(&buf[..head_len], &config.parser)? else {
            return Err(Error::InvalidRequestLine);
        };
        debug!(
            %peer_addr,
            method = request.method(),
            target = request.target(),
            "request"
        );

        let keep_alive =
            request.is_keep_alive() && request_count < config.max_requests_per_connection;
        if !keep_alive {
            response.close_connection();
        }

        let body_len = if request.header("transfer-encoding").is_some() {
            response
                .write_status("501 Not Implemented")
                .close_connection();
            response.end(b"");
            None
        } else {
            match request.content_length() {
                Ok(len) => {
                    handler.handle(&request, &mut response);
                    Some(len.unwrap_or(0))
                }
                Err(e) => {
                    debug!(%peer_addr, error = %e, "bad request");
                    response.write_status("400 Bad Request").close_connection();
                    response.end(b"");
                    None
                }
            }
        };
        drop(request);
        buf.drain(..head_len);

        match body_len {
            Some(len) => read_body(&stream, &mut buf, config, &mut response, len).await?,
            // ボディの長さが分からないので接続を再利用しない
            None => buf.clear(),
        }

        if !drain_response(&stream, config, &mut response, peer_addr).await? {
            return Ok(());
        }

        if body_len.is_none() || response.is_close_connection() {
            response.transport().close_write()?;
            return Ok(());
        }
    }
}

/// ヘッダーブロックの終わりまで読み込み、その長さを返す
///
/// リクエストの前に接続が閉じられた場合は `None`。
async fn read_head(
    stream: &TcpStream,
    buf: &mut Vec<u8>,
    config: &ConnectionConfig,
) -> Result<Option<usize>> {
    loop {
        if let Some(len) = parse_request(buf, &config.parser)?.map(|(_, len)| len) {
            return Ok(Some(len));
        }
        if buf.len() > config.max_head_size() {
            return Err(Error::RequestTooLarge(buf.len()));
        }

        let read = tokio::time::timeout(
            config.keep_alive_timeout,
            read_more(stream, buf, config.read_buffer_size),
        )
        .await;
        let n = match read {
            Ok(n) => n?,
            // 次のリクエストを待っている間のタイムアウトは正常終了
            Err(_) if buf.is_empty() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Content-Length 分のボディを読み込んでレスポンスに届ける
async fn read_body(
    stream: &TcpStream,
    buf: &mut Vec<u8>,
    config: &ConnectionConfig,
    response: &mut HttpResponse<TcpTransport>,
    len: u64,
) -> Result<()> {
    if len == 0 {
        response.handle_data(&[], true);
        return Ok(());
    }

    let mut remaining = len;
    while remaining > 0 {
        if buf.is_empty() {
            let n = tokio::time::timeout(
                config.keep_alive_timeout,
                read_more(stream, buf, config.read_buffer_size),
            )
            .await??;
            if n == 0 {
                response.handle_aborted();
                return Err(Error::ConnectionClosed);
            }
        }
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        remaining -= n as u64;
        response.handle_data(&buf[..n], remaining == 0);
        buf.drain(..n);
    }
    Ok(())
}

/// レスポンスの送信が終わるまで書き込み可能通知を届ける
///
/// 送信を終えた場合に true を返す。
async fn drain_response(
    stream: &TcpStream,
    config: &ConnectionConfig,
    response: &mut HttpResponse<TcpTransport>,
    peer_addr: SocketAddr,
) -> Result<bool> {
    loop {
        if let Some(kind) = response.transport().error() {
            response.handle_aborted();
            return Err(Error::Io(io::Error::from(kind)));
        }
        if response.state() == SinkState::Aborted {
            return Ok(false);
        }
        // 送信待ちがすべて流れると、レスポンスがトランスポートを shutdown する
        if response.transport().is_finished() {
            return Ok(true);
        }
        if response.buffered_amount() == 0 && !response.has_writable_handler() {
            warn!(%peer_addr, state = %response.state(), "response was not ended");
            response.handle_aborted();
            return Ok(false);
        }

        if tokio::time::timeout(config.keep_alive_timeout, stream.writable())
            .await
            .is_err()
        {
            response.handle_aborted();
            return Err(Error::Timeout);
        }
        trace!(buffered = response.buffered_amount(), "writable");
        response.handle_writable();
    }
}

/// 読み込めるだけ読み込み、読み込んだバイト数を返す
async fn read_more(stream: &TcpStream, buf: &mut Vec<u8>, size: usize) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        let start = buf.len();
        buf.resize(start + size, 0);
        match stream.try_read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => buf.truncate(start),
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        }
    }
}

/// リクエスト行とヘッダーブロックをパースする
///
/// 入力が足りない場合は `None`。
fn parse_request<'a>(
    input: &'a [u8],
    parser: &HeaderBlockParser,
) -> Result<Option<(Request<'a>, usize)>> {
    let Some(line_end) = memmem::find(input, b"\r\n") else {
        if input.len() > MAX_REQUEST_LINE {
            return Err(Error::RequestTooLarge(input.len()));
        }
        return Ok(None);
    };
    let (method, target, minor_version) = parse_request_line(&input[..line_end])?;

    let rest = &input[line_end + 2..];
    match parser.parse(rest) {
        Ok((headers, consumed)) => Ok(Some((
            Request {
                method,
                target,
                minor_version,
                headers,
            },
            line_end + 2 + consumed,
        ))),
        Err(HeaderError::Truncated) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_request_line(line: &[u8]) -> Result<(&str, &str, u8)> {
    let line = std::str::from_utf8(line).map_err(|_| Error::InvalidRequestLine)?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::InvalidRequestLine);
    };
    if method.is_empty() || !method.bytes().all(is_method_char) || target.is_empty() {
        return Err(Error::InvalidRequestLine);
    }
    let minor_version = match version {
        "HTTP/1.1" => 1,
        "HTTP/1.0" => 0,
        _ => return Err(Error::InvalidRequestLine),
    };
    Ok((method, target, minor_version))
}

fn is_method_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
