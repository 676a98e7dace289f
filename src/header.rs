//! ヘッダーブロックパース (RFC 9110 Section 5 / RFC 9112 Section 5)
//!
//! ## 概要
//!
//! `Name: Value\r\n` の繰り返しと終端の空行 `\r\n` からなるヘッダーブロックを
//! 入力バッファを借用したまま分解します。HTTP リクエストヘッダーと
//! multipart パートヘッダーの両方で使われます。
//!
//! - ヘッダー名はパース時に小文字化されるため、検索は大文字小文字を区別しない
//! - 値の前後の SP / HTAB は取り除かれる
//! - 格納数の上限を超えた場合は切り捨てずにエラーになる
//! - どんなバイト列を与えてもパニックしない (境界外読み込みなし)
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::header::{HeaderBlockParser, HeaderSet};
//!
//! let block = b"Host: example.com\r\nContent-Type: text/plain\r\n\r\nbody";
//!
//! let mut headers = HeaderSet::new();
//! let consumed = HeaderBlockParser::new().parse_into(block, &mut headers).unwrap();
//!
//! assert_eq!(consumed, block.len() - 4);
//! assert_eq!(headers.get_str("content-type"), Some("text/plain"));
//! assert_eq!(headers.get_str("HOST"), Some("example.com"));
//! ```

use core::fmt;
use std::borrow::Cow;

use crate::limits::ParserLimits;

/// ヘッダーブロックパースエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// 終端の空行に到達する前に入力が尽きた
    Truncated,
    /// ヘッダー名が空、または token 以外の文字を含む
    InvalidName,
    /// ヘッダー名の直後が `:` ではない
    MissingColon,
    /// ヘッダー値に不正な制御文字が含まれる
    InvalidValue,
    /// `\r` の後に `\n` が続かない
    InvalidLineEnding,
    /// ヘッダーが 1 つもない (ヘッダー必須の場合)
    NoHeaders,
    /// ヘッダー数超過
    TooManyHeaders { limit: usize },
    /// ヘッダーブロックが大きすぎる
    TooLarge { size: usize, limit: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::Truncated => write!(f, "truncated header block"),
            HeaderError::InvalidName => write!(f, "invalid header name"),
            HeaderError::MissingColon => write!(f, "missing colon after header name"),
            HeaderError::InvalidValue => write!(f, "invalid header value"),
            HeaderError::InvalidLineEnding => write!(f, "invalid line ending in header block"),
            HeaderError::NoHeaders => write!(f, "header block has no headers"),
            HeaderError::TooManyHeaders { limit } => {
                write!(f, "too many headers: limit is {}", limit)
            }
            HeaderError::TooLarge { size, limit } => {
                write!(f, "header block too large: {} > {}", size, limit)
            }
        }
    }
}

impl std::error::Error for HeaderError {}

/// 入力バッファを借用したヘッダー 1 つ
///
/// 名前は小文字化済み。元から小文字であれば入力をそのまま借用する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderView<'a> {
    name: Cow<'a, str>,
    value: &'a [u8],
}

impl<'a> HeaderView<'a> {
    /// ヘッダー名 (小文字)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ヘッダー値 (前後の空白は除去済み)
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// ヘッダー値を文字列として取得
    pub fn value_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.value).ok()
    }
}

/// 容量固定の順序付きヘッダー列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSet<'a> {
    headers: Vec<HeaderView<'a>>,
    capacity: usize,
}

impl Default for HeaderSet<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> HeaderSet<'a> {
    /// デフォルトの容量
    pub const DEFAULT_CAPACITY: usize = 10;

    /// デフォルト容量 (10) で作成
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// 容量を指定して作成
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            // 巨大な容量指定でいきなり確保しないよう上限を設ける
            headers: Vec::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// 制限設定から作成
    pub fn with_limits(limits: &ParserLimits) -> Self {
        Self::with_capacity(limits.max_headers)
    }

    /// 格納できるヘッダー数
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 格納済みヘッダー数
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// すべて取り除く (容量は維持)
    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// ヘッダーを順に走査
    pub fn iter(&self) -> std::slice::Iter<'_, HeaderView<'a>> {
        self.headers.iter()
    }

    /// ヘッダー値を取得 (大文字小文字を区別しない、最初の一致)
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }

    /// ヘッダー値を文字列として取得
    pub fn get_str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// 指定した名前のヘッダー値をすべて取得
    pub fn get_all(&self, name: &str) -> Vec<&'a [u8]> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
            .collect()
    }

    /// ヘッダーが存在するか確認
    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    fn push(&mut self, header: HeaderView<'a>) -> Result<(), HeaderError> {
        if self.headers.len() >= self.capacity {
            return Err(HeaderError::TooManyHeaders {
                limit: self.capacity,
            });
        }
        self.headers.push(header);
        Ok(())
    }
}

impl<'s, 'a> IntoIterator for &'s HeaderSet<'a> {
    type Item = &'s HeaderView<'a>;
    type IntoIter = std::slice::Iter<'s, HeaderView<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

/// ヘッダーブロックパーサー
///
/// HTTP 用途ではヘッダーが最低 1 つ必要 (`new`)、multipart 用途ではヘッダーなしの
/// パートを許容する (`for_multipart`)。この非対称性は意図したもの。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlockParser {
    limits: ParserLimits,
    require_header: bool,
}

impl Default for HeaderBlockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderBlockParser {
    /// HTTP ヘッダー用のパーサーを作成 (ヘッダー必須)
    pub fn new() -> Self {
        Self {
            limits: ParserLimits::default(),
            require_header: true,
        }
    }

    /// multipart パートヘッダー用のパーサーを作成 (ヘッダーなしを許容)
    pub fn for_multipart() -> Self {
        Self {
            limits: ParserLimits::default(),
            require_header: false,
        }
    }

    /// 制限設定を指定
    pub fn with_limits(mut self, limits: ParserLimits) -> Self {
        self.limits = limits;
        self
    }

    /// ヘッダー必須かどうかを指定
    pub fn require_header(mut self, require: bool) -> Self {
        self.require_header = require;
        self
    }

    /// 制限設定を取得
    pub fn limits(&self) -> &ParserLimits {
        &self.limits
    }

    /// ヘッダーブロックをパースして、ヘッダー列と消費バイト数を返す
    ///
    /// 消費バイト数は終端の空行 `\r\n` を含む。
    pub fn parse<'a>(&self, input: &'a [u8]) -> Result<(HeaderSet<'a>, usize), HeaderError> {
        let mut headers = HeaderSet::with_limits(&self.limits);
        let consumed = self.parse_into(input, &mut headers)?;
        Ok((headers, consumed))
    }

    /// 既存のヘッダー列に書き込みながらパースする
    ///
    /// 格納数の上限は `headers` の容量に従う。エラー時に `headers` の中身は
    /// 途中までの結果が残るため、呼び出し側は破棄すること。
    pub fn parse_into<'a>(
        &self,
        input: &'a [u8],
        headers: &mut HeaderSet<'a>,
    ) -> Result<usize, HeaderError> {
        parse_block(
            input,
            headers,
            self.require_header,
            self.limits.max_header_block_size,
        )
    }
}

/// ヘッダーブロックをパース (デフォルトのサイズ上限)
///
/// `require_header` が true の場合、ヘッダーが 1 つもないブロックはエラーになる。
pub fn parse_header_block<'a>(
    input: &'a [u8],
    headers: &mut HeaderSet<'a>,
    require_header: bool,
) -> Result<usize, HeaderError> {
    parse_block(
        input,
        headers,
        require_header,
        ParserLimits::default().max_header_block_size,
    )
}

fn parse_block<'a>(
    input: &'a [u8],
    headers: &mut HeaderSet<'a>,
    require_header: bool,
    max_size: usize,
) -> Result<usize, HeaderError> {
    let mut pos = 0;

    loop {
        // 終端の空行
        if input.get(pos) == Some(&b'\r') {
            return match input.get(pos + 1) {
                Some(b'\n') => {
                    if require_header && headers.is_empty() {
                        return Err(HeaderError::NoHeaders);
                    }
                    let consumed = pos + 2;
                    check_size(consumed, max_size)?;
                    Ok(consumed)
                }
                Some(_) => Err(HeaderError::InvalidLineEnding),
                None => Err(HeaderError::Truncated),
            };
        }

        let (header, next) = parse_line(input, pos)?;
        check_size(next, max_size)?;
        headers.push(header)?;
        pos = next;
    }
}

/// 1 行分のヘッダーをパースし、次の行の開始位置を返す
fn parse_line(input: &[u8], start: usize) -> Result<(HeaderView<'_>, usize), HeaderError> {
    let mut pos = start;

    // ヘッダー名: コロンの前に空白は許可しない
    while pos < input.len() && is_token_char(input[pos]) {
        pos += 1;
    }
    if pos >= input.len() {
        return Err(HeaderError::Truncated);
    }
    if pos == start {
        return Err(HeaderError::InvalidName);
    }
    if input[pos] != b':' {
        return Err(HeaderError::MissingColon);
    }
    let name = lowercase_name(&input[start..pos])?;
    pos += 1;

    // ヘッダー値: HTAB 以外の制御文字は不正
    let value_start = pos;
    loop {
        match input.get(pos) {
            None => return Err(HeaderError::Truncated),
            Some(b'\r') => break,
            Some(b'\t') => pos += 1,
            Some(&b) if b < 0x20 => return Err(HeaderError::InvalidValue),
            Some(_) => pos += 1,
        }
    }
    match input.get(pos + 1) {
        Some(b'\n') => {}
        Some(_) => return Err(HeaderError::InvalidLineEnding),
        None => return Err(HeaderError::Truncated),
    }

    let value = trim_whitespace(&input[value_start..pos]);
    Ok((HeaderView { name, value }, pos + 2))
}

fn check_size(size: usize, limit: usize) -> Result<(), HeaderError> {
    if size > limit {
        return Err(HeaderError::TooLarge { size, limit });
    }
    Ok(())
}

fn lowercase_name(name: &[u8]) -> Result<Cow<'_, str>, HeaderError> {
    let name = std::str::from_utf8(name).map_err(|_| HeaderError::InvalidName)?;
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        Ok(Cow::Owned(name.to_ascii_lowercase()))
    } else {
        Ok(Cow::Borrowed(name))
    }
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

pub(crate) fn is_token_char(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}
