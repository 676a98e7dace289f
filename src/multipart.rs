//! multipart ボディパース (RFC 2046 / RFC 7578)
//!
//! ## 概要
//!
//! `Content-Type: multipart/...; boundary=...` の境界でリクエストボディをパートに分割します。
//!
//! - パートのヘッダーは [`HeaderBlockParser`] でパース (ヘッダーなしのパートも許容)
//! - パートのヘッダー値とボディは元のボディへの参照で、コピーしない
//! - 1 回のパスで先頭から順に取り出す
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::multipart::MultipartParser;
//!
//! let body = b"--boundary\r\n\
//!     Content-Disposition: form-data; name=\"field1\"\r\n\r\n\
//!     value1\r\n\
//!     --boundary--\r\n";
//!
//! let mut parser = MultipartParser::new("multipart/form-data; boundary=boundary");
//! assert!(parser.is_valid());
//! parser.set_body(body).unwrap();
//!
//! while let Some(part) = parser.next_part().unwrap() {
//!     assert_eq!(part.name().as_deref(), Some("field1"));
//!     assert_eq!(part.body(), b"value1");
//! }
//! ```

use std::borrow::Cow;

use core::fmt;

use memchr::memmem;
use tracing::debug;

use crate::header::{HeaderBlockParser, HeaderError, HeaderSet};
use crate::limits::ParserLimits;

/// 境界文字列の最大長 (RFC 2046)
pub const MAX_BOUNDARY_LEN: usize = 70;

/// multipart パースエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    /// Content-Type が multipart ではない
    NotMultipart,
    /// boundary パラメータがない、または長さが不正
    InvalidBoundary,
    /// ボディが既に設定されている
    BodyAlreadySet,
    /// パートが短すぎる
    InvalidPart,
    /// パートのヘッダーが不正
    InvalidHeader(HeaderError),
    /// 次の境界が見つからない
    Incomplete,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultipartError::NotMultipart => write!(f, "content type is not multipart"),
            MultipartError::InvalidBoundary => write!(f, "invalid boundary"),
            MultipartError::BodyAlreadySet => write!(f, "multipart body already set"),
            MultipartError::InvalidPart => write!(f, "invalid part"),
            MultipartError::InvalidHeader(e) => write!(f, "invalid part header: {}", e),
            MultipartError::Incomplete => write!(f, "incomplete multipart data"),
        }
    }
}

impl std::error::Error for MultipartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MultipartError::InvalidHeader(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HeaderError> for MultipartError {
    fn from(e: HeaderError) -> Self {
        MultipartError::InvalidHeader(e)
    }
}

/// multipart のパート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part<'a> {
    headers: HeaderSet<'a>,
    body: &'a [u8],
}

impl<'a> Part<'a> {
    /// ヘッダーを取得
    pub fn headers(&self) -> &HeaderSet<'a> {
        &self.headers
    }

    /// ボディを取得
    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// ボディを文字列として取得
    pub fn body_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.body).ok()
    }

    /// Content-Disposition の name パラメータを取得
    pub fn name(&self) -> Option<Cow<'a, str>> {
        self.disposition_param("name")
    }

    /// Content-Disposition の filename パラメータを取得
    pub fn filename(&self) -> Option<Cow<'a, str>> {
        self.disposition_param("filename")
    }

    /// Content-Type ヘッダーを取得
    pub fn content_type(&self) -> Option<&'a str> {
        self.headers.get_str("content-type")
    }

    /// ファイルパートかどうか
    pub fn is_file(&self) -> bool {
        self.filename().is_some()
    }

    fn disposition_param(&self, name: &str) -> Option<Cow<'a, str>> {
        let value = self.headers.get_str("content-disposition")?;
        find_param(value, name)
    }
}

/// multipart ボディパーサー
#[derive(Debug, Clone)]
pub struct MultipartParser<'a> {
    /// `--` + boundary
    delimiter: Option<Vec<u8>>,
    /// Content-Type の検査結果
    error: Option<MultipartError>,
    header_parser: HeaderBlockParser,
    body: Option<&'a [u8]>,
    pos: usize,
    started: bool,
    finished: bool,
}

impl<'a> MultipartParser<'a> {
    /// Content-Type ヘッダー値からパーサーを作成
    ///
    /// boundary が見つからない場合もパーサーは作成され、
    /// [`is_valid`](Self::is_valid) が false を返す。
    pub fn new(content_type: &str) -> Self {
        let (delimiter, error) = match parse_boundary(content_type) {
            Ok(boundary) => {
                let mut delimiter = Vec::with_capacity(boundary.len() + 2);
                delimiter.extend_from_slice(b"--");
                delimiter.extend_from_slice(boundary);
                (Some(delimiter), None)
            }
            Err(e) => {
                debug!(error = %e, "multipart content type rejected");
                (None, Some(e))
            }
        };

        Self {
            delimiter,
            error,
            header_parser: HeaderBlockParser::for_multipart(),
            body: None,
            pos: 0,
            started: false,
            finished: false,
        }
    }

    /// パートヘッダーの制限を設定
    pub fn with_limits(mut self, limits: ParserLimits) -> Self {
        self.header_parser = self.header_parser.with_limits(limits);
        self
    }

    /// 有効な boundary が見つかったかどうか
    pub fn is_valid(&self) -> bool {
        self.delimiter.is_some()
    }

    /// Content-Type の検査エラーを取得
    pub fn error(&self) -> Option<&MultipartError> {
        self.error.as_ref()
    }

    /// boundary を取得
    pub fn boundary(&self) -> Option<&[u8]> {
        self.delimiter.as_deref().map(|d| &d[2..])
    }

    /// ボディを設定
    ///
    /// パートを取り出す前に 1 回だけ呼び出せる。
    pub fn set_body(&mut self, body: &'a [u8]) -> Result<(), MultipartError> {
        if self.body.is_some() {
            return Err(MultipartError::BodyAlreadySet);
        }
        self.body = Some(body);
        Ok(())
    }

    /// すべてのパートを取り出し終えたかどうか
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 次のパートを取得
    ///
    /// パートがもうない場合は `Ok(None)` を返す。
    /// エラーを返した後は常に `Ok(None)` を返す。
    pub fn next_part(&mut self) -> Result<Option<Part<'a>>, MultipartError> {
        let Some(delimiter) = self.delimiter.as_deref() else {
            return Err(self
                .error
                .clone()
                .unwrap_or(MultipartError::InvalidBoundary));
        };
        if self.finished {
            return Ok(None);
        }

        let body = self.body.unwrap_or_default();
        let mut remaining = &body[self.pos..];
        if remaining.len() < delimiter.len() {
            self.finished = true;
            return Ok(None);
        }

        if !self.started {
            // プリアンブルを読み飛ばす
            let Some(i) = memmem::find(remaining, delimiter) else {
                self.finished = true;
                return Err(MultipartError::Incomplete);
            };
            self.pos += i + delimiter.len();
            self.started = true;
            remaining = &body[self.pos..];
        }

        // 終了境界 (`--boundary--`)
        if remaining.starts_with(b"--") {
            self.finished = true;
            return Ok(None);
        }

        let Some(end) = memmem::find(remaining, delimiter) else {
            self.finished = true;
            return Err(MultipartError::Incomplete);
        };
        let candidate = &remaining[..end];
        self.pos += end + delimiter.len();

        // 前後の CRLF を取り除く
        if candidate.len() < 4 {
            self.finished = true;
            return Err(MultipartError::InvalidPart);
        }
        let inner = &candidate[2..candidate.len() - 2];

        let (headers, consumed) = match self.header_parser.parse(inner) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "multipart part header rejected");
                self.finished = true;
                return Err(MultipartError::InvalidHeader(e));
            }
        };

        Ok(Some(Part {
            headers,
            body: &inner[consumed..],
        }))
    }
}

/// Content-Type から boundary を取り出す
fn parse_boundary(content_type: &str) -> Result<&[u8], MultipartError> {
    let bytes = content_type.as_bytes();
    const PREFIX: &[u8] = b"multipart/";
    if bytes.len() < PREFIX.len() || !bytes[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return Err(MultipartError::NotMultipart);
    }

    let params = &content_type[PREFIX.len()..];
    let value = find_param(params, "boundary").ok_or(MultipartError::InvalidBoundary)?;
    let Cow::Borrowed(value) = value else {
        // エスケープを含む boundary は扱わない
        return Err(MultipartError::InvalidBoundary);
    };
    if value.is_empty() || value.len() > MAX_BOUNDARY_LEN {
        return Err(MultipartError::InvalidBoundary);
    }
    Ok(value.as_bytes())
}

/// `;` 区切りのパラメータから値を探す
///
/// 値は引用符付き文字列でもよい。エスケープを含む場合のみ所有した文字列を返す。
fn find_param<'a>(input: &'a str, name: &str) -> Option<Cow<'a, str>> {
    let mut rest = input;
    loop {
        let (param, next) = split_param(rest);
        if let Some((key, value)) = param.split_once('=')
            && key.trim().eq_ignore_ascii_case(name)
        {
            return parse_param_value(value.trim());
        }
        rest = next?;
    }
}

/// 引用符内の `;` を無視して最初のパラメータを切り出す
fn split_param(input: &str) -> (&str, Option<&str>) {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return (&input[..i], Some(&input[i + 1..])),
            _ => {}
        }
    }
    (input, None)
}

/// パラメータ値をパース (引用符付きまたはトークン)
fn parse_param_value(value: &str) -> Option<Cow<'_, str>> {
    let Some(quoted) = value.strip_prefix('"') else {
        return Some(Cow::Borrowed(value));
    };
    let inner = quoted.strip_suffix('"')?;
    if !inner.contains('\\') {
        return Some(Cow::Borrowed(inner));
    }

    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            result.push(chars.next()?);
        } else {
            result.push(c);
        }
    }
    Some(Cow::Owned(result))
}

/// multipart ボディビルダーに追加するパート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl FormPart {
    /// ヘッダーなしのパートを作成
    pub fn empty() -> Self {
        FormPart {
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// form-data のパートを作成
    pub fn new(name: &str) -> Self {
        Self::empty().with_header(
            "Content-Disposition",
            &format!("form-data; name=\"{}\"", quote(name)),
        )
    }

    /// ファイルパートを作成
    pub fn file(name: &str, filename: &str, content_type: &str) -> Self {
        Self::empty()
            .with_header(
                "Content-Disposition",
                &format!(
                    "form-data; name=\"{}\"; filename=\"{}\"",
                    quote(name),
                    quote(filename)
                ),
            )
            .with_header("Content-Type", content_type)
    }

    /// ヘッダーを追加
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// ボディを設定
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    /// ヘッダーを取得
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// ボディを取得
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// multipart ボディビルダー
#[derive(Debug, Clone)]
pub struct MultipartBuilder {
    boundary: String,
    parts: Vec<FormPart>,
}

impl MultipartBuilder {
    /// 乱数値を受け取って境界を生成する
    ///
    /// Sans I/O の原則に従い、乱数生成は呼び出し側の責任となる。
    ///
    /// ```
    /// use shiguredo_http_proto::multipart::MultipartBuilder;
    ///
    /// let builder = MultipartBuilder::new(12345678901234567890);
    /// assert!(builder.boundary().starts_with("----FormBoundary"));
    /// ```
    pub fn new(random_value: u64) -> Self {
        Self::with_boundary(&format!("----FormBoundary{}", random_value))
    }

    /// 境界を指定して作成
    pub fn with_boundary(boundary: &str) -> Self {
        MultipartBuilder {
            boundary: boundary.to_string(),
            parts: Vec::new(),
        }
    }

    /// 境界文字列を取得
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Content-Type ヘッダー値を取得
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// テキストフィールドを追加
    pub fn text_field(self, name: &str, value: &str) -> Self {
        self.part(FormPart::new(name).with_body(value.as_bytes()))
    }

    /// ファイルフィールドを追加
    pub fn file_field(self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.part(FormPart::file(name, filename, content_type).with_body(data))
    }

    /// パートを追加
    pub fn part(mut self, part: FormPart) -> Self {
        self.parts.push(part);
        self
    }

    /// ボディをビルド
    pub fn build(&self) -> Vec<u8> {
        let delimiter_len = self.boundary.len() + 4;
        let capacity = self
            .parts
            .iter()
            .map(|p| delimiter_len + p.encoded_len() + 2)
            .sum::<usize>()
            + delimiter_len
            + 2;

        let mut out = Vec::with_capacity(capacity);
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            part.encode_into(&mut out);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }
}

impl FormPart {
    /// ヘッダー、空行、ボディの順に書き出す
    fn encode_into(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }

    fn encoded_len(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(n, v)| n.len() + v.len() + 4).sum();
        headers + 2 + self.body.len()
    }
}

/// 引用符付き文字列用に `"` と `\` をエスケープ
fn quote(s: &str) -> String {
    s.chars().fold(String::with_capacity(s.len() + 2), |mut acc, c| {
        if matches!(c, '"' | '\\') {
            acc.push('\\');
        }
        acc.push(c);
        acc
    })
}
